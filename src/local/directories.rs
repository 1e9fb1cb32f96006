//! On-disk layout used to publish and find local nodes.
//!
//! ```text
//! <run dir>/transport/local/
//!     by-nodeid/<NodeID>.pid  <NodeID>.info
//!     by-nodename/<NodeName>.pid  <NodeName>.info
//!     socket/<random>.sock
//! ```
//!
//! The private run directory belongs to the current user. Public run
//! directories live under a shared root, one per user, so nodes can be
//! reached by other accounts.

use tracing::*;

use std::collections::BTreeMap;
use std::ffi::CStr;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::msg::NodeId;
use crate::{Error, Result};

/// Longest socket path the platform accepts, terminator included
#[cfg(target_os = "linux")]
pub const UNIX_PATH_MAX: usize = 108;
#[cfg(not(target_os = "linux"))]
pub const UNIX_PATH_MAX: usize = 104;

/// Run directories of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDirectories {
    /// Private per-user run directory
    pub user_run_dir: PathBuf,
    /// Shared root holding one public run directory per user
    pub public_run_root: PathBuf,
    pub username: String,
}

impl Default for NodeDirectories {
    fn default() -> Self {
        let uid = unsafe { libc::getuid() };
        let user_run_dir = match std::env::var_os("XDG_RUNTIME_DIR") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("robotraconteur"),
            _ => PathBuf::from(format!("/tmp/robotraconteur-run-{}", uid)),
        };
        NodeDirectories {
            user_run_dir,
            public_run_root: PathBuf::from("/tmp/.robotraconteur"),
            username: current_username(),
        }
    }
}

impl NodeDirectories {
    /// Directories rooted at `root`, useful for tests and sandboxes
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        NodeDirectories {
            user_run_dir: root.join("run"),
            public_run_root: root.join("public"),
            username: current_username(),
        }
    }

    pub fn private_transport_dir(&self) -> TransportDir {
        TransportDir::new(self.user_run_dir.join("transport").join("local"))
    }

    pub fn public_transport_dir(&self, username: &str) -> TransportDir {
        TransportDir::new(
            self.public_run_root
                .join(username)
                .join("transport")
                .join("local"),
        )
    }

    /// Public directories of every user that has one
    pub fn all_public_transport_dirs(&self) -> Vec<(String, TransportDir)> {
        let entries = match fs::read_dir(&self.public_run_root) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .map(|user| {
                let dir = self.public_transport_dir(&user);
                (user, dir)
            })
            .collect()
    }
}

/// Name of the account running this process
pub fn current_username() -> String {
    let uid = unsafe { libc::getuid() };
    let mut buf = vec![0 as libc::c_char; 1024];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let ret = unsafe { libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result) };
    if ret == 0 && !result.is_null() && !pwd.pw_name.is_null() {
        let name = unsafe { CStr::from_ptr(pwd.pw_name) };
        if let Ok(name) = name.to_str() {
            return name.to_string();
        }
    }
    std::env::var("USER").unwrap_or_else(|_| uid.to_string())
}

/// One `transport/local` directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportDir {
    pub root: PathBuf,
}

impl TransportDir {
    pub fn new(root: PathBuf) -> Self {
        TransportDir { root }
    }

    pub fn by_node_id(&self) -> PathBuf {
        self.root.join("by-nodeid")
    }

    pub fn by_node_name(&self) -> PathBuf {
        self.root.join("by-nodename")
    }

    pub fn socket_dir(&self) -> PathBuf {
        self.root.join("socket")
    }

    pub fn node_id_file(&self, node_id: NodeId, ext: &str) -> PathBuf {
        self.by_node_id().join(format!("{}.{}", node_id, ext))
    }

    pub fn node_name_file(&self, node_name: &str, ext: &str) -> PathBuf {
        self.by_node_name().join(format!("{}.{}", node_name, ext))
    }

    /// Create every subdirectory, failing with `SystemResource`
    pub fn create_all(&self) -> Result<()> {
        for dir in [self.by_node_id(), self.by_node_name(), self.socket_dir()] {
            fs::create_dir_all(&dir).map_err(|e| {
                Error::SystemResource(format!("Could not create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }
}

/// Contents of a `.info` file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfoFile {
    pub node_id: NodeId,
    pub node_name: String,
    pub socket: PathBuf,
    pub service_state_nonce: String,
}

impl fmt::Display for NodeInfoFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "nodeid={}", self.node_id)?;
        writeln!(f, "nodename={}", self.node_name)?;
        writeln!(f, "socket={}", self.socket.display())?;
        writeln!(f, "ServiceStateNonce={}", self.service_state_nonce)
    }
}

impl FromStr for NodeInfoFile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let values: BTreeMap<&str, &str> = s
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();
        let node_id: NodeId = values
            .get("nodeid")
            .ok_or_else(|| Error::Protocol("Info file has no nodeid".into()))?
            .parse()?;
        let socket = values
            .get("socket")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Protocol("Info file has no socket".into()))?;
        Ok(NodeInfoFile {
            node_id,
            node_name: values.get("nodename").unwrap_or(&"").to_string(),
            socket: PathBuf::from(socket),
            service_state_nonce: values.get("ServiceStateNonce").unwrap_or(&"").to_string(),
        })
    }
}

impl NodeInfoFile {
    pub fn read(path: &Path) -> Result<Self> {
        fs::read_to_string(path)?.parse()
    }

    /// Replace `path` in one rename so readers never see a partial file
    pub fn write(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("info.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(self.to_string().as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        trace!("Wrote {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let info = NodeInfoFile {
            node_id: NodeId::new_random(),
            node_name: "alice".into(),
            socket: dir.path().join("abc.sock"),
            service_state_nonce: "n0nce".into(),
        };
        let path = dir.path().join("alice.info");
        info.write(&path).unwrap();
        assert_eq!(NodeInfoFile::read(&path).unwrap(), info);
    }

    #[test]
    fn info_files_need_an_id_and_a_socket() {
        assert!("nodename=alice\nsocket=/tmp/x".parse::<NodeInfoFile>().is_err());
        let id = NodeId::new_random();
        assert!(format!("nodeid={}", id).parse::<NodeInfoFile>().is_err());
    }

    #[test]
    fn layout_is_rooted_in_the_run_directory() {
        let dirs = NodeDirectories::new("/base");
        let private = dirs.private_transport_dir();
        assert_eq!(private.by_node_id(), Path::new("/base/run/transport/local/by-nodeid"));
        assert_eq!(
            dirs.public_transport_dir("bob").socket_dir(),
            Path::new("/base/public/bob/transport/local/socket")
        );
        assert_eq!(
            private.node_name_file("alice", "pid"),
            Path::new("/base/run/transport/local/by-nodename/alice.pid")
        );
    }
}
