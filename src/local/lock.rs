//! Exclusive ownership of NodeIDs and NodeNames.
//!
//! Two layers: a `NodeLockRegistry` shared by every transport created from
//! the same registry handle (in-process), and `flock`-held pid files in the
//! run directory (cross-process). The OS releases the file locks when a
//! process exits, so stale pid files never block a restart.

use tracing::*;

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::msg::NodeId;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LockKey {
    Id(NodeId),
    Name(String),
}

/// Process-wide set of claimed NodeIDs and NodeNames
#[derive(Debug, Default)]
pub struct NodeLockRegistry {
    held: Mutex<HashSet<LockKey>>,
}

impl NodeLockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(NodeLockRegistry::default())
    }

    fn acquire(self: &Arc<Self>, key: LockKey) -> Result<NodeLock> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| Error::InvalidOperation("Node lock registry poisoned".into()))?;
        if !held.insert(key.clone()) {
            return Err(match key {
                LockKey::Id(id) => Error::NodeIdAlreadyInUse(id.to_string()),
                LockKey::Name(name) => Error::NodeNameAlreadyInUse(name),
            });
        }
        Ok(NodeLock {
            registry: self.clone(),
            key,
        })
    }

    pub fn lock_node_id(self: &Arc<Self>, node_id: NodeId) -> Result<NodeLock> {
        self.acquire(LockKey::Id(node_id))
    }

    pub fn lock_node_name(self: &Arc<Self>, node_name: &str) -> Result<NodeLock> {
        self.acquire(LockKey::Name(node_name.to_string()))
    }

    pub fn is_node_id_locked(&self, node_id: NodeId) -> bool {
        self.held
            .lock()
            .map(|h| h.contains(&LockKey::Id(node_id)))
            .unwrap_or(false)
    }

    pub fn is_node_name_locked(&self, node_name: &str) -> bool {
        self.held
            .lock()
            .map(|h| h.contains(&LockKey::Name(node_name.to_string())))
            .unwrap_or(false)
    }
}

/// Claim on a NodeID or NodeName, released on drop
#[derive(Debug)]
pub struct NodeLock {
    registry: Arc<NodeLockRegistry>,
    key: LockKey,
}

impl Drop for NodeLock {
    fn drop(&mut self) {
        if let Ok(mut held) = self.registry.held.lock() {
            held.remove(&self.key);
        }
    }
}

fn try_flock(file: &File, operation: libc::c_int) -> std::io::Result<bool> {
    let ret = unsafe { libc::flock(file.as_raw_fd(), operation | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

const LOCK_ATTEMPTS: usize = 8;

/// Whether `file` is still the file linked at `path`
fn is_linked_at(file: &File, path: &Path) -> std::io::Result<bool> {
    let opened = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == opened.dev() && current.ino() == opened.ino()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// A pid file held under an exclusive `flock` for as long as it lives
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: File,
}

impl PidFile {
    /// Create or reuse `path` and lock it. `in_use` builds the error returned
    /// when another owner holds the lock.
    pub fn acquire(path: &Path, in_use: impl FnOnce() -> Error) -> Result<Self> {
        let system = |what: &str, e: std::io::Error| {
            Error::SystemResource(format!("Could not {} {}: {}", what, path.display(), e))
        };
        for _ in 0..LOCK_ATTEMPTS {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map_err(|e| system("open", e))?;
            match try_flock(&file, libc::LOCK_EX) {
                Ok(true) => {}
                Ok(false) => return Err(in_use()),
                Err(e) => return Err(system("lock", e)),
            }
            // The previous owner unlinks on release, so the file we opened may
            // no longer be the one at `path`
            if !is_linked_at(&file, path).map_err(|e| system("stat", e))? {
                trace!("{} was replaced while locking, retrying", path.display());
                continue;
            }
            file.set_len(0)?;
            writeln!(file, "{}", std::process::id())?;
            file.sync_all()?;
            trace!("Locked {}", path.display());
            return Ok(PidFile {
                path: path.to_path_buf(),
                file,
            });
        }
        Err(Error::SystemResource(format!(
            "Could not lock {}: file kept being replaced",
            path.display()
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Removed while still locked; the lock goes with `file`
        if let Err(e) = fs::remove_file(&self.path) {
            debug!("Could not remove {}: {}", self.path.display(), e);
        }
        let _ = self.file.set_len(0);
    }
}

/// Whether some live owner holds the pid file at `path`
pub fn pid_file_is_live(path: &Path) -> bool {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(_) => return false,
    };
    match try_flock(&file, libc::LOCK_SH) {
        Ok(true) => {
            unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
            false
        }
        Ok(false) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_second_claim_until_release() {
        let registry = NodeLockRegistry::new();
        let lock = registry.lock_node_name("alice").unwrap();
        assert!(matches!(
            registry.lock_node_name("alice"),
            Err(Error::NodeNameAlreadyInUse(_))
        ));
        assert!(registry.is_node_name_locked("alice"));
        drop(lock);
        assert!(!registry.is_node_name_locked("alice"));
        registry.lock_node_name("alice").unwrap();

        let id = NodeId::new_random();
        let _id_lock = registry.lock_node_id(id).unwrap();
        assert!(matches!(
            registry.lock_node_id(id),
            Err(Error::NodeIdAlreadyInUse(_))
        ));
    }

    #[test]
    fn pid_files_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.pid");
        let held = PidFile::acquire(&path, || Error::NodeNameAlreadyInUse("alice".into())).unwrap();
        assert!(pid_file_is_live(&path));
        assert!(matches!(
            PidFile::acquire(&path, || Error::NodeNameAlreadyInUse("alice".into())),
            Err(Error::NodeNameAlreadyInUse(_))
        ));
        drop(held);
        assert!(!path.exists());
        assert!(!pid_file_is_live(&path));
        PidFile::acquire(&path, || Error::NodeNameAlreadyInUse("alice".into())).unwrap();
    }

    #[test]
    fn unlinked_pid_files_are_not_mistaken_for_the_current_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.pid");
        let in_use = || Error::NodeNameAlreadyInUse("alice".into());
        let first = PidFile::acquire(&path, in_use).unwrap();
        // Opened before the owner releases and unlinks it
        let orphan = File::open(&path).unwrap();
        assert!(is_linked_at(&orphan, &path).unwrap());
        drop(first);
        assert!(!is_linked_at(&orphan, &path).unwrap());

        let second = PidFile::acquire(&path, in_use).unwrap();
        assert!(is_linked_at(&second.file, &path).unwrap());
        assert!(!is_linked_at(&orphan, &path).unwrap());
        // The orphan can be locked, but it no longer guards the name
        assert!(try_flock(&orphan, libc::LOCK_EX).unwrap());
        assert!(pid_file_is_live(&path));
    }

    #[test]
    fn stale_pid_files_are_not_live() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.pid");
        fs::write(&path, "12345\n").unwrap();
        assert!(!pid_file_is_live(&path));
    }
}
