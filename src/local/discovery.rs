//! Discovery of local nodes through their `.info` files.
//!
//! A `DirectoryWatcher` reports that something changed in the watched
//! directories; the loop then rescans every directory. Notifications are not
//! trusted to be complete, so the loop also rescans every `discovery_rescan`
//! even when the watcher stays silent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{sleep, timeout, Duration};
use tracing::*;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use crate::local::directories::{NodeDirectories, NodeInfoFile, TransportDir};
use crate::local::lock::pid_file_is_live;
use crate::local::url::LocalUrl;
use crate::msg::NodeId;
use crate::node::{NodeContext, NodeDiscoveryInfo};
use crate::Result;

/// Source of "something changed" events for a set of directories.
///
/// Directories may not exist yet, or may disappear and come back; a watcher
/// picks them up again without failing.
#[async_trait]
pub trait DirectoryWatcher: Send {
    /// Replace the set of watched directories
    fn watch(&mut self, paths: &[PathBuf]);

    /// Resolve on the next change in any watched directory
    async fn changed(&mut self) -> Result<()>;
}

type Snapshot = BTreeMap<PathBuf, Option<SystemTime>>;

/// Portable watcher comparing directory snapshots on a fixed interval
#[derive(Debug)]
pub struct PollingWatcher {
    paths: Vec<PathBuf>,
    interval: Duration,
    last: Snapshot,
}

impl PollingWatcher {
    pub fn new(interval: Duration) -> Self {
        PollingWatcher {
            paths: Vec::new(),
            interval,
            last: Snapshot::new(),
        }
    }

    fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::new();
        for dir in &self.paths {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let modified = entry.metadata().and_then(|m| m.modified()).ok();
                snapshot.insert(entry.path(), modified);
            }
        }
        snapshot
    }
}

#[async_trait]
impl DirectoryWatcher for PollingWatcher {
    fn watch(&mut self, paths: &[PathBuf]) {
        if self.paths != paths {
            self.paths = paths.to_vec();
            self.last = self.snapshot();
        }
    }

    async fn changed(&mut self) -> Result<()> {
        loop {
            sleep(self.interval).await;
            let snapshot = self.snapshot();
            if snapshot != self.last {
                self.last = snapshot;
                return Ok(());
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use inotify::InotifyWatcher;

#[cfg(target_os = "linux")]
mod inotify {
    use super::*;
    use tokio::io::unix::AsyncFd;
    use tokio::io::Interest;

    use std::ffi::CString;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    const WATCH_MASK: u32 = libc::IN_CREATE
        | libc::IN_DELETE
        | libc::IN_MODIFY
        | libc::IN_CLOSE_WRITE
        | libc::IN_MOVED_FROM
        | libc::IN_MOVED_TO
        | libc::IN_DELETE_SELF
        | libc::IN_MOVE_SELF;
    const GONE_MASK: u32 = libc::IN_IGNORED | libc::IN_DELETE_SELF | libc::IN_MOVE_SELF;
    // wd, mask, cookie, len
    const EVENT_HEADER_LEN: usize = 16;

    /// Linux watcher backed by inotify
    pub struct InotifyWatcher {
        fd: AsyncFd<OwnedFd>,
        paths: Vec<PathBuf>,
        watches: HashMap<i32, PathBuf>,
        // How often to retry directories that could not be watched
        rearm: Duration,
    }

    impl std::fmt::Debug for InotifyWatcher {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("InotifyWatcher")
                .field("paths", &self.paths)
                .field("watches", &self.watches)
                .finish()
        }
    }

    fn read_raw(fd: RawFd) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; 4096];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        buf.truncate(n as usize);
        Ok(buf)
    }

    /// (wd, mask) of every event in `buf`
    fn parse_events(buf: &[u8]) -> Vec<(i32, u32)> {
        let mut events = Vec::new();
        let mut offset = 0;
        while offset + EVENT_HEADER_LEN <= buf.len() {
            let field = |at: usize| {
                let mut b = [0u8; 4];
                b.copy_from_slice(&buf[offset + at..offset + at + 4]);
                b
            };
            let wd = i32::from_ne_bytes(field(0));
            let mask = u32::from_ne_bytes(field(4));
            let name_len = u32::from_ne_bytes(field(12)) as usize;
            events.push((wd, mask));
            offset += EVENT_HEADER_LEN + name_len;
        }
        events
    }

    impl InotifyWatcher {
        /// Must be called from within a runtime
        pub fn new(rearm: Duration) -> Result<Self> {
            let raw = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
            if raw < 0 {
                return Err(io::Error::last_os_error().into());
            }
            let owned = unsafe { OwnedFd::from_raw_fd(raw) };
            Ok(InotifyWatcher {
                fd: AsyncFd::with_interest(owned, Interest::READABLE)?,
                paths: Vec::new(),
                watches: HashMap::new(),
                rearm,
            })
        }

        fn arm(&mut self) {
            let fd = self.fd.get_ref().as_raw_fd();
            for path in &self.paths {
                if self.watches.values().any(|p| p == path) {
                    continue;
                }
                let cpath = match CString::new(path.as_os_str().as_bytes()) {
                    Ok(cpath) => cpath,
                    Err(_) => continue,
                };
                let wd = unsafe { libc::inotify_add_watch(fd, cpath.as_ptr(), WATCH_MASK) };
                if wd >= 0 {
                    trace!("Watching {}", path.display());
                    self.watches.insert(wd, path.clone());
                }
            }
        }

        fn fully_armed(&self) -> bool {
            self.paths
                .iter()
                .all(|p| self.watches.values().any(|w| w == p))
        }

        async fn read_events(&self) -> Result<Vec<(i32, u32)>> {
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| read_raw(inner.get_ref().as_raw_fd())) {
                    Ok(result) => return Ok(parse_events(&result?)),
                    Err(_would_block) => continue,
                }
            }
        }
    }

    #[async_trait]
    impl DirectoryWatcher for InotifyWatcher {
        fn watch(&mut self, paths: &[PathBuf]) {
            let fd = self.fd.get_ref().as_raw_fd();
            let stale: Vec<i32> = self
                .watches
                .iter()
                .filter(|(_, p)| !paths.contains(p))
                .map(|(wd, _)| *wd)
                .collect();
            for wd in stale {
                unsafe { libc::inotify_rm_watch(fd, wd) };
                self.watches.remove(&wd);
            }
            self.paths = paths.to_vec();
            self.arm();
        }

        async fn changed(&mut self) -> Result<()> {
            self.arm();
            let events = if self.fully_armed() {
                self.read_events().await?
            } else {
                match timeout(self.rearm, self.read_events()).await {
                    Ok(events) => events?,
                    // A missing directory may have appeared
                    Err(_) => return Ok(()),
                }
            };
            for (wd, mask) in events {
                if mask & GONE_MASK != 0 {
                    if let Some(path) = self.watches.remove(&wd) {
                        debug!("Watched directory {} went away", path.display());
                    }
                }
            }
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn reports_new_files_and_rearms_after_removal() {
            let dir = tempfile::tempdir().unwrap();
            let watched = dir.path().join("by-nodeid");
            let mut watcher = InotifyWatcher::new(Duration::from_millis(20)).unwrap();
            watcher.watch(&[watched.clone()]);

            // Not there yet: resolves after the re-arm period
            timeout(Duration::from_secs(2), watcher.changed())
                .await
                .unwrap()
                .unwrap();

            fs::create_dir_all(&watched).unwrap();
            watcher.watch(&[watched.clone()]);
            assert!(watcher.fully_armed());
            fs::write(watched.join("a.info"), "x").unwrap();
            timeout(Duration::from_secs(2), watcher.changed())
                .await
                .unwrap()
                .unwrap();

            fs::remove_dir_all(&watched).unwrap();
            // Drain until the watch is reported gone
            for _ in 0..10 {
                if !watcher.fully_armed() {
                    break;
                }
                let _ = timeout(Duration::from_millis(200), watcher.changed()).await;
            }
            assert!(!watcher.fully_armed());

            fs::create_dir_all(&watched).unwrap();
            watcher.arm();
            assert!(watcher.fully_armed());
        }
    }
}

/// The best watcher for this platform
pub fn default_watcher() -> Box<dyn DirectoryWatcher> {
    #[cfg(target_os = "linux")]
    {
        match InotifyWatcher::new(Duration::from_secs(1)) {
            Ok(watcher) => return Box::new(watcher),
            Err(e) => warn!("inotify unavailable, polling instead: {}", e),
        }
    }
    Box::new(PollingWatcher::new(Duration::from_secs(1)))
}

/// A directory to scan, and the user to name in URLs of nodes found there
#[derive(Debug, Clone)]
pub struct SearchDir {
    pub dir: TransportDir,
    pub username: Option<String>,
}

/// The private directory plus every user's public directory
pub fn search_dirs(dirs: &NodeDirectories) -> Vec<SearchDir> {
    let mut search = vec![SearchDir {
        dir: dirs.private_transport_dir(),
        username: None,
    }];
    for (user, dir) in dirs.all_public_transport_dirs() {
        let username = if user == dirs.username { None } else { Some(user) };
        search.push(SearchDir { dir, username });
    }
    search
}

/// Read every live `.info` file below the `by-nodeid` directories
pub fn scan_nodes(search: &[SearchDir], now: DateTime<Utc>) -> Vec<NodeDiscoveryInfo> {
    let mut found: HashMap<NodeId, NodeDiscoveryInfo> = HashMap::new();
    for s in search {
        let entries = match fs::read_dir(s.dir.by_node_id()) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("info") {
                continue;
            }
            let info = match NodeInfoFile::read(&path) {
                Ok(info) => info,
                Err(e) => {
                    trace!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            if !pid_file_is_live(&s.dir.node_id_file(info.node_id, "pid")) {
                trace!("Skipping stale {}", path.display());
                continue;
            }
            found.entry(info.node_id).or_insert_with(|| NodeDiscoveryInfo {
                node_id: info.node_id,
                node_name: info.node_name.clone(),
                urls: vec![LocalUrl::for_node(
                    info.node_id,
                    &info.node_name,
                    s.username.as_deref(),
                )],
                service_state_nonce: info.service_state_nonce.clone(),
                last_seen: now,
            });
        }
    }
    found.into_values().collect()
}

/// Report every node found now to `node`
pub(crate) fn detect_nodes(node: &dyn NodeContext) -> Vec<NodeDiscoveryInfo> {
    let search = search_dirs(&node.node_directories());
    let found = scan_nodes(&search, node.now_node_time());
    for info in &found {
        node.node_detected(info.clone());
    }
    found
}

pub(crate) async fn run_discovery(
    node: Arc<dyn NodeContext>,
    mut watcher: Box<dyn DirectoryWatcher>,
    rescan: Duration,
) {
    info!("Local discovery started");
    loop {
        let dirs = node.node_directories();
        let mut paths: Vec<PathBuf> = search_dirs(&dirs)
            .iter()
            .map(|s| s.dir.by_node_id())
            .collect();
        paths.push(dirs.public_run_root.clone());
        watcher.watch(&paths);

        let found = detect_nodes(node.as_ref());
        trace!("Discovery scan found {} nodes", found.len());

        match timeout(rescan, watcher.changed()).await {
            Ok(Ok(())) => trace!("Discovery directory changed"),
            Ok(Err(e)) => {
                debug!("Directory watch failed, retrying: {}", e);
                sleep(Duration::from_secs(1)).await;
            }
            Err(_) => trace!("Periodic discovery rescan"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::lock::PidFile;
    use crate::Error;

    fn publish(dir: &TransportDir, name: &str) -> (NodeId, PidFile) {
        dir.create_all().unwrap();
        let id = NodeId::new_random();
        let pid = PidFile::acquire(&dir.node_id_file(id, "pid"), || {
            Error::NodeIdAlreadyInUse(id.to_string())
        })
        .unwrap();
        NodeInfoFile {
            node_id: id,
            node_name: name.into(),
            socket: dir.socket_dir().join("x.sock"),
            service_state_nonce: "nonce".into(),
        }
        .write(&dir.node_id_file(id, "info"))
        .unwrap();
        (id, pid)
    }

    #[test]
    fn scan_finds_live_nodes_only() {
        let root = tempfile::tempdir().unwrap();
        let dirs = NodeDirectories::new(root.path());
        let (alive, _pid) = publish(&dirs.private_transport_dir(), "alice");
        let (dead, pid) = publish(&dirs.public_transport_dir("bob"), "carol");
        drop(pid);
        // The pid file is gone but leave the info file behind
        NodeInfoFile {
            node_id: dead,
            node_name: "carol".into(),
            socket: PathBuf::from("/nowhere.sock"),
            service_state_nonce: String::new(),
        }
        .write(&dirs.public_transport_dir("bob").node_id_file(dead, "info"))
        .unwrap();

        let found = scan_nodes(&search_dirs(&dirs), Utc::now());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].node_id, alive);
        assert_eq!(found[0].node_name, "alice");
        assert!(found[0].urls[0].starts_with("rr+local:///?nodeid="));
    }

    #[test]
    fn other_users_are_named_in_urls() {
        let root = tempfile::tempdir().unwrap();
        let dirs = NodeDirectories::new(root.path());
        let (_id, _pid) = publish(&dirs.public_transport_dir("zed"), "robot");
        let found = scan_nodes(&search_dirs(&dirs), Utc::now());
        assert_eq!(found.len(), 1);
        assert!(found[0].urls[0].starts_with("rr+local://zed@localhost/"));
    }

    #[tokio::test]
    async fn polling_watcher_sees_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = PollingWatcher::new(Duration::from_millis(10));
        watcher.watch(&[dir.path().to_path_buf()]);
        let path = dir.path().join("n.info");
        let writer = tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            fs::write(path, "nodeid=x").unwrap();
        });
        timeout(Duration::from_secs(2), watcher.changed())
            .await
            .unwrap()
            .unwrap();
        writer.await.unwrap();
    }
}
