//! Transport between nodes on the same machine over Unix domain sockets.
//!
//! A server binds a randomly named socket and publishes `.info` and `.pid`
//! files naming it under its NodeID and NodeName. Clients resolve an
//! `rr+local` URL by reading those files, connect, attach the stream and
//! exchange endpoints with `ConnectClient`.

mod config;
mod connection;
pub mod directories;
pub mod discovery;
pub mod lock;
pub mod url;

pub use crate::local::config::*;
pub use crate::local::connection::LocalTransportConnection;
pub use crate::local::directories::{NodeDirectories, NodeInfoFile, TransportDir, UNIX_PATH_MAX};
pub use crate::local::discovery::{DirectoryWatcher, PollingWatcher};
pub use crate::local::lock::{NodeLock, NodeLockRegistry, PidFile};
pub use crate::local::url::LocalUrl;

// Tokio for async
use tokio::net::{UnixListener, UnixStream};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
// Tracing for logging
use tracing::*;
// Multi-threading primitives
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
// Misc other imports
use rand::Rng;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::local::discovery::{default_watcher, detect_nodes, run_discovery};
use crate::msg::{Message, NodeId};
use crate::node::{NodeContext, NodeDiscoveryInfo};
use crate::transport::{ensure_not_on_runtime, lock, TransportConnection};
use crate::{Error, Result};

/// `^[a-zA-Z][a-zA-Z0-9_.\-]*$`
pub fn is_valid_node_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

fn validate_node_name(name: &str) -> Result<()> {
    if is_valid_node_name(name) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("Invalid NodeName: {:?}", name)))
    }
}

/// Files published in one transport directory
#[derive(Debug)]
struct Publication {
    info_files: Vec<PathBuf>,
    _pid_files: Vec<PidFile>,
}

#[derive(Debug)]
struct ServerState {
    node_id: NodeId,
    node_name: Option<String>,
    socket_path: PathBuf,
    listener: JoinHandle<()>,
    publications: Vec<Publication>,
    _locks: Vec<NodeLock>,
}

/// Local transport owned by one node
pub struct LocalTransport {
    node: Arc<dyn NodeContext>,
    registry: Arc<NodeLockRegistry>,
    config: LocalTransportConfig,
    handle: Handle,
    connections: Mutex<HashMap<u32, Arc<LocalTransportConnection>>>,
    server: Mutex<Option<ServerState>>,
    client_locks: Mutex<Vec<NodeLock>>,
    discovery: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("node_id", &self.node.node_id())
            .field("server", &*lock(&self.server))
            .field("connections", &lock(&self.connections).len())
            .finish()
    }
}

impl LocalTransport {
    pub fn new(
        node: Arc<dyn NodeContext>,
        registry: Arc<NodeLockRegistry>,
        config: LocalTransportConfig,
    ) -> Arc<Self> {
        let handle = node.io_handle();
        Arc::new(LocalTransport {
            node,
            registry,
            config,
            handle,
            connections: Mutex::new(HashMap::new()),
            server: Mutex::new(None),
            client_locks: Mutex::new(Vec::new()),
            discovery: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn node(&self) -> &Arc<dyn NodeContext> {
        &self.node
    }

    pub fn config(&self) -> &LocalTransportConfig {
        &self.config
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::InvalidOperation("Transport has been closed".into()))
        } else {
            Ok(())
        }
    }

    /// Whether a server has been started
    pub fn is_server(&self) -> bool {
        lock(&self.server).is_some()
    }

    fn ensure_node_id(&self) -> Result<NodeId> {
        let id = self.node.node_id();
        if !id.is_any() {
            return Ok(id);
        }
        let id = NodeId::new_random();
        self.node.set_node_id(id)?;
        Ok(self.node.node_id())
    }

    /// Claim `node_name` for a node that only makes outgoing connections
    #[tracing::instrument(skip(self))]
    pub fn start_client_as_node_name(&self, node_name: &str) -> Result<()> {
        self.check_open()?;
        validate_node_name(node_name)?;
        let name_lock = self.registry.lock_node_name(node_name)?;
        self.ensure_node_id()?;
        self.node.set_node_name(node_name)?;
        lock(&self.client_locks).push(name_lock);
        info!("Started local client as {}", node_name);
        Ok(())
    }

    /// Claim `node_name` and start accepting connections
    #[tracing::instrument(skip(self))]
    pub fn start_server_as_node_name(self: &Arc<Self>, node_name: &str) -> Result<()> {
        self.check_open()?;
        validate_node_name(node_name)?;
        if self.is_server() {
            return Err(Error::InvalidOperation("Server already started".into()));
        }
        let name_lock = self.registry.lock_node_name(node_name)?;
        let node_id = self.ensure_node_id()?;
        let id_lock = self.registry.lock_node_id(node_id)?;
        self.start_server(node_id, Some(node_name), vec![name_lock, id_lock])
    }

    /// Claim `node_id` and start accepting connections
    #[tracing::instrument(skip(self))]
    pub fn start_server_as_node_id(self: &Arc<Self>, node_id: NodeId) -> Result<()> {
        self.check_open()?;
        if node_id.is_any() {
            return Err(Error::InvalidArgument("NodeID must not be zero".into()));
        }
        if self.is_server() {
            return Err(Error::InvalidOperation("Server already started".into()));
        }
        let id_lock = self.registry.lock_node_id(node_id)?;
        self.node.set_node_id(node_id)?;
        self.start_server(node_id, None, vec![id_lock])
    }

    fn start_server(
        self: &Arc<Self>,
        node_id: NodeId,
        node_name: Option<&str>,
        locks: Vec<NodeLock>,
    ) -> Result<()> {
        let dirs = self.node.node_directories();
        let mut targets = vec![dirs.private_transport_dir()];
        if self.config.enable_public {
            targets.push(dirs.public_transport_dir(&dirs.username));
        }

        let mut pid_files = Vec::new();
        for target in &targets {
            target.create_all()?;
            let mut held = Vec::new();
            if let Some(name) = node_name {
                held.push(PidFile::acquire(&target.node_name_file(name, "pid"), || {
                    Error::NodeNameAlreadyInUse(name.to_string())
                })?);
            }
            held.push(PidFile::acquire(&target.node_id_file(node_id, "pid"), || {
                Error::NodeIdAlreadyInUse(node_id.to_string())
            })?);
            pid_files.push(held);
        }

        let socket_path = targets[0]
            .socket_dir()
            .join(format!("{}.sock", self.node.random_string(16)));
        if socket_path.as_os_str().len() >= UNIX_PATH_MAX {
            return Err(Error::SystemResource(format!(
                "Socket path {} exceeds the maximum length of {}",
                socket_path.display(),
                UNIX_PATH_MAX - 1
            )));
        }
        let listener = {
            let _guard = self.handle.enter();
            UnixListener::bind(&socket_path).map_err(|e| {
                Error::SystemResource(format!("Could not bind {}: {}", socket_path.display(), e))
            })?
        };
        if let Some(name) = node_name {
            self.node.set_node_name(name)?;
        }

        let info = NodeInfoFile {
            node_id,
            node_name: node_name.unwrap_or_default().to_string(),
            socket: socket_path.clone(),
            service_state_nonce: self.node.service_state_nonce(),
        };
        let mut publications = Vec::new();
        for (target, held) in targets.iter().zip(pid_files) {
            let mut info_files = vec![target.node_id_file(node_id, "info")];
            if let Some(name) = node_name {
                info_files.push(target.node_name_file(name, "info"));
            }
            for path in &info_files {
                info.write(path)?;
            }
            publications.push(Publication {
                info_files,
                _pid_files: held,
            });
        }

        let weak = Arc::downgrade(self);
        let listener = self.handle.spawn(accept_loop(weak, listener));
        *lock(&self.server) = Some(ServerState {
            node_id,
            node_name: node_name.map(str::to_string),
            socket_path: socket_path.clone(),
            listener,
            publications,
            _locks: locks,
        });
        info!(
            "Local server {} ({}) listening on {}",
            node_id,
            node_name.unwrap_or(""),
            socket_path.display()
        );
        Ok(())
    }

    /// Rewrite the published info files with the node's current nonce
    pub fn update_service_state_nonce(&self) -> Result<()> {
        let server = lock(&self.server);
        let state = match server.as_ref() {
            Some(state) => state,
            None => return Ok(()),
        };
        let info = NodeInfoFile {
            node_id: state.node_id,
            node_name: state.node_name.clone().unwrap_or_default(),
            socket: state.socket_path.clone(),
            service_state_nonce: self.node.service_state_nonce(),
        };
        for publication in &state.publications {
            for path in &publication.info_files {
                info.write(path)?;
            }
        }
        Ok(())
    }

    pub(crate) fn register_incoming(&self, conn: Arc<LocalTransportConnection>) -> Result<u32> {
        self.check_open()?;
        let mut connections = lock(&self.connections);
        let mut rng = rand::thread_rng();
        loop {
            let endpoint: u32 = rng.gen();
            if endpoint != 0 && !connections.contains_key(&endpoint) {
                connections.insert(endpoint, conn);
                return Ok(endpoint);
            }
        }
    }

    fn register_outgoing(&self, endpoint: u32, conn: Arc<LocalTransportConnection>) -> Result<()> {
        self.check_open()?;
        let mut connections = lock(&self.connections);
        if connections.contains_key(&endpoint) {
            return Err(Error::InvalidArgument(format!(
                "Endpoint {} already has a connection",
                endpoint
            )));
        }
        connections.insert(endpoint, conn);
        Ok(())
    }

    pub(crate) fn remove_connection(&self, endpoint: u32) -> Option<Arc<LocalTransportConnection>> {
        lock(&self.connections).remove(&endpoint)
    }

    fn connection(&self, endpoint: u32) -> Result<Arc<LocalTransportConnection>> {
        lock(&self.connections)
            .get(&endpoint)
            .cloned()
            .ok_or_else(|| {
                Error::Connection("Transport connection to remote host not found".into())
            })
    }

    /// Endpoints of every registered connection
    pub fn connection_endpoints(&self) -> Vec<u32> {
        lock(&self.connections).keys().copied().collect()
    }

    /// Whether this transport handles `url`. Malformed `rr+local` URLs are errors.
    pub fn can_connect_service(&self, url: &str) -> Result<bool> {
        let scheme = match url.split_once("://") {
            Some((scheme, _)) => scheme,
            None => return Ok(false),
        };
        if !scheme.eq_ignore_ascii_case(url::LOCAL_SCHEME) {
            return Ok(false);
        }
        url.parse::<LocalUrl>()?;
        Ok(true)
    }

    fn candidate_dirs(&self, url: &LocalUrl) -> Vec<TransportDir> {
        let dirs = self.node.node_directories();
        match &url.username {
            Some(user) if *user != dirs.username => vec![dirs.public_transport_dir(user)],
            _ => vec![
                dirs.private_transport_dir(),
                dirs.public_transport_dir(&dirs.username),
            ],
        }
    }

    /// Connect to the node named by `url`, registering the connection under
    /// `endpoint` (a random one when zero)
    #[tracing::instrument(skip(self))]
    pub async fn create_transport_connection(
        self: &Arc<Self>,
        url: &str,
        endpoint: u32,
    ) -> Result<Arc<dyn TransportConnection>> {
        self.check_open()?;
        let parsed: LocalUrl = url.parse()?;
        if !parsed.is_addressed() {
            return Err(Error::Connection(
                "NodeID and/or NodeName must be specified.".into(),
            ));
        }
        if !parsed.node_name.is_empty() {
            validate_node_name(&parsed.node_name)?;
        }
        let endpoint = match endpoint {
            0 => loop {
                let candidate: u32 = rand::thread_rng().gen();
                if candidate != 0 && !lock(&self.connections).contains_key(&candidate) {
                    break candidate;
                }
            },
            e => e,
        };
        if lock(&self.connections).contains_key(&endpoint) {
            return Err(Error::InvalidArgument(format!(
                "Endpoint {} already has a connection",
                endpoint
            )));
        }

        for dir in self.candidate_dirs(&parsed) {
            let info_path = if parsed.node_id.is_any() {
                dir.node_name_file(&parsed.node_name, "info")
            } else {
                dir.node_id_file(parsed.node_id, "info")
            };
            let info = match NodeInfoFile::read(&info_path) {
                Ok(info) => info,
                Err(e) => {
                    trace!("No usable {}: {}", info_path.display(), e);
                    continue;
                }
            };
            if (!parsed.node_id.is_any() && info.node_id != parsed.node_id)
                || (!parsed.node_name.is_empty() && info.node_name != parsed.node_name)
            {
                debug!("{} does not match {}", info_path.display(), url);
                continue;
            }
            let socket = match UnixStream::connect(&info.socket).await {
                Ok(socket) => socket,
                Err(e) => {
                    debug!("Could not connect to {}: {}", info.socket.display(), e);
                    continue;
                }
            };

            let conn = LocalTransportConnection::connect(
                self,
                socket,
                endpoint,
                info.node_id,
                &parsed.node_name,
            )
            .await?;
            if let Err(e) = self.register_outgoing(endpoint, conn.clone()) {
                conn.close();
                return Err(e);
            }
            if let Err(e) = conn.check_connection() {
                self.remove_connection(endpoint);
                return Err(e);
            }
            info!("Connected endpoint {} to {}", endpoint, url);
            return Ok(conn as Arc<dyn TransportConnection>);
        }
        Err(Error::Connection(format!("Could not connect to service at {}", url)))
    }

    /// Blocking form of `create_transport_connection`. Must not be called
    /// from a runtime thread.
    pub fn create_transport_connection_blocking(
        self: &Arc<Self>,
        url: &str,
        endpoint: u32,
    ) -> Result<Arc<dyn TransportConnection>> {
        ensure_not_on_runtime()?;
        self.handle
            .block_on(self.create_transport_connection(url, endpoint))
    }

    pub fn close_transport_connection(&self, endpoint: u32) {
        if let Some(conn) = self.remove_connection(endpoint) {
            debug!("Closing endpoint {}", endpoint);
            conn.close();
        }
    }

    pub fn check_connection(&self, endpoint: u32) -> Result<()> {
        self.connection(endpoint)?.check_connection()
    }

    /// Send on the connection registered under `header.sender_endpoint`
    pub async fn send_message(&self, message: Message) -> Result<()> {
        let conn = self.connection(message.header.sender_endpoint)?;
        conn.send_message(message).await
    }

    pub fn send_message_blocking(&self, message: Message) -> Result<()> {
        ensure_not_on_runtime()?;
        self.handle.block_on(self.send_message(message))
    }

    /// Close connections that stopped receiving and expire stale requests
    pub fn periodic_cleanup_task(&self) {
        let connections: Vec<_> = lock(&self.connections).values().cloned().collect();
        for conn in connections {
            if let Err(e) = conn.stream().periodic_cleanup() {
                debug!("Endpoint {} failed cleanup: {}", conn.local_endpoint(), e);
            }
        }
    }

    /// Scan the run directories now, reporting every node found to the node
    pub async fn get_detected_nodes(&self) -> Result<Vec<NodeDiscoveryInfo>> {
        let node = self.node.clone();
        tokio::task::spawn_blocking(move || detect_nodes(node.as_ref()))
            .await
            .map_err(|e| Error::SystemResource(format!("Discovery scan failed: {}", e)))
    }

    /// Watch the run directories with the platform's best watcher
    pub fn start_discovery(&self) -> Result<()> {
        self.spawn_discovery(None)
    }

    /// Watch the run directories with `watcher`
    pub fn start_discovery_with(&self, watcher: Box<dyn DirectoryWatcher>) -> Result<()> {
        self.spawn_discovery(Some(watcher))
    }

    fn spawn_discovery(&self, watcher: Option<Box<dyn DirectoryWatcher>>) -> Result<()> {
        self.check_open()?;
        let mut discovery = lock(&self.discovery);
        if discovery.is_some() {
            return Err(Error::InvalidOperation("Discovery already running".into()));
        }
        let node = self.node.clone();
        let rescan = self.config.discovery_rescan;
        *discovery = Some(self.handle.spawn(async move {
            let watcher = watcher.unwrap_or_else(default_watcher);
            run_discovery(node, watcher, rescan).await
        }));
        Ok(())
    }

    /// Stop serving, drop every connection and withdraw published files
    #[tracing::instrument(skip(self))]
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(discovery) = lock(&self.discovery).take() {
            discovery.abort();
        }
        if let Some(state) = lock(&self.server).take() {
            state.listener.abort();
            for publication in &state.publications {
                for path in &publication.info_files {
                    if let Err(e) = fs::remove_file(path) {
                        debug!("Could not remove {}: {}", path.display(), e);
                    }
                }
            }
            if let Err(e) = fs::remove_file(&state.socket_path) {
                debug!("Could not remove {}: {}", state.socket_path.display(), e);
            }
        }
        let connections: Vec<_> = lock(&self.connections).drain().map(|(_, c)| c).collect();
        for conn in connections {
            conn.close();
        }
        lock(&self.client_locks).clear();
        info!("Local transport closed");
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(transport: Weak<LocalTransport>, listener: UnixListener) {
    loop {
        let socket = match listener.accept().await {
            Ok((socket, _)) => socket,
            Err(e) => {
                warn!("Local accept failed: {}", e);
                sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let parent = match transport.upgrade() {
            Some(parent) => parent,
            None => break,
        };
        trace!("Accepted local connection");
        let handle = parent.handle.clone();
        handle.spawn(async move {
            match LocalTransportConnection::accept(&parent, socket).await {
                Ok(conn) => debug!("Accepted endpoint {}", conn.local_endpoint()),
                Err(e) => debug!("Incoming local connection failed: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_names_follow_the_identifier_syntax() {
        for good in ["alice", "a", "robot_1.arm-left"] {
            assert!(is_valid_node_name(good), "{}", good);
        }
        for bad in ["", "1robot", "_x", "has space", "a/b"] {
            assert!(!is_valid_node_name(bad), "{}", bad);
        }
    }
}
