mod config;

pub use crate::node::config::*;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;

use tracing::*;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::local::NodeDirectories;
use crate::msg::{Message, NodeId};
use crate::{Error, Result};

/// Presence of a node found by discovery
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDiscoveryInfo {
    pub node_id: NodeId,
    pub node_name: String,
    pub urls: Vec<String>,
    pub service_state_nonce: String,
    pub last_seen: DateTime<Utc>,
}

/// The services a transport consumes from the node that owns it
pub trait NodeContext: Send + Sync + 'static {
    /// The I/O context every transport task is spawned on
    fn io_handle(&self) -> Handle;

    fn node_id(&self) -> NodeId;

    /// Assign the NodeID. Fails once a different NodeID has been assigned.
    fn set_node_id(&self, node_id: NodeId) -> Result<()>;

    fn node_name(&self) -> String;

    /// Assign the NodeName. Fails once a different NodeName has been assigned.
    fn set_node_name(&self, node_name: &str) -> Result<()>;

    fn now_node_time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Delivery point for every message the transports do not consume themselves
    fn message_received(&self, message: Message);

    fn node_detected(&self, info: NodeDiscoveryInfo);

    fn random_string(&self, len: usize) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn node_directories(&self) -> NodeDirectories;

    fn service_state_nonce(&self) -> String;

    fn transport_connection_closed(&self, _endpoint: u32) {}
}

/// A concrete node suitable for applications and tests
///
/// Received messages are queued on a channel, detected nodes are kept in a
/// table keyed by NodeID.
#[derive(Debug)]
pub struct Node {
    handle: Handle,
    // Keeps an owned runtime alive when the node was built outside of one
    _runtime: Option<Runtime>,
    node_id: RwLock<NodeId>,
    node_name: RwLock<String>,
    directories: NodeDirectories,
    service_state_nonce: RwLock<String>,
    tx: mpsc::UnboundedSender<Message>,
    rx: TokioMutex<mpsc::UnboundedReceiver<Message>>,
    detected: Mutex<HashMap<NodeId, NodeDiscoveryInfo>>,
    closed_endpoints: Mutex<Vec<u32>>,
}

impl Node {
    pub(crate) fn from_config(cfg: NodeConfig, handle: Handle, runtime: Option<Runtime>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let nonce = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        Node {
            handle,
            _runtime: runtime,
            node_id: RwLock::new(cfg.node_id),
            node_name: RwLock::new(cfg.name),
            directories: cfg.directories,
            service_state_nonce: RwLock::new(nonce),
            tx,
            rx: TokioMutex::new(rx),
            detected: Mutex::new(HashMap::new()),
            closed_endpoints: Mutex::new(Vec::new()),
        }
    }

    /// Wait for the next message delivered by any transport
    pub async fn recv(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }

    /// Snapshot of every node seen by discovery so far
    pub fn detected_nodes(&self) -> Vec<NodeDiscoveryInfo> {
        match self.detected.lock() {
            Ok(detected) => detected.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Endpoints whose transport connection has been closed
    pub fn closed_endpoints(&self) -> Vec<u32> {
        self.closed_endpoints
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Replace the service state nonce, returning the new value
    pub fn refresh_service_state_nonce(&self) -> String {
        let nonce = self.random_string(16);
        if let Ok(mut n) = self.service_state_nonce.write() {
            *n = nonce.clone();
        }
        nonce
    }
}

impl NodeContext for Node {
    fn io_handle(&self) -> Handle {
        self.handle.clone()
    }

    fn node_id(&self) -> NodeId {
        self.node_id.read().map(|id| *id).unwrap_or_default()
    }

    fn set_node_id(&self, node_id: NodeId) -> Result<()> {
        let mut current = self
            .node_id
            .write()
            .map_err(|_| Error::InvalidOperation("NodeID lock poisoned".into()))?;
        if !current.is_any() && *current != node_id {
            return Err(Error::InvalidOperation("NodeID already set".into()));
        }
        *current = node_id;
        Ok(())
    }

    fn node_name(&self) -> String {
        self.node_name
            .read()
            .map(|n| n.clone())
            .unwrap_or_default()
    }

    fn set_node_name(&self, node_name: &str) -> Result<()> {
        let mut current = self
            .node_name
            .write()
            .map_err(|_| Error::InvalidOperation("NodeName lock poisoned".into()))?;
        if !current.is_empty() && current.as_str() != node_name {
            return Err(Error::InvalidOperation("NodeName already set".into()));
        }
        *current = node_name.to_string();
        Ok(())
    }

    fn message_received(&self, message: Message) {
        if self.tx.send(message).is_err() {
            debug!("Node message receiver dropped, discarding message");
        }
    }

    fn node_detected(&self, info: NodeDiscoveryInfo) {
        if let Ok(mut detected) = self.detected.lock() {
            trace!("Detected node {} ({})", info.node_id, info.node_name);
            detected.insert(info.node_id, info);
        }
    }

    fn node_directories(&self) -> NodeDirectories {
        self.directories.clone()
    }

    fn service_state_nonce(&self) -> String {
        self.service_state_nonce
            .read()
            .map(|n| n.clone())
            .unwrap_or_default()
    }

    fn transport_connection_closed(&self, endpoint: u32) {
        if let Ok(mut closed) = self.closed_endpoints.lock() {
            closed.push(endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn node_identity_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let node = NodeConfig::new()
            .directories(NodeDirectories::new(dir.path()))
            .build()
            .unwrap();
        assert!(node.node_id().is_any());
        let id = NodeId::new_random();
        node.set_node_id(id).unwrap();
        node.set_node_id(id).unwrap();
        assert!(node.set_node_id(NodeId::new_random()).is_err());

        node.set_node_name("alice").unwrap();
        assert!(node.set_node_name("bob").is_err());
        assert_eq!(node.node_name(), "alice");
    }

    #[tokio::test]
    async fn random_strings_have_requested_length() {
        let dir = tempfile::tempdir().unwrap();
        let node = NodeConfig::new()
            .directories(NodeDirectories::new(dir.path()))
            .build()
            .unwrap();
        let s = node.random_string(16);
        assert_eq!(s.len(), 16);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
