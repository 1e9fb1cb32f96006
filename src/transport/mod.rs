pub mod buffer;
pub mod capability;
mod config;
pub mod frame;
mod heartbeat;
mod negotiate;
mod stream;
pub mod string_table;

pub use crate::transport::capability::{Capability, CapabilitySet};
pub use crate::transport::config::*;
pub use crate::transport::negotiate::{CREATE_CONNECTION, GET_NODE_INFO, GET_REMOTE_NODE_ID};
pub use crate::transport::stream::{ConnectionState, StreamTransport};
pub use crate::transport::string_table::StringTable;

use async_trait::async_trait;
use tokio::runtime::Handle;

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::msg::{Message, NodeId};
use crate::{Error, Result};

/// Hook through which a stream transport hands decoded messages to its owner
pub trait MessageSink: Send + Sync + 'static {
    /// Called in receive order for every message the transport does not consume
    fn message_received(&self, message: Message);

    /// Called once, when the connection closes for any reason
    fn transport_closed(&self, _err: &Error) {}
}

/// A connection to a remote node, as seen by the node
#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn send_message(&self, message: Message) -> Result<()>;

    fn close(&self);

    /// Fails if the connection is no longer usable
    fn check_connection(&self) -> Result<()>;

    fn local_endpoint(&self) -> u32;

    fn remote_endpoint(&self) -> u32;

    fn remote_node_id(&self) -> NodeId;
}

// Nothing panics while holding transport locks, so poisoning is recovered from
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Blocking wrappers park the calling thread, which must not be a runtime worker
pub(crate) fn ensure_not_on_runtime() -> Result<()> {
    if Handle::try_current().is_ok() {
        return Err(Error::InvalidOperation(
            "Blocking transport calls cannot be made from within the I/O context".into(),
        ));
    }
    Ok(())
}
