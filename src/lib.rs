// If an async Future goes unused, toss a compile-time error
#![deny(unused_must_use)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::missing_crate_level_docs)]

//! `raconteur` implements the byte-stream transport layer of a Robot
//! Raconteur style node: message framing, connection attach and capability
//! negotiation, string table compression, heartbeats and flow control, plus
//! a local transport that connects nodes on the same machine over Unix
//! domain sockets and discovers them through their run directories.
//!
//! | Layer               | Module          |
//! |---------------------|-----------------|
//! | Framing             | [`transport::frame`] |
//! | Stream negotiation  | [`transport`]   |
//! | Local sockets       | [`local`]       |
//! | Discovery           | [`local::discovery`] |
//!

pub mod error;
/// Local (Unix domain socket) transport, run directories and discovery
pub mod local;
/// Message tree passed between nodes
pub mod msg;
/// The node a transport reports to
pub mod node;
/// Stream transport shared by every socket-based transport
pub mod transport;

pub use crate::error::{Error, ErrorCode, Result};

/// Everything needed to build a node with a local transport
pub mod prelude {
    pub use crate::error::{Error, ErrorCode, Result};
    pub use crate::local::{
        LocalTransport, LocalTransportConfig, LocalUrl, NodeDirectories, NodeLockRegistry,
    };
    pub use crate::msg::*;
    pub use crate::node::{Node, NodeConfig, NodeContext, NodeDiscoveryInfo};
    pub use crate::transport::{
        Capability, ConnectionState, MessageSink, StreamTransport, StreamTransportConfig,
        TransportConnection,
    };
}
