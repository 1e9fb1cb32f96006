#![deny(unused_must_use)]
#![allow(dead_code)]

use raconteur::prelude::*;

use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use std::path::Path;
use std::sync::{Arc, Mutex, Once, Weak};

static TRACING: Once = Once::new();

/// Install a `tracing` subscriber once per test binary. Set `RUST_LOG` to see output.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Build a node on the current runtime whose run directories live under `root`
pub fn test_node(root: &Path, name: &str) -> Arc<Node> {
    let mut cfg = NodeConfig::new().directories(NodeDirectories::new(root));
    if !name.is_empty() {
        cfg = cfg.name(name).node_id(NodeId::new_random());
    }
    cfg.build().unwrap()
}

/// Collects everything a transport hands upward
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Message>,
    pub closed: Mutex<Option<Error>>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(ChannelSink {
            tx,
            closed: Mutex::new(None),
        });
        (sink, rx)
    }

    pub fn close_error(&self) -> Option<Error> {
        self.closed.lock().unwrap().clone()
    }
}

impl MessageSink for ChannelSink {
    fn message_received(&self, message: Message) {
        let _ = self.tx.send(message);
    }

    fn transport_closed(&self, err: &Error) {
        *self.closed.lock().unwrap() = Some(err.clone());
    }
}

/// One end of an in-memory connection
pub struct Peer {
    pub transport: Arc<StreamTransport>,
    pub node: Arc<Node>,
    pub sink: Arc<ChannelSink>,
    pub rx: mpsc::UnboundedReceiver<Message>,
}

pub fn start_peer(
    stream: DuplexStream,
    server: bool,
    config: StreamTransportConfig,
    node: Arc<Node>,
) -> Peer {
    let transport = StreamTransport::new(stream, server, config, node.clone());
    let (sink, rx) = ChannelSink::new();
    let dyn_sink: Arc<dyn MessageSink> = sink.clone();
    let weak: Weak<dyn MessageSink> = Arc::downgrade(&dyn_sink);
    transport.start(weak).unwrap();
    Peer {
        transport,
        node,
        sink,
        rx,
    }
}

/// A client and server attached over `tokio::io::duplex`
pub async fn attached_pair(
    root: &Path,
    client_cfg: StreamTransportConfig,
    server_cfg: StreamTransportConfig,
) -> (Peer, Peer) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let server_node = test_node(&root.join("server"), "server_node");
    let client_node = test_node(&root.join("client"), "client_node");
    let server = start_peer(b, true, server_cfg, server_node.clone());
    let client = start_peer(a, false, client_cfg, client_node);

    let server_transport = server.transport.clone();
    let client_transport = client.transport.clone();
    let server_id = server_node.node_id();
    let (s, c) = tokio::join!(
        server_transport.attach_stream(NodeId::any(), ""),
        client_transport.attach_stream(server_id, "server_node"),
    );
    s.unwrap();
    c.unwrap();
    (client, server)
}

/// A node-level message the transport passes through untouched
pub fn app_message(member: &str, value: u32) -> Message {
    Message::new().with_entry(
        MessageEntry::new(MessageEntryType::Other(101), member)
            .with_element(MessageElement::uint32("value", value)),
    )
}
