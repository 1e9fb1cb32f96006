use async_trait::async_trait;
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::*;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::local::LocalTransport;
use crate::msg::{Message, MessageEntry, MessageEntryType, NodeId};
use crate::node::NodeContext;
use crate::transport::{lock, MessageSink, StreamTransport, TransportConnection};
use crate::{Error, Result};

/// A stream transport over a Unix socket, bound to a pair of endpoints
pub struct LocalTransportConnection {
    me: Weak<LocalTransportConnection>,
    stream: Arc<StreamTransport>,
    parent: Weak<LocalTransport>,
    node: Arc<dyn NodeContext>,
    local_endpoint: AtomicU32,
    remote_endpoint: AtomicU32,
    // Client: remote endpoint from ConnectClientRet. Server: allocated local endpoint.
    handshake: Mutex<Option<oneshot::Sender<Result<u32>>>>,
}

impl std::fmt::Debug for LocalTransportConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransportConnection")
            .field("local_endpoint", &self.local_endpoint())
            .field("remote_endpoint", &self.remote_endpoint())
            .field("stream", &self.stream)
            .finish()
    }
}

impl LocalTransportConnection {
    fn wrap(
        parent: &Arc<LocalTransport>,
        socket: UnixStream,
        server: bool,
        local_endpoint: u32,
    ) -> Result<(Arc<Self>, oneshot::Receiver<Result<u32>>)> {
        let node = parent.node().clone();
        let stream = StreamTransport::new(
            socket,
            server,
            parent.config().stream.clone(),
            node.clone(),
        );
        let (tx, rx) = oneshot::channel();
        let conn = Arc::new_cyclic(|me| LocalTransportConnection {
            me: me.clone(),
            stream,
            parent: Arc::downgrade(parent),
            node,
            local_endpoint: AtomicU32::new(local_endpoint),
            remote_endpoint: AtomicU32::new(0),
            handshake: Mutex::new(Some(tx)),
        });
        let sink: Weak<dyn MessageSink> = Arc::downgrade(&conn) as Weak<dyn MessageSink>;
        conn.stream.start(sink)?;
        Ok((conn, rx))
    }

    /// Attach as a client, then exchange endpoints with `ConnectClient`
    #[tracing::instrument(skip(parent, socket))]
    pub(crate) async fn connect(
        parent: &Arc<LocalTransport>,
        socket: UnixStream,
        local_endpoint: u32,
        target_node_id: NodeId,
        target_node_name: &str,
    ) -> Result<Arc<Self>> {
        let (conn, handshake) = Self::wrap(parent, socket, false, local_endpoint)?;
        conn.stream
            .attach_stream(target_node_id, target_node_name)
            .await?;

        let mut request = Message::new().with_entry(MessageEntry::new(
            MessageEntryType::ConnectClient,
            "",
        ));
        request.header = conn.header();
        conn.stream.send_message(request).await?;

        let attach_timeout = conn.stream.config().attach_timeout;
        let remote = match timeout(attach_timeout, handshake).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(conn.stream.check_connection().err().unwrap_or_else(Error::closed)),
            Err(_) => Err(Error::Timeout("Timed out waiting for ConnectClientRet".into())),
        };
        match remote {
            Ok(remote) => {
                conn.remote_endpoint.store(remote, Ordering::SeqCst);
                debug!("Endpoint {} connected to remote endpoint {}", local_endpoint, remote);
                Ok(conn)
            }
            Err(e) => {
                conn.stream.close_with(e.clone());
                Err(e)
            }
        }
    }

    /// Serve an accepted socket until the client has been assigned an endpoint
    pub(crate) async fn accept(
        parent: &Arc<LocalTransport>,
        socket: UnixStream,
    ) -> Result<Arc<Self>> {
        let (conn, handshake) = Self::wrap(parent, socket, true, 0)?;
        conn.stream.attach_stream(NodeId::any(), "").await?;
        let attach_timeout = conn.stream.config().attach_timeout;
        let local = match timeout(attach_timeout, handshake).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::closed()),
            Err(_) => Err(Error::Timeout("Timed out waiting for ConnectClient".into())),
        };
        match local {
            Ok(_) => Ok(conn),
            Err(e) => {
                conn.stream.close_with(e.clone());
                Err(e)
            }
        }
    }

    /// The framing engine underneath
    pub fn stream(&self) -> &Arc<StreamTransport> {
        &self.stream
    }

    fn header(&self) -> crate::msg::MessageHeader {
        crate::msg::MessageHeader {
            sender_node_id: self.node.node_id(),
            receiver_node_id: self.stream.remote_node_id(),
            sender_endpoint: self.local_endpoint(),
            receiver_endpoint: self.remote_endpoint(),
            sender_node_name: self.node.node_name(),
            receiver_node_name: self.stream.remote_node_name(),
            ..Default::default()
        }
    }

    fn finish_handshake(&self, result: Result<u32>) {
        if let Some(tx) = lock(&self.handshake).take() {
            let _ = tx.send(result);
        }
    }

    fn handle_connect_client(&self, message: Message) {
        let entry = match message.first_entry() {
            Some(entry) => entry,
            None => return,
        };
        let ret_type = match entry.entry_type {
            MessageEntryType::ConnectClientCombined => MessageEntryType::ConnectClientCombinedRet,
            _ => MessageEntryType::ConnectClientRet,
        };
        let result = self.register_endpoint(message.header.sender_endpoint);
        let ret = match &result {
            Ok(_) => MessageEntry::new(ret_type, "").with_request_id(entry.request_id),
            Err(e) => {
                warn!("Rejecting ConnectClient: {}", e);
                entry.error_response(ret_type, e)
            }
        };
        let mut reply = Message::new().with_entry(ret);
        reply.header = self.header();
        self.stream.send_detached(reply);
        self.finish_handshake(result);
    }

    fn register_endpoint(&self, remote_endpoint: u32) -> Result<u32> {
        if self.local_endpoint() != 0 {
            return Err(Error::InvalidOperation("Connection already has an endpoint".into()));
        }
        let parent = self
            .parent
            .upgrade()
            .ok_or_else(|| Error::InvalidOperation("Transport has been closed".into()))?;
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| Error::InvalidOperation("Connection released".into()))?;
        self.remote_endpoint.store(remote_endpoint, Ordering::SeqCst);
        let local = parent.register_incoming(me)?;
        self.local_endpoint.store(local, Ordering::SeqCst);
        debug!("Remote endpoint {} assigned local endpoint {}", remote_endpoint, local);
        Ok(local)
    }
}

impl MessageSink for LocalTransportConnection {
    fn message_received(&self, message: Message) {
        match message.first_entry_type() {
            Some(MessageEntryType::ConnectClient)
            | Some(MessageEntryType::ConnectClientCombined) => {
                self.handle_connect_client(message)
            }
            Some(MessageEntryType::ConnectClientRet)
            | Some(MessageEntryType::ConnectClientCombinedRet) => {
                let sender = message.header.sender_endpoint;
                let result = match message.entries.into_iter().next() {
                    Some(entry) => entry.into_result().map(|_| sender),
                    None => Err(Error::Protocol("Empty ConnectClientRet".into())),
                };
                self.finish_handshake(result);
            }
            _ => self.node.message_received(message),
        }
    }

    fn transport_closed(&self, err: &Error) {
        let endpoint = self.local_endpoint();
        debug!("Local connection {} closed: {}", endpoint, err);
        self.finish_handshake(Err(err.clone()));
        if endpoint != 0 {
            if let Some(parent) = self.parent.upgrade() {
                parent.remove_connection(endpoint);
            }
            self.node.transport_connection_closed(endpoint);
        }
    }
}

#[async_trait]
impl TransportConnection for LocalTransportConnection {
    async fn send_message(&self, message: Message) -> Result<()> {
        self.stream.send_message(message).await
    }

    fn close(&self) {
        self.stream.close();
    }

    fn check_connection(&self) -> Result<()> {
        self.stream.check_connection()
    }

    fn local_endpoint(&self) -> u32 {
        self.local_endpoint.load(Ordering::SeqCst)
    }

    fn remote_endpoint(&self) -> u32 {
        self.remote_endpoint.load(Ordering::SeqCst)
    }

    fn remote_node_id(&self) -> NodeId {
        self.stream.remote_node_id()
    }
}
