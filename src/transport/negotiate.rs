//! Attach handshake and the single-flight request sub-protocols
//! (`StreamOp` and `StreamCheckCapability`) carried over a stream transport.

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::*;

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::msg::{ElementData, Message, MessageElement, MessageEntry, MessageEntryType, NodeId};
use crate::transport::capability::Capability;
use crate::transport::stream::{ConnectionState, StreamTransport};
use crate::transport::lock;
use crate::transport::string_table::StringTable;
use crate::{Error, Result};

/// Attach request sent by the client side of a stream
pub const CREATE_CONNECTION: &str = "CreateConnection";
/// Ask the peer for its NodeID
pub const GET_REMOTE_NODE_ID: &str = "GetRemoteNodeID";
/// Ask the peer for its NodeID and NodeName
pub const GET_NODE_INFO: &str = "GetNodeInfo";

type Reply = oneshot::Sender<Result<MessageEntry>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    StreamOp,
    CapabilityCheck,
}

impl RequestKind {
    fn request_type(&self) -> MessageEntryType {
        match self {
            RequestKind::StreamOp => MessageEntryType::StreamOp,
            RequestKind::CapabilityCheck => MessageEntryType::StreamCheckCapability,
        }
    }
}

struct QueuedRequest {
    request_id: u32,
    message: Message,
    reply: Reply,
}

struct InFlight {
    request_id: u32,
    command: String,
    reply: Reply,
    timer: JoinHandle<()>,
}

impl InFlight {
    fn finish(self, result: Result<MessageEntry>) {
        self.timer.abort();
        let _ = self.reply.send(result);
    }
}

/// FIFO of requests with at most one awaiting its response
#[derive(Default)]
pub(crate) struct RequestQueue {
    current: Option<InFlight>,
    waiting: VecDeque<QueuedRequest>,
}

impl RequestQueue {
    pub(crate) fn len(&self) -> usize {
        self.waiting.len() + usize::from(self.current.is_some())
    }
}

fn node_id_element(entry: &MessageEntry, name: &str) -> Result<NodeId> {
    match entry.try_find_element(name) {
        Some(el) => {
            let s = el.as_str()?;
            if s.is_empty() {
                Ok(NodeId::any())
            } else {
                s.parse()
            }
        }
        None => Ok(NodeId::any()),
    }
}

fn string_element(entry: &MessageEntry, name: &str) -> Result<String> {
    match entry.try_find_element(name) {
        Some(el) => Ok(el.as_str()?.to_string()),
        None => Ok(String::new()),
    }
}

fn capability_list(caps: &[Capability]) -> MessageElement {
    MessageElement::new(
        "capabilities",
        ElementData::Elements(
            caps.iter()
                .map(|c| MessageElement::string("capability", c.name()))
                .collect(),
        ),
    )
}

fn parse_capability_list(entry: &MessageEntry) -> Result<Vec<Capability>> {
    let list = match entry.try_find_element("capabilities") {
        Some(el) => el.as_elements()?,
        None => return Ok(Vec::new()),
    };
    let mut caps = Vec::new();
    for el in list {
        match Capability::from_name(el.as_str()?) {
            Some(cap) => caps.push(cap),
            None => trace!("Ignoring unknown capability {:?}", el.data),
        }
    }
    Ok(caps)
}

impl StreamTransport {
    fn request_queue(&self, kind: RequestKind) -> &Mutex<RequestQueue> {
        match kind {
            RequestKind::StreamOp => &self.stream_ops,
            RequestKind::CapabilityCheck => &self.capability_checks,
        }
    }

    /// Capabilities this end is willing to use, given its configuration
    pub(crate) fn local_capabilities(&self) -> Vec<Capability> {
        let mut caps = vec![Capability::Message2Basic];
        if !self.config.disable_message4 {
            caps.push(Capability::Message4Basic);
            if !self.config.disable_string_table {
                caps.push(Capability::Message4StringTable);
            }
        }
        caps
    }

    fn activate_capabilities(&self, caps: &[Capability]) {
        let message4 = caps.contains(&Capability::Message4Basic);
        for cap in caps {
            if *cap == Capability::Message4StringTable && !message4 {
                continue;
            }
            self.capabilities.insert(*cap);
        }
        if message4 {
            self.recv_version4.store(true, Ordering::SeqCst);
            self.send_version4.store(true, Ordering::SeqCst);
            if caps.contains(&Capability::Message4StringTable) {
                self.ensure_string_table();
            }
        }
        debug!("Active capabilities: {:#x}", self.capabilities.bits());
    }

    fn ensure_string_table(&self) {
        if let Ok(mut table) = self.string_table.write() {
            if table.is_none() {
                *table = Some(Arc::new(StringTable::new()));
            }
        }
    }

    // ---- attach ----

    /// Attach the stream. A client sends `CreateConnection` naming the node it
    /// expects to reach and waits for the reply; a server waits for that
    /// request to arrive and be accepted.
    #[tracing::instrument(skip(self), fields(server = self.server))]
    pub async fn attach_stream(
        self: &Arc<Self>,
        target_node_id: NodeId,
        target_node_name: &str,
    ) -> Result<()> {
        if self.server {
            return self.await_attach().await;
        }

        let mut began = false;
        self.state.send_if_modified(|s| {
            if *s == ConnectionState::Unattached {
                *s = ConnectionState::Attaching;
                began = true;
                true
            } else {
                false
            }
        });
        if !began {
            self.check_connection()?;
            return Err(Error::InvalidOperation("Stream already attached".into()));
        }
        *lock(&self.attach_target) = Some((target_node_id, target_node_name.to_string()));

        let offered = self.local_capabilities();
        // The server may switch to Message4 as soon as it replies
        if offered.contains(&Capability::Message4Basic) {
            self.recv_version4.store(true, Ordering::SeqCst);
            if offered.contains(&Capability::Message4StringTable) {
                self.ensure_string_table();
            }
        }

        let args = vec![
            MessageElement::string("nodeid", self.node.node_id().to_string()),
            MessageElement::string("nodename", self.node.node_name()),
            MessageElement::string(
                "target_nodeid",
                if target_node_id.is_any() {
                    String::new()
                } else {
                    target_node_id.to_string()
                },
            ),
            MessageElement::string("target_nodename", target_node_name),
            capability_list(&offered),
        ];

        let attach = self.stream_op(CREATE_CONNECTION, args);
        let result = match timeout(self.config.attach_timeout, attach).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(Error::Timeout("Timed out attaching stream".into())),
        };
        if let Err(e) = &result {
            warn!("Attach failed: {}", e);
            self.close_with(e.clone());
        }
        result
    }

    async fn await_attach(self: &Arc<Self>) -> Result<()> {
        let mut rx = self.state.subscribe();
        let wait = async {
            rx.wait_for(|s| *s == ConnectionState::Connected || *s == ConnectionState::Closed)
                .await
                .map(|state| *state == ConnectionState::Connected)
        };
        let connected = timeout(self.config.attach_timeout, wait).await;
        match connected {
            Ok(Ok(true)) => Ok(()),
            Ok(_) => Err(self.check_connection().err().unwrap_or_else(Error::closed)),
            Err(_) => {
                let err = Error::Timeout("Timed out waiting for client to attach".into());
                warn!("{}", err);
                self.close_with(err.clone());
                Err(err)
            }
        }
    }

    /// Client side completion of `CreateConnection`, run on the reader before
    /// any later frame is decoded
    fn finish_attach(&self, entry: &MessageEntry) -> Result<()> {
        let node_id = node_id_element(entry, "nodeid")?;
        let node_name = string_element(entry, "nodename")?;
        let (target_id, target_name) = lock(&self.attach_target).clone().unwrap_or_default();
        if !target_id.is_any() && target_id != node_id {
            return Err(Error::Connection(format!(
                "Remote node returned NodeID {}, expected {}",
                node_id, target_id
            )));
        }
        if !target_name.is_empty() && target_name != node_name {
            return Err(Error::Connection(format!(
                "Remote node returned NodeName {}, expected {}",
                node_name, target_name
            )));
        }
        self.set_remote_node_id(node_id)?;
        self.set_remote_node_name(&node_name);
        let accepted = parse_capability_list(entry)?;
        self.activate_capabilities(&accepted);
        self.set_state(ConnectionState::Connected);
        info!("Attached to node {} ({})", node_id, node_name);
        Ok(())
    }

    fn accept_create_connection(&self, entry: &MessageEntry) -> Result<MessageEntry> {
        if !self.server {
            return Err(Error::InvalidOperation(
                "CreateConnection is only accepted by the server side".into(),
            ));
        }
        let mut began = false;
        self.state.send_if_modified(|s| {
            if *s == ConnectionState::Unattached {
                *s = ConnectionState::Attaching;
                began = true;
                true
            } else {
                false
            }
        });
        if !began {
            return Err(Error::InvalidOperation("Stream already attached".into()));
        }

        match self.accept_attach_request(entry) {
            Ok(ret) => {
                self.set_state(ConnectionState::Connected);
                Ok(ret)
            }
            Err(e) => {
                self.state.send_if_modified(|s| {
                    if *s == ConnectionState::Attaching {
                        *s = ConnectionState::Unattached;
                        true
                    } else {
                        false
                    }
                });
                Err(e)
            }
        }
    }

    fn accept_attach_request(&self, entry: &MessageEntry) -> Result<MessageEntry> {
        let client_id = node_id_element(entry, "nodeid")?;
        let client_name = string_element(entry, "nodename")?;
        let target_id = node_id_element(entry, "target_nodeid")?;
        let target_name = string_element(entry, "target_nodename")?;

        let local_id = self.node.node_id();
        let local_name = self.node.node_name();
        if !target_id.is_any() && target_id != local_id {
            return Err(Error::NodeNotFound(format!("Node {} not found", target_id)));
        }
        if !target_name.is_empty() && target_name != local_name {
            return Err(Error::NodeNotFound(format!("Node {} not found", target_name)));
        }

        let supported = self.local_capabilities();
        let mut accepted: Vec<Capability> = parse_capability_list(entry)?
            .into_iter()
            .filter(|c| supported.contains(c))
            .collect();
        if !accepted.contains(&Capability::Message4Basic) {
            accepted.retain(|c| *c != Capability::Message4StringTable);
        }

        // Write-once, so only after the whole request has been accepted
        self.set_remote_node_id(client_id)?;
        self.set_remote_node_name(&client_name);
        // The reply is negotiation traffic and therefore still Message2
        self.activate_capabilities(&accepted);
        info!("Node {} ({}) attached", client_id, client_name);

        Ok(MessageEntry::new(MessageEntryType::StreamOpRet, CREATE_CONNECTION)
            .with_request_id(entry.request_id)
            .with_element(MessageElement::string("nodeid", local_id.to_string()))
            .with_element(MessageElement::string("nodename", local_name))
            .with_element(capability_list(&accepted)))
    }

    // ---- request queues ----

    /// Run a `StreamOp` command on the peer. Requests are sent one at a time
    /// in call order; each fails with `Timeout` after `stream_op_timeout`.
    pub async fn stream_op(
        self: &Arc<Self>,
        command: &str,
        args: Vec<MessageElement>,
    ) -> Result<MessageEntry> {
        let mut entry = MessageEntry::new(MessageEntryType::StreamOp, command);
        entry.elements = args;
        self.request(RequestKind::StreamOp, entry).await
    }

    /// Ask the peer whether it supports capability `name`. A non-zero answer
    /// activates the capability on this connection.
    pub async fn check_stream_capability(self: &Arc<Self>, name: &str) -> Result<u32> {
        let entry = MessageEntry::new(MessageEntryType::StreamCheckCapability, name);
        let ret = self.request(RequestKind::CapabilityCheck, entry).await?;
        let value = ret.find_element("return")?.as_u32()?;
        if value != 0 {
            if let Some(cap) = Capability::from_name(name) {
                self.capabilities.insert(cap);
                if cap == Capability::LargeTransfer {
                    self.set_large_transfer_authorized(true, true);
                }
            }
        }
        Ok(value)
    }

    /// Fetch the peer's NodeID without relying on the attach result
    pub async fn get_remote_node_id(self: &Arc<Self>) -> Result<NodeId> {
        let ret = self.stream_op(GET_REMOTE_NODE_ID, Vec::new()).await?;
        node_id_element(&ret, "nodeid")
    }

    async fn request(
        self: &Arc<Self>,
        kind: RequestKind,
        mut entry: MessageEntry,
    ) -> Result<MessageEntry> {
        self.check_connection()?;
        let request_id = self.next_request_id();
        entry.request_id = request_id;
        let (reply, rx) = oneshot::channel();
        lock(self.request_queue(kind)).waiting.push_back(QueuedRequest {
            request_id,
            message: Message::new().with_entry(entry),
            reply,
        });
        self.pump(kind);
        rx.await.unwrap_or_else(|_| Err(Error::closed()))
    }

    /// Start the next queued request if none is in flight
    fn pump(self: &Arc<Self>, kind: RequestKind) {
        let (request_id, message) = {
            let mut q = lock(self.request_queue(kind));
            if q.current.is_some() {
                return;
            }
            let next = match q.waiting.pop_front() {
                Some(next) => next,
                None => return,
            };
            let command = next
                .message
                .first_entry()
                .map(|e| e.member_name.clone())
                .unwrap_or_default();
            let weak = Arc::downgrade(self);
            let period = self.config.stream_op_timeout;
            let request_id = next.request_id;
            let timer = self.handle.spawn(async move {
                tokio::time::sleep(period).await;
                if let Some(transport) = weak.upgrade() {
                    transport.request_timed_out(kind, request_id, period);
                }
            });
            q.current = Some(InFlight {
                request_id,
                command,
                reply: next.reply,
                timer,
            });
            (request_id, next.message)
        };

        let weak = Arc::downgrade(self);
        self.send_message_with(message, move |result| {
            if let (Err(e), Some(transport)) = (result, weak.upgrade()) {
                transport.complete_request(kind, request_id, Err(e));
            }
        });
    }

    /// Remove the in-flight request if it is still `request_id`. Whoever
    /// removes it first (response, timer or send failure) completes it.
    fn take_in_flight(&self, kind: RequestKind, request_id: u32) -> Option<InFlight> {
        let mut q = lock(self.request_queue(kind));
        match &q.current {
            Some(current) if current.request_id == request_id => q.current.take(),
            _ => None,
        }
    }

    fn complete_request(
        self: &Arc<Self>,
        kind: RequestKind,
        request_id: u32,
        result: Result<MessageEntry>,
    ) {
        if let Some(in_flight) = self.take_in_flight(kind, request_id) {
            in_flight.finish(result);
            self.pump(kind);
        }
    }

    fn request_timed_out(self: &Arc<Self>, kind: RequestKind, request_id: u32, period: Duration) {
        debug!("{:?} request {} timed out", kind, request_id);
        self.complete_request(
            kind,
            request_id,
            Err(Error::Timeout(format!(
                "{:?} request timed out after {:?}",
                kind.request_type(),
                period
            ))),
        );
    }

    /// Fail every queued and in-flight request with `err`
    pub(crate) fn fail_requests(&self, err: &Error) {
        for kind in [RequestKind::StreamOp, RequestKind::CapabilityCheck] {
            let (current, waiting) = {
                let mut q = lock(self.request_queue(kind));
                (q.current.take(), std::mem::take(&mut q.waiting))
            };
            if let Some(current) = current {
                current.finish(Err(err.clone()));
            }
            for request in waiting {
                let _ = request.reply.send(Err(err.clone()));
            }
        }
    }

    // ---- incoming ----

    pub(crate) fn handle_stream_op_request(self: &Arc<Self>, message: Message) {
        let entry = match message.first_entry() {
            Some(entry) => entry,
            None => return,
        };
        trace!("StreamOp {} request {}", entry.member_name, entry.request_id);
        let result = match entry.member_name.as_str() {
            CREATE_CONNECTION => self.accept_create_connection(entry),
            GET_REMOTE_NODE_ID => {
                let node_id = self.node.node_id().to_string();
                Ok(MessageEntry::new(MessageEntryType::StreamOpRet, GET_REMOTE_NODE_ID)
                    .with_request_id(entry.request_id)
                    .with_element(MessageElement::string("nodeid", node_id)))
            }
            GET_NODE_INFO => {
                let node_id = self.node.node_id().to_string();
                Ok(MessageEntry::new(MessageEntryType::StreamOpRet, GET_NODE_INFO)
                    .with_request_id(entry.request_id)
                    .with_element(MessageElement::string("nodeid", node_id))
                    .with_element(MessageElement::string("nodename", self.node.node_name())))
            }
            other => Err(Error::InvalidOperation(format!("Unknown stream operation {}", other))),
        };
        let ret = match result {
            Ok(ret) => ret,
            Err(e) => {
                debug!("StreamOp {} failed: {}", entry.member_name, e);
                entry.error_response(MessageEntryType::StreamOpRet, &e)
            }
        };
        self.send_detached(Message::new().with_entry(ret));
    }

    pub(crate) fn handle_stream_op_response(self: &Arc<Self>, message: Message) {
        let entry = match message.entries.into_iter().next() {
            Some(entry) => entry,
            None => return,
        };
        let in_flight = match self.take_in_flight(RequestKind::StreamOp, entry.request_id) {
            Some(in_flight) => in_flight,
            None => {
                debug!("Ignoring StreamOp response {} with no matching request", entry.request_id);
                return;
            }
        };
        let mut result = entry.into_result();
        if in_flight.command == CREATE_CONNECTION && !self.server {
            result = result.and_then(|entry| self.finish_attach(&entry).map(|_| entry));
        }
        in_flight.finish(result);
        self.pump(RequestKind::StreamOp);
    }

    pub(crate) fn handle_check_capability_request(self: &Arc<Self>, message: Message) {
        let entry = match message.first_entry() {
            Some(entry) => entry,
            None => return,
        };
        let value = match Capability::from_name(&entry.member_name) {
            Some(Capability::LargeTransfer) => {
                self.capabilities.insert(Capability::LargeTransfer);
                self.set_large_transfer_authorized(true, true);
                Capability::LargeTransfer.bit()
            }
            // Attach-time capabilities are only reported once active
            Some(cap) if self.check_capability_active(cap) => cap.bit(),
            _ => 0,
        };
        let ret = MessageEntry::new(
            MessageEntryType::StreamCheckCapabilityRet,
            entry.member_name.clone(),
        )
        .with_request_id(entry.request_id)
            .with_element(MessageElement::uint32("return", value));
        self.send_detached(Message::new().with_entry(ret));
    }

    pub(crate) fn handle_check_capability_response(self: &Arc<Self>, message: Message) {
        let entry = match message.entries.into_iter().next() {
            Some(entry) => entry,
            None => return,
        };
        self.complete_request(RequestKind::CapabilityCheck, entry.request_id, entry.into_result());
    }

    /// Number of `StreamOp` requests queued or in flight
    pub fn pending_stream_ops(&self) -> usize {
        lock(&self.stream_ops).len()
    }
}
