// Tokio for async
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
// Tracing for logging
use tracing::*;
// Multi-threading primitives
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
// Misc other imports
use std::collections::VecDeque;
use std::future::Future;

use crate::msg::{Message, MessageEntry, MessageEntryType, NodeId};
use crate::node::NodeContext;
use crate::transport::buffer::ReceiveBuffer;
use crate::transport::capability::{Capability, CapabilitySet};
use crate::transport::frame::{self, WireVersion, HEADER_LEN};
use crate::transport::negotiate::RequestQueue;
use crate::transport::string_table::StringTable;
use crate::transport::{ensure_not_on_runtime, lock, MessageSink, StreamTransportConfig};
use crate::{Error, Result};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle of a stream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unattached,
    Attaching,
    Connected,
    Closed,
}

struct OutgoingEntry {
    message: Message,
    done: Option<oneshot::Sender<Result<()>>>,
}

impl OutgoingEntry {
    fn complete(self, result: Result<()>) {
        if let Some(done) = self.done {
            let _ = done.send(result);
        }
    }
}

#[derive(Default)]
struct SendQueue {
    entries: VecDeque<OutgoingEntry>,
    // Single-writer gate: set while a frame is being written
    sending: bool,
    // Completion of the entry being written
    in_flight: Option<oneshot::Sender<Result<()>>>,
    paused: bool,
    pause_waiters: Vec<oneshot::Sender<()>>,
    closed: bool,
}

#[derive(Default)]
struct ReceiveGate {
    // Set while a decoded message is being handed upward
    delivering: bool,
    paused: bool,
    pause_waiters: Vec<oneshot::Sender<()>>,
    closed: bool,
}

/// Framing and negotiation engine for one peer byte stream.
///
/// Owns a reader task, a writer task and a heartbeat task. The reader and
/// writer hold strong references while they run; everything scheduled for
/// later (timers, heartbeat) holds a `Weak` and does nothing once the
/// connection is gone.
pub struct StreamTransport {
    pub(crate) server: bool,
    pub(crate) config: StreamTransportConfig,
    pub(crate) node: Arc<dyn NodeContext>,
    pub(crate) handle: Handle,
    sink: RwLock<Option<Weak<dyn MessageSink>>>,
    io: Mutex<Option<(BoxedReader, BoxedWriter)>>,

    connected: AtomicBool,
    pub(crate) state: watch::Sender<ConnectionState>,
    remote_node_id: RwLock<NodeId>,
    remote_node_name: RwLock<String>,
    // NodeID/NodeName a client expects the server to report
    pub(crate) attach_target: Mutex<Option<(NodeId, String)>>,

    pub(crate) capabilities: CapabilitySet,
    pub(crate) send_version4: AtomicBool,
    pub(crate) recv_version4: AtomicBool,
    pub(crate) string_table: RwLock<Option<Arc<StringTable>>>,
    send_large_transfer_authorized: AtomicBool,
    recv_large_transfer_authorized: AtomicBool,

    send_queue: Mutex<SendQueue>,
    send_notify: Notify,
    receive_gate: Mutex<ReceiveGate>,
    receive_notify: Notify,

    pub(crate) stream_ops: Mutex<RequestQueue>,
    pub(crate) capability_checks: Mutex<RequestQueue>,
    next_request_id: AtomicU32,

    tlastrecv: Mutex<Instant>,
    tlastsend: Mutex<Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) heartbeat_timer: Mutex<Option<JoinHandle<()>>>,
    close_error: Mutex<Option<Error>>,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("server", &self.server)
            .field("state", &*self.state.borrow())
            .field("remote_node_id", &self.remote_node_id())
            .finish()
    }
}

impl StreamTransport {
    /// Wrap a connected byte stream. Nothing is read or written until `start`.
    pub fn new<S>(
        stream: S,
        server: bool,
        config: StreamTransportConfig,
        node: Arc<dyn NodeContext>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let handle = node.io_handle();
        let (state, _) = watch::channel(ConnectionState::Unattached);
        Arc::new(StreamTransport {
            server,
            config,
            node,
            handle,
            sink: RwLock::new(None),
            io: Mutex::new(Some((Box::new(reader), Box::new(writer)))),
            connected: AtomicBool::new(true),
            state,
            remote_node_id: RwLock::new(NodeId::any()),
            remote_node_name: RwLock::new(String::new()),
            attach_target: Mutex::new(None),
            capabilities: CapabilitySet::new(Capability::Message2Basic.bit()),
            send_version4: AtomicBool::new(false),
            recv_version4: AtomicBool::new(false),
            string_table: RwLock::new(None),
            send_large_transfer_authorized: AtomicBool::new(false),
            recv_large_transfer_authorized: AtomicBool::new(false),
            send_queue: Mutex::new(SendQueue::default()),
            send_notify: Notify::new(),
            receive_gate: Mutex::new(ReceiveGate::default()),
            receive_notify: Notify::new(),
            stream_ops: Mutex::new(RequestQueue::default()),
            capability_checks: Mutex::new(RequestQueue::default()),
            next_request_id: AtomicU32::new(1),
            tlastrecv: Mutex::new(Instant::now()),
            tlastsend: Mutex::new(Instant::now()),
            tasks: Mutex::new(Vec::new()),
            heartbeat_timer: Mutex::new(None),
            close_error: Mutex::new(None),
        })
    }

    /// Spawn the reader, writer and heartbeat tasks
    #[tracing::instrument(skip_all, fields(server = self.server))]
    pub fn start(self: &Arc<Self>, sink: Weak<dyn MessageSink>) -> Result<()> {
        if let Ok(mut s) = self.sink.write() {
            *s = Some(sink);
        }
        let (reader, writer) = lock(&self.io)
            .take()
            .ok_or_else(|| Error::InvalidOperation("Transport already started or closed".into()))?;
        let r = self.handle.spawn(self.clone().run_reader(reader));
        let w = self.handle.spawn(self.clone().run_writer(writer));
        lock(&self.tasks).extend([r, w]);
        self.start_heartbeat();
        debug!("Stream transport started");
        Ok(())
    }

    pub fn is_server(&self) -> bool {
        self.server
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn check_connection(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(lock(&self.close_error)
                .clone()
                .unwrap_or_else(|| Error::Connection("Connection lost".into())))
        }
    }

    pub fn config(&self) -> &StreamTransportConfig {
        &self.config
    }

    pub fn remote_node_id(&self) -> NodeId {
        self.remote_node_id.read().map(|id| *id).unwrap_or_default()
    }

    pub fn remote_node_name(&self) -> String {
        self.remote_node_name
            .read()
            .map(|n| n.clone())
            .unwrap_or_default()
    }

    /// Record the peer's NodeID. Only the first assignment is accepted.
    pub fn set_remote_node_id(&self, node_id: NodeId) -> Result<()> {
        let mut current = self
            .remote_node_id
            .write()
            .map_err(|_| Error::InvalidOperation("Remote NodeID lock poisoned".into()))?;
        if !current.is_any() {
            return Err(Error::InvalidOperation("Remote NodeID already set".into()));
        }
        *current = node_id;
        Ok(())
    }

    pub(crate) fn set_remote_node_name(&self, node_name: &str) {
        if let Ok(mut n) = self.remote_node_name.write() {
            *n = node_name.to_string();
        }
    }

    /// Synchronous check against the negotiated capability mask
    pub fn check_capability_active(&self, cap: Capability) -> bool {
        self.capabilities.contains(cap)
    }

    pub fn active_capabilities(&self) -> u32 {
        self.capabilities.bits()
    }

    /// Whether outgoing frames use the Message4 format
    pub fn send_version4(&self) -> bool {
        self.send_version4.load(Ordering::SeqCst)
    }

    pub fn string_table(&self) -> Option<Arc<StringTable>> {
        self.string_table.read().ok().and_then(|t| t.clone())
    }

    /// Allow messages up to `max_large_message_size` in either direction
    pub fn set_large_transfer_authorized(&self, send: bool, recv: bool) {
        self.send_large_transfer_authorized
            .store(send, Ordering::SeqCst);
        self.recv_large_transfer_authorized
            .store(recv, Ordering::SeqCst);
    }

    /// Current limit for outgoing frames
    pub fn max_send_size(&self) -> usize {
        if self.send_large_transfer_authorized.load(Ordering::SeqCst) {
            self.config.max_large_message_size
        } else {
            self.config.max_message_size
        }
    }

    /// Current limit for incoming frames
    pub fn max_message_size(&self) -> usize {
        if self.recv_large_transfer_authorized.load(Ordering::SeqCst) {
            self.config.max_large_message_size
        } else {
            self.config.max_message_size
        }
    }

    pub fn last_receive_time(&self) -> Instant {
        *lock(&self.tlastrecv)
    }

    pub(crate) fn last_send_time(&self) -> Instant {
        *lock(&self.tlastsend)
    }

    pub(crate) fn next_request_id(&self) -> u32 {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|s| {
            if *s == ConnectionState::Closed || *s == state {
                return false;
            }
            *s = state;
            true
        });
    }

    // ---- send pipeline ----

    fn enqueue(&self, message: Message, done: Option<oneshot::Sender<Result<()>>>) {
        let entry = OutgoingEntry { message, done };
        {
            let mut q = lock(&self.send_queue);
            if q.closed {
                drop(q);
                let err = self.check_connection().err().unwrap_or_else(Error::closed);
                entry.complete(Err(err));
                return;
            }
            q.entries.push_back(entry);
        }
        self.send_notify.notify_one();
    }

    /// Queue `message` and return a future resolving once it has been
    /// written. The message is queued before this returns, so messages go
    /// on the wire in the order this method was called.
    pub fn send_message(
        &self,
        message: Message,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.enqueue(message, Some(tx));
        async move { rx.await.unwrap_or_else(|_| Err(Error::closed())) }
    }

    /// Queue `message` and invoke `callback` exactly once with the outcome
    pub fn send_message_with<F>(&self, message: Message, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let fut = self.send_message(message);
        self.handle.spawn(async move { callback(fut.await) });
    }

    /// Queue a message nobody waits on
    pub(crate) fn send_detached(&self, message: Message) {
        self.enqueue(message, None);
    }

    /// Block the calling thread until `message` has been written
    pub fn send_message_blocking(&self, message: Message) -> Result<()> {
        ensure_not_on_runtime()?;
        let fut = self.send_message(message);
        self.handle.block_on(fut)
    }

    /// Stop writing after the current frame. Resolves once no frame is in flight.
    pub async fn pause_send(&self) -> Result<()> {
        let rx = {
            let mut q = lock(&self.send_queue);
            if q.closed {
                return Err(Error::closed());
            }
            q.paused = true;
            if let Some(table) = self.string_table() {
                table.pause_updates();
            }
            if !q.sending {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            q.pause_waiters.push(tx);
            rx
        };
        rx.await.map_err(|_| Error::closed())
    }

    /// Continue draining the send queue in its original order
    pub fn resume_send(&self) {
        lock(&self.send_queue).paused = false;
        if let Some(table) = self.string_table() {
            table.resume_updates();
        }
        self.send_notify.notify_one();
    }

    pub(crate) fn send_queue_idle(&self) -> bool {
        let q = lock(&self.send_queue);
        q.entries.is_empty() && !q.sending
    }

    async fn next_outgoing(&self) -> Option<Message> {
        loop {
            {
                let mut q = lock(&self.send_queue);
                if q.closed {
                    return None;
                }
                if !q.paused {
                    if let Some(entry) = q.entries.pop_front() {
                        q.sending = true;
                        q.in_flight = entry.done;
                        return Some(entry.message);
                    }
                }
            }
            self.send_notify.notified().await;
        }
    }

    /// Release the writer gate and complete the in-flight entry with `result`
    fn finish_sending(&self, result: Result<()>) {
        let (waiters, done) = {
            let mut q = lock(&self.send_queue);
            q.sending = false;
            let waiters = if q.paused {
                std::mem::take(&mut q.pause_waiters)
            } else {
                Vec::new()
            };
            (waiters, q.in_flight.take())
        };
        for w in waiters {
            let _ = w.send(());
        }
        if let Some(done) = done {
            let _ = done.send(result);
        }
    }

    fn encode(&self, message: &Message, proposals: &mut Vec<(u32, String)>) -> Result<Vec<u8>> {
        let negotiation = message
            .first_entry_type()
            .map(|t| t.is_stream_negotiation())
            .unwrap_or(false);
        let version = if self.send_version4() && !negotiation {
            WireVersion::Message4
        } else {
            WireVersion::Message2
        };
        let bytes = match version {
            WireVersion::Message2 => frame::encode_message2(message)?,
            WireVersion::Message4 => {
                let table = if self.check_capability_active(Capability::Message4StringTable) {
                    self.string_table()
                } else {
                    None
                };
                frame::encode_message4(message, table.as_deref(), proposals)?
            }
        };
        if bytes.len() > self.max_send_size() {
            return Err(Error::Protocol(format!(
                "Message size {} exceeds maximum message size {}",
                bytes.len(),
                self.max_send_size()
            )));
        }
        Ok(bytes)
    }

    async fn run_writer(self: Arc<Self>, mut writer: BoxedWriter) {
        while let Some(message) = self.next_outgoing().await {
            let mut proposals = Vec::new();
            let bytes = match self.encode(&message, &mut proposals) {
                Ok(bytes) => bytes,
                Err(e) => {
                    // Only this message is affected; the stream is still in sync
                    warn!("Failed to encode outgoing message: {}", e);
                    self.abandon_proposals(&proposals);
                    self.finish_sending(Err(e));
                    continue;
                }
            };

            let mut result = writer.write_all(&bytes).await.map_err(Error::from);
            if !proposals.is_empty() {
                if result.is_ok() {
                    result = self.write_proposal(&mut writer, proposals).await;
                } else {
                    self.abandon_proposals(&proposals);
                }
            }
            if result.is_ok() {
                result = writer.flush().await.map_err(Error::from);
            }
            *lock(&self.tlastsend) = Instant::now();

            match result {
                Ok(()) => self.finish_sending(Ok(())),
                Err(e) => {
                    error!("Stream write failed: {}", e);
                    self.finish_sending(Err(e.clone()));
                    self.close_with(e);
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    }

    fn abandon_proposals(&self, proposals: &[(u32, String)]) {
        if proposals.is_empty() {
            return;
        }
        if let Some(table) = self.string_table() {
            trace!("Abandoning {} unsent string table proposals", proposals.len());
            table.abandon(proposals);
        }
    }

    async fn write_proposal(
        &self,
        writer: &mut BoxedWriter,
        proposals: Vec<(u32, String)>,
    ) -> Result<()> {
        let table = match self.string_table() {
            Some(table) => table,
            None => return Ok(()),
        };
        let request_id = self.next_request_id();
        let message = StringTable::proposal_message(request_id, &proposals);
        // Proposals are spelled out, never coded with the table they extend
        let bytes = match frame::encode_message4(&message, None, &mut Vec::new()) {
            Ok(bytes) => bytes,
            Err(e) => {
                table.abandon(&proposals);
                return Err(e);
            }
        };
        trace!("Proposing {} string table entries", proposals.len());
        // Expiry releases these if the write below fails
        table.record_proposal(request_id, proposals);
        writer.write_all(&bytes).await?;
        Ok(())
    }

    // ---- receive pipeline ----

    /// Stop delivering after the current message. Resolves once no message
    /// is being delivered.
    pub async fn pause_receive(&self) -> Result<()> {
        let rx = {
            let mut gate = lock(&self.receive_gate);
            if gate.closed {
                return Err(Error::closed());
            }
            gate.paused = true;
            if !gate.delivering {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            gate.pause_waiters.push(tx);
            rx
        };
        rx.await.map_err(|_| Error::closed())
    }

    pub fn resume_receive(&self) {
        lock(&self.receive_gate).paused = false;
        self.receive_notify.notify_one();
    }

    async fn begin_delivery(&self) -> bool {
        loop {
            {
                let mut gate = lock(&self.receive_gate);
                if gate.closed {
                    return false;
                }
                if !gate.paused {
                    gate.delivering = true;
                    return true;
                }
            }
            self.receive_notify.notified().await;
        }
    }

    fn end_delivery(&self) {
        let waiters = {
            let mut gate = lock(&self.receive_gate);
            gate.delivering = false;
            if gate.paused {
                std::mem::take(&mut gate.pause_waiters)
            } else {
                Vec::new()
            }
        };
        for w in waiters {
            let _ = w.send(());
        }
    }

    async fn fill(&self, reader: &mut BoxedReader, buf: &mut ReceiveBuffer) -> Result<()> {
        let n = reader.read(buf.spare_mut()).await?;
        if n == 0 {
            return Err(Error::Connection("Connection closed by remote host".into()));
        }
        buf.advance(n);
        *lock(&self.tlastrecv) = Instant::now();
        Ok(())
    }

    async fn read_frame(
        &self,
        reader: &mut BoxedReader,
        buf: &mut ReceiveBuffer,
        first_frame: bool,
    ) -> Result<Message> {
        while buf.available() < HEADER_LEN {
            self.fill(reader, buf).await?;
        }
        let header = frame::parse_header(buf.peek(), self.max_message_size(), first_frame)?;
        if header.version == WireVersion::Message4 && !self.recv_version4.load(Ordering::SeqCst) {
            return Err(Error::Protocol(
                "Received Message4 frame before Message4 was negotiated".into(),
            ));
        }
        buf.reserve_frame(header.length);
        let mut continuation_reads = 0usize;
        while buf.available() < header.length {
            self.fill(reader, buf).await?;
            continuation_reads += 1;
        }
        if continuation_reads > 0 {
            trace!(
                "Frame of {} bytes needed {} continuation reads",
                header.length,
                continuation_reads
            );
        }
        let bytes = buf.take(header.length);
        buf.shrink();
        let table = self.string_table();
        frame::decode_frame(&bytes, &header, table.as_deref())
    }

    async fn run_reader(self: Arc<Self>, mut reader: BoxedReader) {
        let mut buf = ReceiveBuffer::default();
        let mut first_frame = true;
        loop {
            let message = match self.read_frame(&mut reader, &mut buf, first_frame).await {
                Ok(message) => message,
                Err(e) => {
                    if self.is_connected() {
                        debug!("Stream read ended: {}", e);
                    }
                    self.close_with(e);
                    break;
                }
            };
            first_frame = false;
            if !self.begin_delivery().await {
                break;
            }
            self.dispatch(message);
            self.end_delivery();
        }
    }

    fn dispatch(self: &Arc<Self>, message: Message) {
        let entry_type = match message.first_entry_type() {
            Some(t) => t,
            None => {
                debug!("Dropping message without entries");
                return;
            }
        };
        match entry_type {
            MessageEntryType::StreamOp => self.handle_stream_op_request(message),
            MessageEntryType::StreamOpRet => self.handle_stream_op_response(message),
            MessageEntryType::StreamCheckCapability => {
                self.handle_check_capability_request(message)
            }
            MessageEntryType::StreamCheckCapabilityRet => {
                self.handle_check_capability_response(message)
            }
            MessageEntryType::StringTableOp => self.handle_string_table_proposal(message),
            MessageEntryType::StringTableOpRet => {
                if let (Some(table), Some(entry)) = (self.string_table(), message.first_entry()) {
                    if let Err(e) = table.handle_confirmation(entry) {
                        warn!("Invalid string table confirmation: {}", e);
                    }
                }
            }
            MessageEntryType::ConnectionTest => self.handle_connection_test(message),
            MessageEntryType::ConnectionTestRet => {}
            _ => {
                if self.state() != ConnectionState::Connected {
                    warn!("Dropping {:?} received before the stream was attached", entry_type);
                    return;
                }
                let sink = self.sink.read().ok().and_then(|s| s.as_ref().and_then(Weak::upgrade));
                match sink {
                    Some(sink) => sink.message_received(message),
                    None => debug!("No message sink, dropping message"),
                }
            }
        }
    }

    fn handle_string_table_proposal(&self, message: Message) {
        let (table, entry) = match (self.string_table(), message.first_entry()) {
            (Some(table), Some(entry)) => (table, entry),
            _ => {
                warn!("String table proposal received without an active string table");
                return;
            }
        };
        match table.handle_proposal(entry) {
            Ok(ret) => self.send_detached(Message::new().with_entry(ret)),
            Err(e) => warn!("Invalid string table proposal: {}", e),
        }
    }

    fn handle_connection_test(&self, message: Message) {
        if let Some(entry) = message.first_entry() {
            if entry.request_id != 0 {
                let ret = MessageEntry::new(MessageEntryType::ConnectionTestRet, "")
                    .with_request_id(entry.request_id);
                self.send_detached(Message::new().with_entry(ret));
            }
        }
    }

    // ---- close ----

    /// Close the connection. Idempotent and callable from any thread.
    pub fn close(&self) {
        self.close_with(Error::closed());
    }

    /// Close with `err`, which every pending operation receives
    pub(crate) fn close_with(&self, err: Error) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("Closing stream transport: {}", err);
        *lock(&self.close_error) = Some(err.clone());
        self.state.send_replace(ConnectionState::Closed);

        if let Some(timer) = lock(&self.heartbeat_timer).take() {
            timer.abort();
        }

        let (in_flight, entries, send_waiters) = {
            let mut q = lock(&self.send_queue);
            q.closed = true;
            (
                q.in_flight.take(),
                std::mem::take(&mut q.entries),
                std::mem::take(&mut q.pause_waiters),
            )
        };
        drop(send_waiters);
        if let Some(done) = in_flight {
            let _ = done.send(Err(err.clone()));
        }
        for entry in entries {
            entry.complete(Err(err.clone()));
        }
        self.send_notify.notify_one();

        let receive_waiters = {
            let mut gate = lock(&self.receive_gate);
            gate.closed = true;
            std::mem::take(&mut gate.pause_waiters)
        };
        drop(receive_waiters);
        self.receive_notify.notify_one();

        self.fail_requests(&err);

        // Dropping the halves releases the stream if `start` never ran
        drop(lock(&self.io).take());
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }

        let sink = self.sink.read().ok().and_then(|s| s.as_ref().and_then(Weak::upgrade));
        if let Some(sink) = sink {
            sink.transport_closed(&err);
        }
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        if let Ok(mut timer) = self.heartbeat_timer.lock() {
            if let Some(timer) = timer.take() {
                timer.abort();
            }
        }
    }
}
