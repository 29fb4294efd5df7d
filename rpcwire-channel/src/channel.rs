//! Request/response correlation over one framed connection.
//!
//! A [`Channel`] turns transport frames into packets, matches responses to
//! outstanding requests by sequence number, dispatches inbound requests to
//! registered handlers, and drains in-flight work before half-closing.
//!
//! State moves `Active -> Ending -> Ended` and never back.

use crate::config::{ChannelConfig, Config, StreamCapacity};
use crate::handler::{ApiCall, ApiHandler, PushHandler, PushMessage, Responder};
use crate::manager::{StreamManager, StreamPolicy};
use crate::sender::StreamSender;
use crate::transport::{Frame, TransportEvent, Transporter};
use parking_lot::{Mutex, MutexGuard};
use rpcwire_protocol::{
    Command, Content, Decoder, Encoder, ErrorKind, Packet, Payload, RpcError, ABORT_INDEX,
    MAX_SEQUENCE,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Capacity of the channel event broadcast.
const EVENT_CAPACITY: usize = 64;

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Normal operation.
    Active,
    /// Shutdown requested; draining in-flight work.
    Ending,
    /// Transport is being or has been closed.
    Ended,
}

/// Events a channel reports to the application.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The peer pinged us; carries the echoed payload.
    Ping(Payload),
    /// The peer half-closed.
    End,
    /// Our half-close completed.
    Finish,
    /// The transport is fully closed.
    Close,
    Error(RpcError),
    Warning(String),
}

type Completion = oneshot::Sender<Result<Content, RpcError>>;

struct PendingRequest {
    command: Command,
    tx: Completion,
    timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    fn resolve(self, result: Result<Content, RpcError>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have given up on the future.
        let _ = self.tx.send(result);
    }
}

struct ChannelCore {
    state: ChannelState,
    next_sequence: u64,
    sent: HashMap<u64, PendingRequest>,
    received_in_flight: usize,
    /// Sequences of inbound CLOSE requests, answered once drained.
    close_replies: Vec<u64>,
    remote_ended: bool,
    finished: bool,
    closed: bool,
}

impl ChannelCore {
    fn new() -> Self {
        Self {
            state: ChannelState::Active,
            next_sequence: 0,
            sent: HashMap::new(),
            received_in_flight: 0,
            close_replies: Vec::new(),
            remote_ended: false,
            finished: false,
            closed: false,
        }
    }

    fn is_idle(&self) -> bool {
        self.sent.is_empty() && self.received_in_flight == 0
    }

    /// Next free sequence number. Wraps at 2^48 and skips numbers in flight.
    fn allocate_sequence(&mut self) -> u64 {
        loop {
            let sequence = self.next_sequence;
            self.next_sequence = if sequence >= MAX_SEQUENCE {
                0
            } else {
                sequence + 1
            };
            if !self.sent.contains_key(&sequence) {
                return sequence;
            }
        }
    }
}

pub(crate) struct ChannelInner {
    id: String,
    transport: Arc<dyn Transporter>,
    timeout: Option<Duration>,
    core: Mutex<ChannelCore>,
    streams: Arc<StreamManager>,
    owns_streams: bool,
    api_handler: Option<Arc<dyn ApiHandler>>,
    push_handler: Option<Arc<dyn PushHandler>>,
    events: broadcast::Sender<ChannelEvent>,
    closed: watch::Sender<bool>,
}

impl ChannelInner {
    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn warn(&self, message: String) {
        tracing::warn!("channel {}: {}", self.id, message);
        self.emit(ChannelEvent::Warning(message));
    }

    fn state(&self) -> ChannelState {
        self.core.lock().state
    }

    fn writable(&self) -> bool {
        self.state() == ChannelState::Active && self.transport.writable()
    }

    // ---------------------------------------------------------------------
    // Outbound requests
    // ---------------------------------------------------------------------

    fn start_request(
        self: &Arc<Self>,
        command: Command,
        content: Content,
    ) -> Result<oneshot::Receiver<Result<Content, RpcError>>, RpcError> {
        let mut core = self.core.lock();
        if core.state != ChannelState::Active || !self.transport.writable() {
            return Err(ErrorKind::ChannelInactive.into());
        }

        let sequence = core.allocate_sequence();
        let frame = Encoder::encode(&Packet::request(command, sequence, content))?;
        let (tx, rx) = oneshot::channel();
        let timer = self.timeout.map(|timeout| self.arm_timer(sequence, timeout));
        core.sent.insert(
            sequence,
            PendingRequest {
                command,
                tx,
                timer,
            },
        );

        // Written under the lock so requests hit the wire in sequence order.
        if let Err(e) = self.transport.write(frame) {
            if let Some(pending) = core.sent.remove(&sequence) {
                if let Some(timer) = pending.timer {
                    timer.abort();
                }
            }
            tracing::debug!(
                "channel {}: write of {} #{} failed: {}",
                self.id,
                command.name(),
                sequence,
                e
            );
            return Err(e.into());
        }

        tracing::debug!("channel {}: sent {} #{}", self.id, command.name(), sequence);
        Ok(rx)
    }

    fn arm_timer(self: &Arc<Self>, sequence: u64, timeout: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(sequence);
            }
        })
    }

    fn expire(&self, sequence: u64) {
        let pending = self.core.lock().sent.remove(&sequence);
        if let Some(pending) = pending {
            tracing::debug!("channel {}: request #{} timed out", self.id, sequence);
            // The timer handle belongs to this very task; dropping it is enough.
            let _ = pending.tx.send(Err(ErrorKind::Timeout.into()));
            self.check_drain();
        }
    }

    async fn request(
        self: &Arc<Self>,
        command: Command,
        content: Content,
    ) -> Result<Content, RpcError> {
        let rx = self.start_request(command, content)?;
        rx.await
            .unwrap_or_else(|_| Err(ErrorKind::ChannelClosed.into()))
    }

    // ---------------------------------------------------------------------
    // Inbound packets
    // ---------------------------------------------------------------------

    fn on_frame(self: &Arc<Self>, frame: Frame) {
        let packet = match Decoder::decode(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::error!("channel {}: undecodable packet, closing: {}", self.id, e);
                self.core.lock().state = ChannelState::Ended;
                self.emit(ChannelEvent::Error(e.into()));
                self.transport.destroy();
                return;
            }
        };

        tracing::debug!(
            "channel {}: received {} {} #{}",
            self.id,
            packet.command.name(),
            packet.packet_type.name(),
            packet.sequence
        );

        if packet.is_request() {
            self.on_request(packet);
        } else {
            self.on_response(packet);
        }
    }

    fn on_response(&self, packet: Packet) {
        let pending = self.core.lock().sent.remove(&packet.sequence);
        let Some(pending) = pending else {
            tracing::debug!(
                "channel {}: no pending request for response #{}, dropping",
                self.id,
                packet.sequence
            );
            return;
        };

        if pending.command != packet.command {
            self.warn(format!(
                "response #{} is {} but request was {}",
                packet.sequence,
                packet.command.name(),
                pending.command.name()
            ));
            self.begin_end();
            pending.resolve(Err(ErrorKind::InvalidResponse.into()));
            // begin_end does nothing if we were already Ending.
            self.check_drain();
            return;
        }

        let result = match packet.content {
            Content::Error(error) => Err(error),
            content => Ok(content),
        };
        pending.resolve(result);
        self.check_drain();
    }

    fn on_request(self: &Arc<Self>, packet: Packet) {
        let Packet {
            command,
            sequence,
            content,
            ..
        } = packet;

        let mut core = self.core.lock();
        if core.state != ChannelState::Active {
            drop(core);
            self.send_reply(Packet::error(command, sequence, ErrorKind::ChannelInactive.into()));
            return;
        }

        match content {
            Content::Ping(payload) => {
                drop(core);
                self.send_reply(Packet::success(
                    Command::Ping,
                    sequence,
                    Content::Ping(payload.clone()),
                ));
                self.emit(ChannelEvent::Ping(payload));
            }
            Content::PushMessage(body) => {
                drop(core);
                match &self.push_handler {
                    Some(handler) => {
                        self.send_reply(Packet::success(
                            Command::PushMessage,
                            sequence,
                            Content::Empty,
                        ));
                        handler.handle(PushMessage { body, sequence });
                    }
                    None => self.reply_error(command, sequence, ErrorKind::CmdNotImpl),
                }
            }
            Content::ApiCall { name, body } => match self.api_handler.clone() {
                Some(handler) => {
                    core.received_in_flight += 1;
                    drop(core);
                    let responder = Responder::new(self.clone(), sequence);
                    handler.handle(
                        ApiCall {
                            name,
                            body,
                            sequence,
                        },
                        responder,
                    );
                }
                None => {
                    drop(core);
                    self.reply_error(command, sequence, ErrorKind::CmdNotImpl);
                }
            },
            Content::BinaryChunk {
                stream_id,
                index,
                chunk,
            } => {
                drop(core);
                match self.on_chunk(stream_id, index, chunk) {
                    Ok(()) => self.send_reply(Packet::success(
                        Command::BinaryChunk,
                        sequence,
                        Content::Empty,
                    )),
                    Err(e) => self.send_reply(Packet::error(Command::BinaryChunk, sequence, e)),
                }
            }
            Content::Empty if command == Command::Close => {
                core.close_replies.push(sequence);
                self.begin_end_locked(core);
            }
            _ => {
                drop(core);
                self.reply_error(command, sequence, ErrorKind::InvalidPacket);
            }
        }
    }

    fn on_chunk(&self, stream_id: u32, index: u32, chunk: Payload) -> Result<(), RpcError> {
        if self.streams.capacity() == StreamCapacity::Disabled {
            return Err(ErrorKind::CmdNotImpl.into());
        }
        let stream = self
            .streams
            .get(stream_id)
            .ok_or(RpcError::Protocol(ErrorKind::StreamNotFound))?;
        if index == ABORT_INDEX {
            stream.abort();
            return Ok(());
        }
        stream.push(index, chunk)
    }

    pub(crate) fn complete_call(&self, sequence: u64, result: Result<Payload, RpcError>) {
        let packet = match result {
            Ok(body) => Packet::success(Command::ApiCall, sequence, Content::ApiResult { body }),
            Err(error) => Packet::error(Command::ApiCall, sequence, error),
        };
        self.send_reply(packet);

        {
            let mut core = self.core.lock();
            core.received_in_flight = core.received_in_flight.saturating_sub(1);
        }
        self.check_drain();
    }

    fn reply_error(&self, command: Command, sequence: u64, kind: ErrorKind) {
        self.send_reply(Packet::error(command, sequence, kind.into()));
    }

    /// Writes a reply. A reply that cannot be encoded is replaced by
    /// `server_internal_error` so the peer is always answered.
    fn send_reply(&self, packet: Packet) {
        let (command, sequence) = (packet.command, packet.sequence);
        let frame = match Encoder::encode(&packet) {
            Ok(frame) => frame,
            Err(e) => {
                self.warn(format!(
                    "cannot encode answer to {} #{}: {}",
                    command.name(),
                    sequence,
                    e
                ));
                let fallback =
                    Packet::error(command, sequence, ErrorKind::ServerInternalError.into());
                match Encoder::encode(&fallback) {
                    Ok(frame) => frame,
                    Err(_) => return,
                }
            }
        };
        if let Err(e) = self.transport.write(frame) {
            self.warn(format!(
                "failed to answer {} #{}: {}",
                command.name(),
                sequence,
                e
            ));
        }
    }

    // ---------------------------------------------------------------------
    // Shutdown
    // ---------------------------------------------------------------------

    fn begin_end(&self) {
        let core = self.core.lock();
        self.begin_end_locked(core);
    }

    fn begin_end_locked(&self, mut core: MutexGuard<'_, ChannelCore>) {
        if core.state != ChannelState::Active {
            return;
        }
        if core.is_idle() {
            self.finalize(core);
        } else {
            tracing::debug!(
                "channel {}: ending, {} pending, {} received in flight",
                self.id,
                core.sent.len(),
                core.received_in_flight
            );
            core.state = ChannelState::Ending;
        }
    }

    fn check_drain(&self) {
        let core = self.core.lock();
        if core.state == ChannelState::Ending && core.is_idle() {
            self.finalize(core);
        }
    }

    fn finalize(&self, mut core: MutexGuard<'_, ChannelCore>) {
        core.state = ChannelState::Ended;
        let replies = std::mem::take(&mut core.close_replies);
        drop(core);

        for sequence in replies {
            self.send_reply(Packet::success(Command::Close, sequence, Content::Empty));
        }
        tracing::debug!("channel {}: drained, half-closing transport", self.id);
        self.transport.end();
    }

    fn on_remote_end(&self) {
        self.core.lock().remote_ended = true;
        self.emit(ChannelEvent::End);
        self.begin_end();
    }

    fn on_finish(&self) {
        self.core.lock().finished = true;
        self.emit(ChannelEvent::Finish);
    }

    fn on_close(&self) {
        let pending: Vec<PendingRequest> = {
            let mut core = self.core.lock();
            if core.closed {
                return;
            }
            core.closed = true;
            core.state = ChannelState::Ended;
            core.close_replies.clear();
            core.sent.drain().map(|(_, pending)| pending).collect()
        };

        if !pending.is_empty() {
            tracing::debug!(
                "channel {}: failing {} pending requests on close",
                self.id,
                pending.len()
            );
        }
        for request in pending {
            request.resolve(Err(ErrorKind::ChannelClosed.into()));
        }

        if self.owns_streams {
            self.streams.close();
        }

        tracing::debug!("channel {} closed", self.id);
        self.emit(ChannelEvent::Close);
        self.closed.send_replace(true);
    }
}

async fn run(inner: Arc<ChannelInner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Frame(frame) => inner.on_frame(frame),
            TransportEvent::End => inner.on_remote_end(),
            TransportEvent::Finish => inner.on_finish(),
            TransportEvent::Close => break,
            TransportEvent::Error(message) => {
                tracing::warn!("channel {}: transport error: {}", inner.id, message);
                inner.emit(ChannelEvent::Error(ErrorKind::NetworkError.into()));
            }
        }
    }
    inner.on_close();
}

/// Configures and spawns a [`Channel`].
#[derive(Default)]
pub struct ChannelBuilder {
    config: ChannelConfig,
    policy: StreamPolicy,
    api_handler: Option<Arc<dyn ApiHandler>>,
    push_handler: Option<Arc<dyn PushHandler>>,
}

impl ChannelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder using the channel settings and a private stream manager from
    /// `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .with_config(config.channel.clone())
            .with_stream_policy(StreamPolicy::PerChannel(config.streams.clone()))
    }

    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_api_handler(mut self, handler: impl ApiHandler) -> Self {
        self.api_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_push_handler(mut self, handler: impl PushHandler) -> Self {
        self.push_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_stream_policy(mut self, policy: StreamPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Starts the channel's event loop over `transport`.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn<T: Transporter>(
        self,
        transport: Arc<T>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Channel {
        let (streams, owns_streams) = match self.policy {
            StreamPolicy::PerChannel(config) => (StreamManager::new(&config), true),
            StreamPolicy::Shared(manager) => (manager, false),
            StreamPolicy::Disabled => (StreamManager::disabled(), true),
        };
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (closed, _) = watch::channel(false);

        let inner = Arc::new(ChannelInner {
            id: uuid::Uuid::new_v4().to_string(),
            transport,
            timeout: self.config.timeout(),
            core: Mutex::new(ChannelCore::new()),
            streams,
            owns_streams,
            api_handler: self.api_handler,
            push_handler: self.push_handler,
            events: events_tx,
            closed,
        });

        tracing::debug!("channel {} started", inner.id);
        tokio::spawn(run(inner.clone(), events));
        Channel { inner }
    }
}

/// Handle to a running channel. Cheap to clone.
///
/// The channel lives until its transport closes.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    pub fn builder() -> ChannelBuilder {
        ChannelBuilder::new()
    }

    /// Unique id of this channel (UUID v4).
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    /// Whether new requests can be sent.
    pub fn writable(&self) -> bool {
        self.inner.writable()
    }

    /// Whether the peer has half-closed.
    pub fn ended(&self) -> bool {
        self.inner.core.lock().remote_ended
    }

    /// Whether our half-close has completed.
    pub fn finished(&self) -> bool {
        self.inner.core.lock().finished
    }

    /// Whether the transport is fully closed.
    pub fn is_closed(&self) -> bool {
        self.inner.core.lock().closed
    }

    /// Number of outbound requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.core.lock().sent.len()
    }

    /// Number of inbound API calls not yet answered.
    pub fn received_in_flight(&self) -> usize {
        self.inner.core.lock().received_in_flight
    }

    /// The stream manager receiving this channel's inbound chunks.
    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.inner.streams
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Waits until the transport is fully closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Invokes the remote procedure `name`.
    pub async fn api_call(
        &self,
        name: impl Into<String>,
        body: impl Into<Payload>,
    ) -> Result<Payload, RpcError> {
        let content = Content::ApiCall {
            name: name.into(),
            body: body.into(),
        };
        match self.inner.request(Command::ApiCall, content).await? {
            Content::ApiResult { body } => Ok(body),
            _ => Err(ErrorKind::InvalidResponse.into()),
        }
    }

    /// Pings the peer and returns the echoed payload.
    pub async fn ping(&self, message: Option<Payload>) -> Result<Payload, RpcError> {
        let content = Content::Ping(message.unwrap_or_default());
        match self.inner.request(Command::Ping, content).await? {
            Content::Ping(echo) => Ok(echo),
            _ => Err(ErrorKind::InvalidResponse.into()),
        }
    }

    /// Pushes a message; resolves once the peer acknowledges it.
    pub async fn send_message(&self, body: impl Into<Payload>) -> Result<(), RpcError> {
        self.inner
            .request(Command::PushMessage, Content::PushMessage(body.into()))
            .await
            .map(|_| ())
    }

    /// Sends one chunk of the peer's stream `stream_id`.
    ///
    /// `index: None` aborts the stream; `chunk: None` (or an empty chunk)
    /// closes it.
    pub async fn send_binary_chunk(
        &self,
        stream_id: u32,
        index: Option<u32>,
        chunk: Option<Payload>,
    ) -> Result<(), RpcError> {
        let content = Content::BinaryChunk {
            stream_id,
            index: index.unwrap_or(ABORT_INDEX),
            chunk: chunk.unwrap_or_default(),
        };
        self.inner
            .request(Command::BinaryChunk, content)
            .await
            .map(|_| ())
    }

    /// Sender that numbers chunks for the peer's stream `stream_id`.
    pub fn stream_sender(&self, stream_id: u32) -> StreamSender {
        StreamSender::new(self.clone(), stream_id)
    }

    /// Closes the channel gracefully.
    ///
    /// Sends CLOSE, drains in-flight work on both sides, then half-closes.
    /// A peer that is already shutting down counts as success.
    pub async fn close(&self) -> Result<(), RpcError> {
        let rx = self.inner.start_request(Command::Close, Content::Empty)?;
        self.inner.begin_end();

        match rx.await {
            Ok(Ok(_)) | Err(_) => Ok(()),
            Ok(Err(e)) if e.is(ErrorKind::ChannelInactive) || e.is(ErrorKind::ChannelClosed) => {
                Ok(())
            }
            Ok(Err(e)) => Err(e),
        }
    }

    /// Drains in-flight work and half-closes without a CLOSE handshake.
    pub fn end(&self) {
        self.inner.begin_end();
    }

    /// Hard-closes the transport.
    pub fn destroy(&self) {
        self.inner.core.lock().state = ChannelState::Ended;
        self.inner.transport.destroy();
    }
}
