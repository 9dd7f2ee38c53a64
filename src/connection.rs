//! Relay connection engine.
//!
//! One spawned task owns the transport, the codec, the session handle, the
//! dedup cache and every pending sync request. [`RelayClient`] handles talk
//! to it over a command channel, so no connection state is ever shared or
//! locked. The task:
//! - drives `DISCONNECTED -> CONNECTING -> HANDSHAKING -> READY`
//! - coalesces all frames queued during one loop turn into a single write
//! - ACKs and deduplicates deliveries before fanning them out to subscribers
//! - reconnects with jittered exponential backoff until attempts run out
//! - resolves each `send_and_wait` exactly once (ACK, timeout or disconnect)

use crate::codec::FrameCodec;
use crate::config::ConnectionConfig;
use crate::dedup::DedupCache;
use crate::protocol::{
    AckPayload, BusyPayload, ByePayload, Capabilities, ChannelJoinPayload, ChannelLeavePayload,
    ChannelMessagePayload, Envelope, ErrorPayload, FrameType, HelloPayload, InboundChannelMessage,
    InboundMessage, LogPayload, PayloadMeta, ReleasePayload, ResumeSession, SendPayload,
    ShadowBindPayload, ShadowUnbindPayload, SpawnPayload, SyncMeta, WelcomePayload,
    BROADCAST_TARGET, RESUME_TOO_OLD,
};
use crate::transport::{BoxedStream, Connector};
use bytes::{Bytes, BytesMut};
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Lower bound of the per-attempt reconnect jitter factor
pub const JITTER_MIN: f64 = 0.85;
/// Upper bound of the per-attempt reconnect jitter factor
pub const JITTER_MAX: f64 = 1.15;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 256;
const READ_BUFFER_BYTES: usize = 16 * 1024;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Backoff,
}

/// Session assigned by the relay on WELCOME
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: Option<String>,
    pub resume_token: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("relay connection not ready (state: {0:?})")]
    NotReady(ConnectionState),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("relay error ({code}): {message}")]
    Protocol {
        code: String,
        message: String,
        retryable: bool,
    },
    #[error("request {correlation_id} timed out after {timeout_ms}ms")]
    Timeout {
        correlation_id: String,
        timeout_ms: u64,
    },
    #[error("disconnected while the request was pending")]
    Disconnected,
    #[error("connection destroyed")]
    Destroyed,
}

impl ConnectionError {
    /// Whether resending the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotReady(_) | Self::Transport(_) | Self::Timeout { .. } | Self::Disconnected => {
                true
            }
            Self::Protocol { retryable, .. } => *retryable,
            Self::Encode(_) | Self::Destroyed => false,
        }
    }
}

impl From<ErrorPayload> for ConnectionError {
    fn from(err: ErrorPayload) -> Self {
        Self::Protocol {
            code: err.code,
            message: err.message,
            retryable: err.retryable,
        }
    }
}

/// Events fanned out to every subscriber
#[derive(Debug, Clone)]
pub enum ClientEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Connected {
        session_id: String,
        resumed: bool,
    },
    Message(InboundMessage),
    ChannelMessage(InboundChannelMessage),
    /// ERROR frame from the relay
    Error(ErrorPayload),
    /// Relay asked us to slow down; this layer does not retry
    Busy(BusyPayload),
    Disconnected {
        reason: String,
    },
    /// Reconnection gave up; reported once per exhaustion
    ReconnectExhausted {
        attempts: u32,
    },
}

/// Options for a direct or broadcast send
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub kind: Option<String>,
    pub thread: Option<String>,
    pub data: Option<Value>,
    pub importance: Option<u8>,
}

/// Options for a channel message
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    pub thread: Option<String>,
    pub mentions: Vec<String>,
    pub data: Option<Value>,
}

/// Options for a blocking send
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Falls back to the configured request timeout
    pub timeout: Option<Duration>,
    pub thread: Option<String>,
    pub data: Option<Value>,
    pub importance: Option<u8>,
}

/// Result of a successful `send_and_wait`
#[derive(Debug, Clone, PartialEq)]
pub struct SyncAck {
    pub correlation_id: String,
    pub response: Option<bool>,
    pub response_data: Option<Value>,
}

enum Command {
    Connect,
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
    Send {
        envelope: Envelope,
        reply: oneshot::Sender<Result<String, ConnectionError>>,
    },
    SendAndWait {
        envelope: Envelope,
        correlation_id: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<SyncAck, ConnectionError>>,
    },
}

/// Cloneable handle to a connection engine
#[derive(Clone)]
pub struct RelayClient {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ClientEvent>,
    state: watch::Receiver<ConnectionState>,
    session: watch::Receiver<SessionHandle>,
    request_timeout: Duration,
}

impl RelayClient {
    /// Create an engine for `config.address`. Must be called inside a tokio runtime.
    pub fn new(config: ConnectionConfig) -> Self {
        let connector = Arc::new(config.address.clone());
        Self::with_connector(config, connector)
    }

    /// Create an engine over a custom transport connector.
    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (session_tx, session_rx) = watch::channel(SessionHandle::default());
        let request_timeout = config.request_timeout;

        let engine = Engine {
            codec: FrameCodec::with_max_frame(config.framing, config.max_frame_bytes),
            dedup: DedupCache::new(config.dedup_capacity),
            config,
            connector,
            commands: command_rx,
            events: event_tx.clone(),
            state_tx,
            session_tx,
            state: ConnectionState::Disconnected,
            session: SessionHandle::default(),
            pending: HashMap::new(),
            outbound: Vec::new(),
            attempts: 0,
            backoff_until: None,
            heartbeat: None,
            exhausted_reported: false,
            destroyed: false,
            link_end: None,
            disconnect_reply: None,
            destroy_reply: None,
        };
        tokio::spawn(engine.run());

        Self {
            commands: command_tx,
            events: event_tx,
            state: state_rx,
            session: session_rx,
            request_timeout,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn session(&self) -> SessionHandle {
        self.session.borrow().clone()
    }

    /// Register a new event subscriber. Dropping the receiver unregisters it.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Start connecting (or skip a pending backoff wait).
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.commands
            .send(Command::Connect)
            .await
            .map_err(|_| ConnectionError::Destroyed)
    }

    /// Wait until the engine reaches READY.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let mut state = self.state.clone();
        let result =
            match tokio::time::timeout(timeout, state.wait_for(|s| *s == ConnectionState::Ready))
                .await
            {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(_)) => Err(ConnectionError::Destroyed),
                Err(_) => Err(ConnectionError::NotReady(self.state())),
            };
        result
    }

    /// Send BYE and close without reconnecting. `connect` may be called again.
    pub async fn disconnect(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(Command::Disconnect { reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Tear down permanently. Idempotent.
    pub async fn destroy(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Destroy { reply }).await.is_ok() {
            let _ = done.await;
        }
    }

    pub async fn send_message(
        &self,
        to: &str,
        body: &str,
        options: SendOptions,
    ) -> Result<String, ConnectionError> {
        let payload = SendPayload {
            kind: options.kind.unwrap_or_else(|| "message".to_string()),
            body: body.to_string(),
            data: options.data,
            thread: options.thread,
        };
        let mut envelope = Envelope::new(FrameType::Send, payload).with_to(to);
        if options.importance.is_some() {
            envelope = envelope.with_meta(PayloadMeta {
                importance: options.importance,
                ..Default::default()
            });
        }
        self.send(envelope).await
    }

    pub async fn broadcast(
        &self,
        body: &str,
        options: SendOptions,
    ) -> Result<String, ConnectionError> {
        self.send_message(BROADCAST_TARGET, body, options).await
    }

    pub async fn join_channel(&self, channel: &str) -> Result<String, ConnectionError> {
        let payload = ChannelJoinPayload {
            channel: channel.to_string(),
            display_name: None,
        };
        self.send(Envelope::new(FrameType::ChannelJoin, payload))
            .await
    }

    pub async fn leave_channel(
        &self,
        channel: &str,
        reason: Option<String>,
    ) -> Result<String, ConnectionError> {
        let payload = ChannelLeavePayload {
            channel: channel.to_string(),
            reason,
        };
        self.send(Envelope::new(FrameType::ChannelLeave, payload))
            .await
    }

    pub async fn send_channel_message(
        &self,
        channel: &str,
        body: &str,
        options: ChannelOptions,
    ) -> Result<String, ConnectionError> {
        let payload = ChannelMessagePayload {
            channel: channel.to_string(),
            body: body.to_string(),
            thread: options.thread,
            mentions: options.mentions,
            data: options.data,
        };
        self.send(Envelope::new(FrameType::ChannelMessage, payload).with_to(channel))
            .await
    }

    pub async fn subscribe_topic(&self, topic: &str) -> Result<String, ConnectionError> {
        self.send(Envelope::new(FrameType::Subscribe, Value::Object(Default::default())).with_topic(topic))
            .await
    }

    pub async fn unsubscribe_topic(&self, topic: &str) -> Result<String, ConnectionError> {
        self.send(
            Envelope::new(FrameType::Unsubscribe, Value::Object(Default::default()))
                .with_topic(topic),
        )
        .await
    }

    pub async fn bind_as_shadow(
        &self,
        primary_agent: &str,
        speak_on: Vec<String>,
    ) -> Result<String, ConnectionError> {
        let payload = ShadowBindPayload {
            primary_agent: primary_agent.to_string(),
            speak_on,
            receive_incoming: true,
            receive_outgoing: true,
        };
        self.send(Envelope::new(FrameType::ShadowBind, payload))
            .await
    }

    pub async fn unbind_as_shadow(&self, primary_agent: &str) -> Result<String, ConnectionError> {
        let payload = ShadowUnbindPayload {
            primary_agent: primary_agent.to_string(),
        };
        self.send(Envelope::new(FrameType::ShadowUnbind, payload))
            .await
    }

    pub async fn send_log(&self, data: &str) -> Result<String, ConnectionError> {
        let payload = LogPayload {
            data: data.to_string(),
        };
        self.send(Envelope::new(FrameType::Log, payload)).await
    }

    pub async fn spawn(&self, request: SpawnPayload) -> Result<String, ConnectionError> {
        self.send(Envelope::new(FrameType::Spawn, request)).await
    }

    pub async fn release(&self, name: &str) -> Result<String, ConnectionError> {
        let payload = ReleasePayload {
            name: name.to_string(),
        };
        self.send(Envelope::new(FrameType::Release, payload)).await
    }

    /// Tell the relay our injection queue cannot absorb more right now.
    pub async fn send_busy(
        &self,
        retry_after_ms: u64,
        queue_depth: usize,
    ) -> Result<String, ConnectionError> {
        let payload = BusyPayload {
            retry_after_ms,
            queue_depth,
        };
        self.send(Envelope::new(FrameType::Busy, payload)).await
    }

    /// Answer a blocking request another agent is waiting on.
    pub async fn ack_sync(
        &self,
        correlation_id: &str,
        response: bool,
        response_data: Option<Value>,
    ) -> Result<String, ConnectionError> {
        let payload = AckPayload {
            ack_id: correlation_id.to_string(),
            seq: None,
            correlation_id: Some(correlation_id.to_string()),
            response: Some(response),
            response_data,
        };
        self.send(Envelope::new(FrameType::Ack, payload)).await
    }

    /// Send a message and wait for the matching ACK.
    pub async fn send_and_wait(
        &self,
        to: &str,
        body: &str,
        options: SyncOptions,
    ) -> Result<SyncAck, ConnectionError> {
        let timeout = options.timeout.unwrap_or(self.request_timeout);
        let correlation_id = crate::protocol::next_id();
        let payload = SendPayload {
            kind: "message".to_string(),
            body: body.to_string(),
            data: options.data,
            thread: options.thread,
        };
        let envelope = Envelope::new(FrameType::Send, payload)
            .with_to(to)
            .with_meta(PayloadMeta {
                importance: options.importance,
                sync: Some(SyncMeta {
                    correlation_id: correlation_id.clone(),
                    timeout_ms: Some(timeout.as_millis() as u64),
                    blocking: true,
                }),
                ..Default::default()
            });

        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::SendAndWait {
                envelope,
                correlation_id,
                timeout,
                reply,
            })
            .await
            .map_err(|_| ConnectionError::Destroyed)?;
        result.await.map_err(|_| ConnectionError::Destroyed)?
    }

    async fn send(&self, envelope: Envelope) -> Result<String, ConnectionError> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Send { envelope, reply })
            .await
            .map_err(|_| ConnectionError::Destroyed)?;
        result.await.map_err(|_| ConnectionError::Destroyed)?
    }
}

/// Delay before reconnect attempt number `attempts` (0-based).
///
/// `min(base * 2^attempts * jitter, max)`.
pub fn reconnect_delay(attempts: u32, base: Duration, max: Duration, jitter: f64) -> Duration {
    let factor = 2f64.powi(attempts.min(32) as i32);
    let ms = base.as_millis() as f64 * factor * jitter;
    let capped = ms.min(max.as_millis() as f64).max(0.0);
    Duration::from_millis(capped as u64)
}

/// Draw a jitter factor in `[JITTER_MIN, JITTER_MAX]`.
pub fn draw_jitter() -> f64 {
    rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX)
}

struct PendingSync {
    deadline: Instant,
    timeout: Duration,
    reply: oneshot::Sender<Result<SyncAck, ConnectionError>>,
}

struct Outbound {
    id: String,
    frame: Bytes,
    reply: Option<oneshot::Sender<Result<String, ConnectionError>>>,
    correlation_id: Option<String>,
}

/// Why a transport connection ended
enum LinkEnd {
    Lost(String),
    Closed,
    Destroyed,
    /// Every handle was dropped
    Abandoned,
}

enum Flow {
    Continue,
    Stop,
}

struct Engine {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<ClientEvent>,
    state_tx: watch::Sender<ConnectionState>,
    session_tx: watch::Sender<SessionHandle>,
    state: ConnectionState,
    session: SessionHandle,
    codec: FrameCodec,
    dedup: DedupCache,
    pending: HashMap<String, PendingSync>,
    outbound: Vec<Outbound>,
    attempts: u32,
    backoff_until: Option<Instant>,
    heartbeat: Option<Duration>,
    exhausted_reported: bool,
    destroyed: bool,
    link_end: Option<LinkEnd>,
    disconnect_reply: Option<oneshot::Sender<()>>,
    destroy_reply: Option<oneshot::Sender<()>>,
}

impl Engine {
    async fn run(mut self) {
        loop {
            match self.state {
                ConnectionState::Disconnected => match self.commands.recv().await {
                    Some(cmd) => {
                        if let Flow::Stop = self.handle_offline_command(cmd) {
                            return;
                        }
                    }
                    None => return self.abandon(),
                },
                ConnectionState::Backoff => {
                    let until = self.backoff_until.unwrap_or_else(Instant::now);
                    tokio::select! {
                        _ = sleep_until(until) => {
                            self.backoff_until = None;
                            self.transition(ConnectionState::Connecting);
                        }
                        cmd = self.commands.recv() => match cmd {
                            Some(cmd) => {
                                if let Flow::Stop = self.handle_offline_command(cmd) {
                                    return;
                                }
                            }
                            None => return self.abandon(),
                        }
                    }
                }
                ConnectionState::Connecting => {
                    let connector = Arc::clone(&self.connector);
                    let connect = connector.connect();
                    tokio::pin!(connect);

                    let result = loop {
                        tokio::select! {
                            result = &mut connect => break Some(result),
                            cmd = self.commands.recv() => match cmd {
                                Some(cmd) => {
                                    if let Flow::Stop = self.handle_offline_command(cmd) {
                                        return;
                                    }
                                    if self.state != ConnectionState::Connecting {
                                        break None;
                                    }
                                }
                                None => return self.abandon(),
                            }
                        }
                    };

                    match result {
                        None => {}
                        Some(Ok(stream)) => {
                            info!(address = %self.config.address, "transport connected");
                            self.transition(ConnectionState::Handshaking);
                            let end = self.run_link(stream).await;
                            if let Flow::Stop = self.finish_link(end) {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            self.on_link_lost(format!("connect failed: {}", e));
                        }
                    }
                }
                ConnectionState::Handshaking | ConnectionState::Ready => {
                    // Only reachable inside run_link
                    self.transition(ConnectionState::Disconnected);
                }
            }
        }
    }

    /// Commands received while no transport is up
    fn handle_offline_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Connect => match self.state {
                ConnectionState::Disconnected => {
                    self.attempts = 0;
                    self.exhausted_reported = false;
                    self.transition(ConnectionState::Connecting);
                }
                ConnectionState::Backoff => {
                    self.backoff_until = None;
                    self.transition(ConnectionState::Connecting);
                }
                _ => {}
            },
            Command::Disconnect { reply } => {
                self.backoff_until = None;
                self.transition(ConnectionState::Disconnected);
                let _ = reply.send(());
            }
            Command::Destroy { reply } => {
                self.destroy();
                let _ = reply.send(());
                return Flow::Stop;
            }
            Command::Send { reply, .. } => {
                let _ = reply.send(Err(ConnectionError::NotReady(self.state)));
            }
            Command::SendAndWait { reply, .. } => {
                let _ = reply.send(Err(ConnectionError::NotReady(self.state)));
            }
        }
        Flow::Continue
    }

    async fn run_link(&mut self, stream: BoxedStream) -> LinkEnd {
        let (mut reader, mut writer) = tokio::io::split(stream);
        self.codec.reset();
        self.codec.set_mode(self.config.framing);
        self.codec.set_max_frame_bytes(self.config.max_frame_bytes);
        self.heartbeat = None;
        self.link_end = None;

        let hello = self.hello_envelope();
        debug!(resume = hello.payload.get("session").is_some(), "sending HELLO");
        self.enqueue_internal(hello);

        let handshake_deadline = Instant::now() + self.config.handshake_timeout;
        let mut last_rx = Instant::now();
        let mut buf = vec![0u8; READ_BUFFER_BYTES];

        loop {
            if matches!(self.link_end, Some(LinkEnd::Destroyed)) {
                return LinkEnd::Destroyed;
            }
            if let Err(e) = self.flush(&mut writer).await {
                return LinkEnd::Lost(format!("write failed: {}", e));
            }
            if let Some(end) = self.link_end.take() {
                if matches!(end, LinkEnd::Closed) {
                    let _ = writer.shutdown().await;
                }
                return end;
            }

            let sync_deadline = self.next_sync_deadline();
            let watchdog = self.watchdog_deadline(handshake_deadline, last_rx);
            let frame_deadline = (self.codec.buffered() > 0)
                .then(|| last_rx + self.config.frame_read_timeout);

            tokio::select! {
                read = read_some(&mut reader, &mut buf) => match read {
                    Ok(0) => {
                        if let Err(e) = self.codec.finish() {
                            debug!(error = %e, "partial frame at EOF");
                        }
                        return LinkEnd::Lost("connection closed by relay".to_string());
                    }
                    Ok(n) => {
                        last_rx = Instant::now();
                        match self.codec.push(&buf[..n]) {
                            Ok(envelopes) => {
                                for envelope in envelopes {
                                    self.dispatch(envelope);
                                }
                            }
                            Err(e) => return LinkEnd::Lost(format!("decode error: {}", e)),
                        }
                    }
                    Err(e) => return LinkEnd::Lost(format!("read failed: {}", e)),
                },
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        self.handle_link_command(cmd);
                        // Coalesce everything already queued into this turn's write
                        while self.link_end.is_none() {
                            match self.commands.try_recv() {
                                Ok(cmd) => self.handle_link_command(cmd),
                                Err(_) => break,
                            }
                        }
                    }
                    None => return LinkEnd::Abandoned,
                },
                _ = sleep_until_opt(sync_deadline) => {
                    self.expire_sync(Instant::now());
                }
                _ = sleep_until_opt(watchdog) => {
                    let reason = if self.state == ConnectionState::Handshaking {
                        "handshake timed out"
                    } else {
                        "heartbeat timed out"
                    };
                    return LinkEnd::Lost(reason.to_string());
                }
                _ = sleep_until_opt(frame_deadline) => {
                    let reason = match self.codec.finish() {
                        Err(e) => format!("decode error: {}", e),
                        Ok(()) => "decode error: read timeout".to_string(),
                    };
                    return LinkEnd::Lost(reason);
                }
            }
        }
    }

    /// Commands received while a transport is up
    fn handle_link_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => {}
            Command::Disconnect { reply } => {
                let bye = Envelope::new(
                    FrameType::Bye,
                    ByePayload {
                        reason: Some("client disconnect".to_string()),
                    },
                );
                self.enqueue_internal(bye);
                self.disconnect_reply = Some(reply);
                self.link_end = Some(LinkEnd::Closed);
            }
            Command::Destroy { reply } => {
                self.destroy_reply = Some(reply);
                self.link_end = Some(LinkEnd::Destroyed);
            }
            Command::Send { envelope, reply } => {
                if self.state != ConnectionState::Ready {
                    let _ = reply.send(Err(ConnectionError::NotReady(self.state)));
                    return;
                }
                match self.codec.encode(&envelope) {
                    Ok(frame) => self.outbound.push(Outbound {
                        id: envelope.id,
                        frame,
                        reply: Some(reply),
                        correlation_id: None,
                    }),
                    Err(e) => {
                        let _ = reply.send(Err(ConnectionError::Encode(e.to_string())));
                    }
                }
            }
            Command::SendAndWait {
                envelope,
                correlation_id,
                timeout,
                reply,
            } => {
                if self.state != ConnectionState::Ready {
                    let _ = reply.send(Err(ConnectionError::NotReady(self.state)));
                    return;
                }
                match self.codec.encode(&envelope) {
                    Ok(frame) => {
                        debug!(correlation_id = %correlation_id, timeout_ms = timeout.as_millis() as u64, "registered sync request");
                        self.pending.insert(
                            correlation_id.clone(),
                            PendingSync {
                                deadline: Instant::now() + timeout,
                                timeout,
                                reply,
                            },
                        );
                        self.outbound.push(Outbound {
                            id: envelope.id,
                            frame,
                            reply: None,
                            correlation_id: Some(correlation_id),
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(ConnectionError::Encode(e.to_string())));
                    }
                }
            }
        }
    }

    /// Write every queued frame in one transport write.
    async fn flush<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> std::io::Result<()> {
        if self.outbound.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.outbound);
        let total: usize = batch.iter().map(|o| o.frame.len()).sum();
        let mut bytes = BytesMut::with_capacity(total);
        for outbound in &batch {
            bytes.extend_from_slice(&outbound.frame);
        }

        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;

        match &result {
            Ok(()) => {
                debug!(frames = batch.len(), bytes = total, "flushed frames");
                for outbound in batch {
                    if let Some(reply) = outbound.reply {
                        let _ = reply.send(Ok(outbound.id));
                    }
                }
            }
            Err(e) => {
                let err = ConnectionError::Transport(e.to_string());
                for outbound in batch {
                    if let Some(reply) = outbound.reply {
                        let _ = reply.send(Err(err.clone()));
                    }
                    if let Some(id) = outbound.correlation_id {
                        if let Some(pending) = self.pending.remove(&id) {
                            let _ = pending.reply.send(Err(err.clone()));
                        }
                    }
                }
            }
        }
        result
    }

    fn enqueue_internal(&mut self, envelope: Envelope) {
        match self.codec.encode(&envelope) {
            Ok(frame) => self.outbound.push(Outbound {
                id: envelope.id,
                frame,
                reply: None,
                correlation_id: None,
            }),
            Err(e) => error!(frame = ?envelope.kind, error = %e, "failed to encode internal frame"),
        }
    }

    fn dispatch(&mut self, envelope: Envelope) {
        debug!(frame = ?envelope.kind, id = %envelope.id, "received frame");
        match envelope.kind {
            FrameType::Welcome => self.on_welcome(envelope),
            FrameType::Deliver => self.on_deliver(envelope),
            FrameType::ChannelMessage => self.on_channel_message(envelope),
            FrameType::Ping => {
                let pong = Envelope::new(FrameType::Pong, envelope.payload);
                self.enqueue_internal(pong);
            }
            FrameType::Ack => self.on_ack(envelope),
            FrameType::Error => self.on_error(envelope),
            FrameType::Busy => {
                let busy = envelope.payload_as::<BusyPayload>().unwrap_or(BusyPayload {
                    retry_after_ms: 0,
                    queue_depth: 0,
                });
                warn!(retry_after_ms = busy.retry_after_ms, queue_depth = busy.queue_depth, "relay is busy");
                self.emit(ClientEvent::Busy(busy));
            }
            FrameType::Bye => {
                self.link_end = Some(LinkEnd::Lost("relay sent BYE".to_string()));
            }
            other => debug!(frame = ?other, "ignoring frame"),
        }
    }

    fn on_welcome(&mut self, envelope: Envelope) {
        if self.state != ConnectionState::Handshaking {
            warn!(state = ?self.state, "unexpected WELCOME");
            return;
        }
        let welcome = match envelope.payload_as::<WelcomePayload>() {
            Ok(welcome) => welcome,
            Err(e) => {
                self.link_end = Some(LinkEnd::Lost(format!("invalid WELCOME: {}", e)));
                return;
            }
        };

        let resumed = self.session.session_id.as_deref() == Some(welcome.session_id.as_str());
        self.session = SessionHandle {
            session_id: Some(welcome.session_id.clone()),
            resume_token: welcome.resume_token,
        };
        self.session_tx.send_replace(self.session.clone());

        self.codec.set_max_frame_bytes(welcome.server.max_frame_bytes);
        if let Some(mode) = welcome.server.framing {
            if mode != self.codec.mode() {
                info!(?mode, "relay selected framing mode");
                self.codec.set_mode(mode);
            }
        }
        self.heartbeat =
            (welcome.server.heartbeat_ms > 0).then(|| Duration::from_millis(welcome.server.heartbeat_ms));
        self.attempts = 0;
        self.exhausted_reported = false;

        info!(session_id = %welcome.session_id, resumed, "relay session ready");
        self.transition(ConnectionState::Ready);
        self.emit(ClientEvent::Connected {
            session_id: welcome.session_id,
            resumed,
        });
    }

    fn on_deliver(&mut self, envelope: Envelope) {
        let ack = AckPayload {
            ack_id: envelope.id.clone(),
            seq: envelope.delivery.as_ref().map(|d| d.seq),
            ..Default::default()
        };
        self.enqueue_internal(Envelope::new(FrameType::Ack, ack));

        if self.dedup.check(&envelope.id) {
            debug!(id = %envelope.id, "dropping duplicate delivery");
            return;
        }

        let payload = match envelope.payload_as::<SendPayload>() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(id = %envelope.id, error = %e, "undecodable DELIVER payload");
                return;
            }
        };
        let meta = envelope.payload_meta.unwrap_or_default();
        let message = InboundMessage {
            id: envelope.id,
            from: envelope.from.unwrap_or_default(),
            body: payload.body,
            kind: payload.kind,
            thread: payload.thread,
            data: payload.data,
            topic: envelope.topic,
            importance: meta.importance,
            sync: meta.sync,
            original_to: envelope.delivery.and_then(|d| d.original_to),
        };
        self.emit(ClientEvent::Message(message));
    }

    fn on_channel_message(&mut self, envelope: Envelope) {
        if self.dedup.check(&envelope.id) {
            debug!(id = %envelope.id, "dropping duplicate channel message");
            return;
        }
        let payload = match envelope.payload_as::<ChannelMessagePayload>() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(id = %envelope.id, error = %e, "undecodable CHANNEL_MESSAGE payload");
                return;
            }
        };
        self.emit(ClientEvent::ChannelMessage(InboundChannelMessage {
            id: envelope.id,
            from: envelope.from.unwrap_or_default(),
            channel: payload.channel,
            body: payload.body,
            thread: payload.thread,
            mentions: payload.mentions,
            data: payload.data,
        }));
    }

    fn on_ack(&mut self, envelope: Envelope) {
        let ack = match envelope.payload_as::<AckPayload>() {
            Ok(ack) => ack,
            Err(e) => {
                debug!(error = %e, "undecodable ACK");
                return;
            }
        };
        let Some(correlation_id) = ack.correlation_id else {
            return;
        };
        match self.pending.remove(&correlation_id) {
            Some(pending) => {
                let _ = pending.reply.send(Ok(SyncAck {
                    correlation_id,
                    response: ack.response,
                    response_data: ack.response_data,
                }));
            }
            None => debug!(correlation_id = %correlation_id, "ACK for unknown or expired request"),
        }
    }

    fn on_error(&mut self, envelope: Envelope) {
        let err = envelope
            .payload_as::<ErrorPayload>()
            .unwrap_or_else(|_| ErrorPayload {
                code: "UNKNOWN".to_string(),
                message: envelope.payload.to_string(),
                fatal: false,
                retryable: false,
            });

        if err.code == RESUME_TOO_OLD {
            warn!("relay rejected resume token, next handshake starts a new session");
            self.session = SessionHandle::default();
            self.session_tx.send_replace(SessionHandle::default());
        } else {
            warn!(code = %err.code, fatal = err.fatal, "relay error: {}", err.message);
        }

        if err.fatal {
            self.link_end = Some(LinkEnd::Lost(format!("fatal relay error {}", err.code)));
        }
        self.emit(ClientEvent::Error(err));
    }

    fn hello_envelope(&self) -> Envelope {
        let cfg = &self.config;
        let payload = HelloPayload {
            agent: cfg.agent_name.clone(),
            entity_type: cfg.entity_type.clone(),
            cli: cfg.cli.clone(),
            program: cfg.cli.clone(),
            model: cfg.model.clone(),
            task: cfg.task.clone(),
            working_directory: cfg.working_directory.clone(),
            capabilities: Capabilities {
                ack: true,
                resume: true,
                max_inflight: cfg.max_inflight,
                supports_topics: true,
                framing: cfg.framing,
            },
            session: self
                .session
                .resume_token
                .clone()
                .map(|resume_token| ResumeSession { resume_token }),
        };
        Envelope::new(FrameType::Hello, payload)
    }

    fn next_sync_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    fn watchdog_deadline(&self, handshake_deadline: Instant, last_rx: Instant) -> Option<Instant> {
        match self.state {
            ConnectionState::Handshaking => Some(handshake_deadline),
            ConnectionState::Ready => self
                .heartbeat
                .map(|hb| last_rx + hb * self.config.heartbeat_miss_limit.max(1)),
            _ => None,
        }
    }

    fn expire_sync(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for correlation_id in expired {
            if let Some(pending) = self.pending.remove(&correlation_id) {
                let timeout_ms = pending.timeout.as_millis() as u64;
                warn!(correlation_id = %correlation_id, timeout_ms, "sync request timed out");
                let _ = pending.reply.send(Err(ConnectionError::Timeout {
                    correlation_id,
                    timeout_ms,
                }));
            }
        }
    }

    fn reject_pending(&mut self, err: ConnectionError) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(err.clone()));
        }
        for outbound in self.outbound.drain(..) {
            if let Some(reply) = outbound.reply {
                let _ = reply.send(Err(err.clone()));
            }
        }
    }

    fn finish_link(&mut self, end: LinkEnd) -> Flow {
        self.codec.reset();
        self.heartbeat = None;
        match end {
            LinkEnd::Lost(reason) => {
                self.on_link_lost(reason);
                Flow::Continue
            }
            LinkEnd::Closed => {
                info!("disconnected from relay");
                self.reject_pending(ConnectionError::Disconnected);
                self.transition(ConnectionState::Disconnected);
                if let Some(reply) = self.disconnect_reply.take() {
                    let _ = reply.send(());
                }
                Flow::Continue
            }
            LinkEnd::Destroyed => {
                self.destroy();
                if let Some(reply) = self.destroy_reply.take() {
                    let _ = reply.send(());
                }
                Flow::Stop
            }
            LinkEnd::Abandoned => {
                self.abandon();
                Flow::Stop
            }
        }
    }

    fn on_link_lost(&mut self, reason: String) {
        warn!(reason = %reason, "relay connection lost");
        self.codec.reset();
        self.reject_pending(ConnectionError::Disconnected);
        self.emit(ClientEvent::Disconnected {
            reason: reason.clone(),
        });

        if self.config.reconnect && self.attempts < self.config.max_reconnect_attempts {
            let delay = reconnect_delay(
                self.attempts,
                self.config.reconnect_base_delay,
                self.config.reconnect_max_delay,
                draw_jitter(),
            );
            self.attempts += 1;
            self.backoff_until = Some(Instant::now() + delay);
            info!(
                attempt = self.attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            self.transition(ConnectionState::Backoff);
        } else {
            self.transition(ConnectionState::Disconnected);
            if self.config.reconnect && !self.exhausted_reported {
                self.exhausted_reported = true;
                error!(
                    attempts = self.attempts,
                    "giving up on relay after {} reconnect attempts: {}", self.attempts, reason
                );
                self.emit(ClientEvent::ReconnectExhausted {
                    attempts: self.attempts,
                });
            }
        }
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        info!("destroying relay connection");
        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                Command::Connect => {}
                Command::Disconnect { reply } | Command::Destroy { reply } => {
                    let _ = reply.send(());
                }
                Command::Send { reply, .. } => {
                    let _ = reply.send(Err(ConnectionError::Destroyed));
                }
                Command::SendAndWait { reply, .. } => {
                    let _ = reply.send(Err(ConnectionError::Destroyed));
                }
            }
        }
        self.reject_pending(ConnectionError::Destroyed);
        self.backoff_until = None;
        self.heartbeat = None;
        self.transition(ConnectionState::Disconnected);
        self.destroyed = true;
    }

    fn abandon(&mut self) {
        debug!("all relay client handles dropped");
        self.destroy();
    }

    /// The only place the state may change
    fn transition(&mut self, next: ConnectionState) {
        if self.destroyed || self.state == next {
            return;
        }
        let from = self.state;
        self.state = next;
        debug!(?from, to = ?next, "connection state change");
        self.state_tx.send_replace(next);
        self.emit(ClientEvent::StateChanged { from, to: next });
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

async fn read_some<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    reader.read(buf).await
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(500);
    const MAX: Duration = Duration::from_secs(30);

    #[test]
    fn test_reconnect_delay_grows_within_jitter_bounds() {
        let mut previous_max = Duration::ZERO;
        for attempts in 0..12 {
            let low = reconnect_delay(attempts, BASE, MAX, JITTER_MIN);
            let high = reconnect_delay(attempts, BASE, MAX, JITTER_MAX);
            assert!(low <= high);
            // Doubling beats the widest jitter spread until the cap is hit
            assert!(low >= previous_max || low == MAX, "attempt {}", attempts);
            assert!(high <= MAX);
            previous_max = high;
        }
    }

    #[test]
    fn test_reconnect_delay_first_attempt() {
        assert_eq!(reconnect_delay(0, BASE, MAX, 1.0), Duration::from_millis(500));
        assert_eq!(reconnect_delay(3, BASE, MAX, 1.0), Duration::from_millis(4000));
        assert_eq!(reconnect_delay(40, BASE, MAX, 1.15), MAX);
    }

    #[test]
    fn test_draw_jitter_bounds() {
        for _ in 0..1000 {
            let j = draw_jitter();
            assert!((JITTER_MIN..=JITTER_MAX).contains(&j));
        }
    }

    #[test]
    fn test_error_retryability() {
        assert!(ConnectionError::Transport("reset".into()).is_retryable());
        assert!(ConnectionError::Disconnected.is_retryable());
        assert!(!ConnectionError::Destroyed.is_retryable());
        let protocol: ConnectionError = ErrorPayload {
            code: "RATE_LIMITED".into(),
            message: "slow down".into(),
            fatal: false,
            retryable: true,
        }
        .into();
        assert!(protocol.is_retryable());
    }

    #[tokio::test]
    async fn test_send_before_connect_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConnectionConfig {
            address: crate::transport::TransportAddr::Unix(dir.path().join("none.sock")),
            ..Default::default()
        };
        let client = RelayClient::new(config);
        let err = client
            .send_message("Bob", "hi", SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, ConnectionError::NotReady(ConnectionState::Disconnected));
        client.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_terminal() {
        let client = RelayClient::new(ConnectionConfig::default());
        client.destroy().await;
        client.destroy().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.connect().await, Err(ConnectionError::Destroyed));
        let err = client
            .send_message("Bob", "hi", SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, ConnectionError::Destroyed);
    }

    #[tokio::test]
    async fn test_exhausted_reconnect_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConnectionConfig {
            address: crate::transport::TransportAddr::Unix(dir.path().join("none.sock")),
            max_reconnect_attempts: 2,
            reconnect_base_delay: Duration::from_millis(5),
            reconnect_max_delay: Duration::from_millis(20),
            ..Default::default()
        };
        let client = RelayClient::new(config);
        let mut events = client.subscribe();
        client.connect().await.unwrap();

        let mut exhausted = 0;
        let mut backoffs = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
            match event {
                ClientEvent::ReconnectExhausted { attempts } => {
                    assert_eq!(attempts, 2);
                    exhausted += 1;
                    break;
                }
                ClientEvent::StateChanged {
                    to: ConnectionState::Backoff,
                    ..
                } => backoffs += 1,
                _ => {}
            }
        }
        assert_eq!(exhausted, 1);
        assert_eq!(backoffs, 2);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        client.destroy().await;
    }
}
