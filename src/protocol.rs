//! Protocol types for relay communication.
//!
//! Defines the envelope exchanged with the relay, the typed payloads carried
//! by each frame type, the internal injection queue entry, and parsed
//! output commands emitted by the wrapped agent.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Wire protocol version carried in every envelope
pub const PROTOCOL_VERSION: u32 = 1;

/// Target that denotes a broadcast to every connected agent
pub const BROADCAST_TARGET: &str = "*";

/// Error code the relay uses when a resume token is no longer valid
pub const RESUME_TOO_OLD: &str = "RESUME_TOO_OLD";

/// Importance used when a delivery carries none (lower = more urgent)
pub const DEFAULT_IMPORTANCE: u8 = 50;

/// Frame type of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    Hello,
    Welcome,
    Send,
    Deliver,
    Ack,
    ChannelJoin,
    ChannelLeave,
    ChannelMessage,
    Subscribe,
    Unsubscribe,
    ShadowBind,
    ShadowUnbind,
    Log,
    Ping,
    Pong,
    Error,
    Busy,
    Bye,
    Spawn,
    Release,
    /// Any frame type this build does not know about
    #[serde(other)]
    Unknown,
}

/// One protocol message unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version
    pub v: u32,
    /// Frame type
    #[serde(rename = "type")]
    pub kind: FrameType,
    /// Time-ordered unique identifier
    pub id: String,
    /// Unix timestamp in milliseconds
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_meta: Option<PayloadMeta>,
    /// Delivery bookkeeping, only present on DELIVER
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryInfo>,
}

impl Envelope {
    /// Build an envelope with a fresh id and timestamp.
    pub fn new(kind: FrameType, payload: impl Serialize) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            kind,
            id: next_id(),
            ts: current_timestamp_ms() as i64,
            to: None,
            from: None,
            topic: None,
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            payload_meta: None,
            delivery: None,
        }
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_meta(mut self, meta: PayloadMeta) -> Self {
        self.payload_meta = Some(meta);
        self
    }

    /// Decode the payload into a typed struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Optional metadata attached to a payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_ack: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    /// Lower is more urgent; 0 is the highest importance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncMeta>,
}

/// Blocking request metadata carried by a SEND and its DELIVER
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub blocking: bool,
}

/// Delivery bookkeeping attached by the relay to DELIVER frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    pub seq: u64,
    pub session_id: String,
    /// Target the sender originally addressed (`*` for broadcasts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_to: Option<String>,
}

/// Wire framing variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingMode {
    /// 4-byte big-endian length followed by JSON
    #[default]
    Legacy,
    /// 4-byte big-endian length, 1-byte payload format, payload
    Modern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub ack: bool,
    pub resume: bool,
    pub max_inflight: u32,
    pub supports_topics: bool,
    pub framing: FramingMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeSession {
    pub resume_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    pub capabilities: Capabilities,
    /// Present only when resuming a previous session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<ResumeSession>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub max_frame_bytes: usize,
    pub heartbeat_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framing: Option<FramingMode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    pub server: ServerInfo,
}

/// Body of SEND and DELIVER frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendPayload {
    /// Message kind, "message" unless a higher layer says otherwise
    #[serde(default = "default_kind")]
    pub kind: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

fn default_kind() -> String {
    "message".to_string()
}

impl SendPayload {
    pub fn message(body: impl Into<String>) -> Self {
        Self {
            kind: default_kind(),
            body: body.into(),
            data: None,
            thread: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub ack_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub fatal: bool,
    #[serde(default)]
    pub retryable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyPayload {
    pub retry_after_ms: u64,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelJoinPayload {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLeavePayload {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessagePayload {
    pub channel: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowBindPayload {
    pub primary_agent: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub speak_on: Vec<String>,
    #[serde(default)]
    pub receive_incoming: bool,
    #[serde(default)]
    pub receive_outgoing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowUnbindPayload {
    pub primary_agent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPayload {
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnPayload {
    pub name: String,
    pub cli: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasePayload {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A delivered direct or broadcast message, as handed to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Envelope id, also the dedup key
    pub id: String,
    pub from: String,
    pub body: String,
    pub kind: String,
    pub thread: Option<String>,
    pub data: Option<Value>,
    pub topic: Option<String>,
    pub importance: Option<u8>,
    pub sync: Option<SyncMeta>,
    /// Original target, so broadcast and direct receipt can be told apart
    pub original_to: Option<String>,
}

impl InboundMessage {
    pub fn is_broadcast(&self) -> bool {
        self.original_to.as_deref() == Some(BROADCAST_TARGET)
    }
}

/// A delivered channel message
#[derive(Debug, Clone, PartialEq)]
pub struct InboundChannelMessage {
    pub id: String,
    pub from: String,
    pub channel: String,
    pub body: String,
    pub thread: Option<String>,
    pub mentions: Vec<String>,
    pub data: Option<Value>,
}

/// Parsed relay command from agent output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedRelayCommand {
    /// Type identifier (always "relay_command")
    #[serde(rename = "type")]
    pub cmd_type: String,
    /// Command kind: "message", "spawn", "release"
    pub kind: String,
    /// Sender (the agent name)
    pub from: String,
    /// Target (agent name, channel, or broadcast) - for messages
    pub to: String,
    /// Message body
    pub body: String,
    /// Raw text that was parsed
    pub raw: String,
    /// Optional thread identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    /// Optional structured data attached by file-based commands
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// For spawn: agent name to spawn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawn_name: Option<String>,
    /// For spawn: CLI to use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawn_cli: Option<String>,
    /// For spawn: task description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawn_task: Option<String>,
    /// For release: agent name to release
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
}

impl ParsedRelayCommand {
    fn base(kind: &str, from: String, to: String, body: String, raw: String) -> Self {
        Self {
            cmd_type: "relay_command".to_string(),
            kind: kind.to_string(),
            from,
            to,
            body,
            raw,
            thread: None,
            data: None,
            spawn_name: None,
            spawn_cli: None,
            spawn_task: None,
            release_name: None,
        }
    }

    pub fn new_message(from: String, to: String, body: String, raw: String) -> Self {
        Self::base("message", from, to, body, raw)
    }

    pub fn new_spawn(from: String, name: String, cli: String, task: String, raw: String) -> Self {
        let mut cmd = Self::base("spawn", from, "spawn".to_string(), task.clone(), raw);
        cmd.spawn_name = Some(name);
        cmd.spawn_cli = Some(cli);
        cmd.spawn_task = Some(task);
        cmd
    }

    pub fn new_release(from: String, name: String, raw: String) -> Self {
        let mut cmd = Self::base("release", from, "release".to_string(), name.clone(), raw);
        cmd.release_name = Some(name);
        cmd
    }

    pub fn with_thread(mut self, thread: String) -> Self {
        self.thread = Some(thread);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Continuity action requested by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuityAction {
    Save,
    Load,
    Uncertain,
}

/// Parsed continuity command from agent output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuityCommand {
    /// Type identifier (always "continuity")
    #[serde(rename = "type")]
    pub cmd_type: String,
    pub action: ContinuityAction,
    pub content: String,
}

impl ContinuityCommand {
    pub fn new(action: ContinuityAction, content: String) -> Self {
        Self {
            cmd_type: "continuity".to_string(),
            action,
            content,
        }
    }
}

/// Internal message for the injection queue
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Unique message ID
    pub message_id: String,
    /// Sender name
    pub from: String,
    /// Message body
    pub body: String,
    pub thread: Option<String>,
    /// 0 is the highest importance
    pub importance: u8,
    pub data: Option<Value>,
    /// Present when the sender is blocked waiting for this message
    pub sync: Option<SyncMeta>,
    /// Original target (`*` or `#channel`) when not a direct message
    pub original_to: Option<String>,
    /// Timestamp when queued
    pub queued_at: std::time::Instant,
}

impl QueuedMessage {
    pub fn new(message_id: String, from: String, body: String, importance: u8) -> Self {
        Self {
            message_id,
            from,
            body,
            thread: None,
            importance,
            data: None,
            sync: None,
            original_to: None,
            queued_at: std::time::Instant::now(),
        }
    }

    pub fn from_inbound(msg: InboundMessage) -> Self {
        Self {
            message_id: msg.id,
            from: msg.from,
            body: msg.body,
            thread: msg.thread,
            importance: msg.importance.unwrap_or(DEFAULT_IMPORTANCE),
            data: msg.data,
            sync: msg.sync,
            original_to: msg.original_to,
            queued_at: std::time::Instant::now(),
        }
    }

    pub fn from_channel(msg: InboundChannelMessage) -> Self {
        Self {
            message_id: msg.id,
            from: msg.from,
            body: msg.body,
            thread: msg.thread,
            importance: DEFAULT_IMPORTANCE,
            data: msg.data,
            sync: None,
            original_to: Some(msg.channel),
            queued_at: std::time::Instant::now(),
        }
    }

    /// Short form of the id shown in the marker.
    ///
    /// Ids of up to seven characters show as-is. Longer ids share time-based
    /// prefixes, so they are shortened to a hash of the whole id instead.
    fn short_id(&self) -> String {
        if self.message_id.chars().count() <= SHORT_ID_LEN {
            return self.message_id.clone();
        }
        let mut hasher = DefaultHasher::new();
        self.message_id.hash(&mut hasher);
        format!("{:016x}", hasher.finish())[..SHORT_ID_LEN].to_string()
    }

    /// Marker that shows up in terminal output once the injection landed
    pub fn verification_marker(&self) -> String {
        format!("Relay message from {} [{}]", self.from, self.short_id())
    }

    /// Format as relay message for injection
    pub fn format_for_injection(&self) -> String {
        let mut hint = String::new();
        if let Some(ref thread) = self.thread {
            hint.push_str(&format!(" [thread:{}]", thread));
        }
        match self.original_to.as_deref() {
            Some(BROADCAST_TARGET) => hint.push_str(" [broadcast]"),
            Some(channel) if channel.starts_with('#') => {
                hint.push_str(&format!(" [{}]", channel));
            }
            _ => {}
        }
        format!("{}{}: {}", self.verification_marker(), hint, self.body)
    }
}

const SHORT_ID_LEN: usize = 7;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a time-prefixed, process-unique identifier.
///
/// Ids sort lexicographically by creation time within a process; the counter
/// breaks ties inside the same millisecond.
pub fn next_id() -> String {
    let seq = ID_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!(
        "{:012x}-{:08x}-{:x}",
        current_timestamp_ms(),
        seq,
        std::process::id()
    )
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
