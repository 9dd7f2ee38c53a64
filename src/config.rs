//! Configuration for the relay agent and its components.
//!
//! Every sub-config carries the defaults the binary falls back to when a
//! flag is not given.

use crate::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::dedup::DEFAULT_DEDUP_CAPACITY;
use crate::protocol::FramingMode;
use crate::transport::TransportAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Connection engine settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Agent name announced in HELLO
    pub agent_name: String,
    /// Entity type announced in HELLO ("agent" or "user")
    pub entity_type: Option<String>,
    /// CLI being wrapped, informational
    pub cli: Option<String>,
    pub model: Option<String>,
    pub task: Option<String>,
    pub working_directory: Option<String>,
    /// Relay address
    pub address: TransportAddr,
    pub framing: FramingMode,
    pub max_frame_bytes: usize,
    pub reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Default timeout for `send_and_wait`
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    /// How long a partial frame may sit in the decoder without progress
    pub frame_read_timeout: Duration,
    /// Heartbeat intervals missed before the connection is declared dead
    pub heartbeat_miss_limit: u32,
    pub dedup_capacity: usize,
    pub max_inflight: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            agent_name: "agent".to_string(),
            entity_type: None,
            cli: None,
            model: None,
            task: None,
            working_directory: None,
            address: TransportAddr::Unix(PathBuf::from("/tmp/agent-relay.sock")),
            framing: FramingMode::Legacy,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            reconnect: true,
            max_reconnect_attempts: 10,
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            frame_read_timeout: Duration::from_secs(10),
            heartbeat_miss_limit: 3,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            max_inflight: 256,
        }
    }
}

/// Idle detector settings
#[derive(Debug, Clone)]
pub struct IdleConfig {
    /// Silence after the last output chunk before output_silence contributes
    pub min_silence: Duration,
    /// Combined confidence needed to call the agent idle
    pub confidence_threshold: f64,
    /// Prompt regex that counts as a natural ending
    pub prompt_pattern: String,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            min_silence: Duration::from_millis(1500),
            confidence_threshold: 0.7,
            prompt_pattern: r"^[>$%#❯] ?$".to_string(),
        }
    }
}

/// Stuck detector settings
#[derive(Debug, Clone)]
pub struct StuckConfig {
    pub extended_idle: Duration,
    pub error_loop_threshold: u32,
    pub output_loop_threshold: u32,
    /// Normalized lines shorter than this never count toward an output loop
    pub min_loop_length: usize,
    pub check_interval: Duration,
    /// Case-insensitive regexes for error-shaped lines
    pub error_patterns: Vec<String>,
}

impl Default for StuckConfig {
    fn default() -> Self {
        Self {
            extended_idle: Duration::from_secs(10 * 60),
            error_loop_threshold: 3,
            output_loop_threshold: 3,
            min_loop_length: 20,
            check_interval: Duration::from_secs(30),
            error_patterns: vec![
                r"\berror\b[:!]".to_string(),
                r"\bfailed\b".to_string(),
                r"\bexception\b".to_string(),
                r"\bfatal\b".to_string(),
                r"\bpanic(ked)?\b".to_string(),
                r"rate limit".to_string(),
                r"permission denied".to_string(),
                r"\b(enoent|eacces|econnrefused|etimedout)\b".to_string(),
            ],
        }
    }
}

/// Injection pipeline settings
#[derive(Debug, Clone)]
pub struct InjectionConfig {
    /// Hard cap on queued messages
    pub queue_max: usize,
    /// Total injection attempts per message
    pub max_attempts: u32,
    /// Linear backoff unit between attempts
    pub retry_backoff: Duration,
    pub verification_timeout: Duration,
    pub verification_poll: Duration,
    /// Trust writes without looking for the echo marker
    pub skip_verification: bool,
    /// How long to wait for idle before injecting anyway
    pub idle_wait_timeout: Duration,
    pub idle_poll: Duration,
    /// Tell the sender when a message could not be injected
    pub notify_on_failure: bool,
    pub dedup_capacity: usize,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            queue_max: 50,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(300),
            verification_timeout: Duration::from_secs(2),
            verification_poll: Duration::from_millis(100),
            skip_verification: false,
            idle_wait_timeout: Duration::from_secs(10),
            idle_poll: Duration::from_millis(100),
            notify_on_failure: true,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}

impl InjectionConfig {
    /// Queue depth at which backpressure is signalled
    pub fn high_watermark(&self) -> usize {
        (self.queue_max * 8 / 10).max(1)
    }

    /// Queue depth at which backpressure is released
    pub fn low_watermark(&self) -> usize {
        self.queue_max / 2
    }
}

/// Configuration for the whole wrapper
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub idle: IdleConfig,
    pub stuck: StuckConfig,
    pub injection: InjectionConfig,
    /// Outbox directory for file-based relay commands
    pub outbox: Option<PathBuf>,
    /// Directory for continuity summaries
    pub continuity_dir: Option<PathBuf>,
    /// Emit parsed commands and events as JSON lines on stderr
    pub json_output: bool,
    /// Command to run (e.g., ["claude", "--model", "opus"])
    pub command: Vec<String>,
}

impl Config {
    pub fn agent_name(&self) -> &str {
        &self.connection.agent_name
    }
}
