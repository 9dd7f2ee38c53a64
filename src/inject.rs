//! Injection logic for delivering messages to the agent.
//!
//! Handles:
//! - Waiting for injection window (agent idle)
//! - Writing message through the agent backend
//! - Verifying injection success
//! - Retry logic with linear backoff

use crate::config::InjectionConfig;
use crate::idle::IdleDetector;
use crate::parser::strip_ansi;
use crate::protocol::{QueuedMessage, SyncMeta};
use crate::queue::{EnqueueOutcome, MessageQueue};
use crate::stuck::StuckDetector;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Recent output kept for verification
const RECENT_OUTPUT_MAX_BYTES: usize = 10_000;

/// Something that can take injected text: a PTY today, an HTTP API or a
/// terminal multiplexer tomorrow.
pub trait AgentBackend: Send + Sync {
    /// Whether injected text shows up in the output so it can be verified
    fn requires_verification(&self) -> bool;

    /// Write `text` as if typed, including the submit key.
    fn perform_injection<'a>(&'a self, text: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;

    /// OS process backing the agent, if any
    fn process_id(&self) -> Option<u32> {
        None
    }
}

/// Pipeline notifications
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Queued {
        id: String,
        from: String,
        queue_length: usize,
    },
    Injecting {
        id: String,
        attempt: u32,
    },
    Delivered {
        id: String,
        from: String,
        attempts: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        sync: Option<SyncMeta>,
    },
    InjectionFailed {
        id: String,
        from: String,
        attempts: u32,
        error: String,
    },
    Backpressure {
        queue_length: usize,
        accept: bool,
    },
    Rejected {
        id: String,
        from: String,
        queue_length: usize,
    },
}

/// Injection counters
#[derive(Debug, Default)]
pub struct InjectionMetrics {
    total_attempts: AtomicU64,
    success_first_try: AtomicU64,
    success_with_retry: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_attempts: u64,
    pub success_first_try: u64,
    pub success_with_retry: u64,
    pub failed: u64,
}

impl MetricsSnapshot {
    /// Delivered share of finished messages, 1.0 when nothing finished yet
    pub fn success_rate(&self) -> f64 {
        let ok = self.success_first_try + self.success_with_retry;
        let total = ok + self.failed;
        if total == 0 {
            1.0
        } else {
            ok as f64 / total as f64
        }
    }
}

impl InjectionMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            success_first_try: self.success_first_try.load(Ordering::Relaxed),
            success_with_retry: self.success_with_retry.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.total_attempts.store(0, Ordering::Relaxed);
        self.success_first_try.store(0, Ordering::Relaxed);
        self.success_with_retry.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
    }
}

/// Queues inbound messages and injects them one at a time
pub struct InjectionPipeline {
    config: InjectionConfig,
    backend: Arc<dyn AgentBackend>,
    idle: Arc<IdleDetector>,
    stuck: Option<Arc<StuckDetector>>,
    queue: MessageQueue,
    metrics: InjectionMetrics,
    events: broadcast::Sender<PipelineEvent>,
    /// Recent output buffer for verification
    recent_output: Mutex<String>,
    injecting: AtomicBool,
}

impl InjectionPipeline {
    pub fn new(
        config: InjectionConfig,
        backend: Arc<dyn AgentBackend>,
        idle: Arc<IdleDetector>,
        stuck: Option<Arc<StuckDetector>>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            queue: MessageQueue::new(&config, events.clone()),
            config,
            backend,
            idle,
            stuck,
            metrics: InjectionMetrics::default(),
            events,
            recent_output: Mutex::new(String::new()),
            injecting: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Queue a delivered message. Returns false for duplicates and rejections.
    pub fn handle_incoming_message(&self, msg: QueuedMessage) -> bool {
        matches!(self.queue.enqueue(msg), EnqueueOutcome::Queued { .. })
    }

    /// Record new output for verification
    pub fn record_output(&self, output: &str) {
        let mut recent = self.recent_output.lock();
        recent.push_str(output);

        // Limit buffer size (must find valid UTF-8 char boundary)
        if recent.len() > RECENT_OUTPUT_MAX_BYTES {
            let target_start = recent.len() - RECENT_OUTPUT_MAX_BYTES;
            let start = (target_start..=recent.len())
                .find(|&i| recent.is_char_boundary(i))
                .unwrap_or(recent.len());
            recent.drain(..start);
        }
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_injecting(&self) -> bool {
        self.injecting.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Run the injection loop
    pub async fn run(&self) {
        info!("Injection loop started");
        loop {
            let msg = self.queue.next().await;
            self.process(msg).await;
        }
    }

    async fn process(&self, msg: QueuedMessage) {
        self.injecting.store(true, Ordering::SeqCst);
        debug!(
            "Processing message {} (importance {}, waited {}ms)",
            msg.message_id,
            msg.importance,
            msg.queued_at.elapsed().as_millis()
        );

        match self.inject_with_retry(&msg).await {
            Ok(attempts) => {
                info!("Message {} delivered after {} attempt(s)", msg.message_id, attempts);
                if attempts == 1 {
                    self.metrics.success_first_try.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.metrics.success_with_retry.fetch_add(1, Ordering::Relaxed);
                }
                self.idle.reset();
                if let Some(stuck) = &self.stuck {
                    stuck.reset();
                }
                self.queue.remove(&msg.message_id);
                let _ = self.events.send(PipelineEvent::Delivered {
                    id: msg.message_id,
                    from: msg.from,
                    attempts,
                    sync: msg.sync,
                });
            }
            Err(error) => {
                let attempts = self.config.max_attempts.max(1);
                error!(
                    "Message {} failed after {} attempts: {}",
                    msg.message_id, attempts, error
                );
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                self.queue.remove(&msg.message_id);
                let _ = self.events.send(PipelineEvent::InjectionFailed {
                    id: msg.message_id,
                    from: msg.from,
                    attempts,
                    error,
                });
            }
        }

        self.injecting.store(false, Ordering::SeqCst);
    }

    /// Returns the number of attempts used, or the last error.
    async fn inject_with_retry(&self, msg: &QueuedMessage) -> Result<u32, String> {
        let max_attempts = self.config.max_attempts.max(1);
        let verify = !self.config.skip_verification && self.backend.requires_verification();
        let marker = msg.verification_marker();
        let formatted = msg.format_for_injection();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let _ = self.events.send(PipelineEvent::Injecting {
                id: msg.message_id.clone(),
                attempt,
            });
            self.metrics.total_attempts.fetch_add(1, Ordering::Relaxed);

            self.wait_for_window(msg).await;
            self.recent_output.lock().clear();

            debug!(
                "Attempt {}/{}: writing {} bytes: {}",
                attempt,
                max_attempts,
                formatted.len(),
                formatted.chars().take(100).collect::<String>()
            );

            match self.backend.perform_injection(&formatted).await {
                Ok(()) => {
                    if !verify || self.verify(&marker).await {
                        return Ok(attempt);
                    }
                    last_error = format!(
                        "verification marker not seen within {}ms",
                        self.config.verification_timeout.as_millis()
                    );
                }
                Err(e) => last_error = e.to_string(),
            }

            if attempt < max_attempts {
                let backoff = self.config.retry_backoff * attempt;
                warn!(
                    "Message {} not delivered ({}), retrying in {}ms ({}/{})",
                    msg.message_id,
                    last_error,
                    backoff.as_millis(),
                    attempt,
                    max_attempts
                );
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_error)
    }

    async fn wait_for_window(&self, msg: &QueuedMessage) {
        let result = self
            .idle
            .wait_for_idle(self.config.idle_wait_timeout, self.config.idle_poll)
            .await;
        if !result.is_idle {
            warn!(
                "Injection window timeout for message {} (confidence {:.2}), proceeding anyway",
                msg.message_id, result.confidence
            );
        }
    }

    async fn verify(&self, marker: &str) -> bool {
        let deadline = Instant::now() + self.config.verification_timeout;
        loop {
            if strip_ansi(&self.recent_output.lock()).contains(marker) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.verification_poll.min(deadline - now)).await;
        }
    }
}

/// True when every non-blank line is the echo of an injected relay message
pub fn is_relay_echo(output: &str) -> bool {
    let mut any = false;
    let all = output.lines().all(|line| {
        let trimmed = line.trim();
        any |= !trimmed.is_empty();
        trimmed.is_empty() || strip_ansi(trimmed).trim_start().starts_with("Relay message from ")
    });
    all && any
}
