//! Stuck detection for the wrapped agent.
//!
//! Watches output for three failure shapes: long silence, the same error
//! line over and over, and the same output line repeating back to back.
//! Output is compared as complete normalized lines, so the loop checks do not
//! depend on how the terminal happened to chunk it. Fires at most one event
//! until `reset()`; fresh output clears an extended-idle state on its own.

use crate::config::StuckConfig;
use crate::inject::is_relay_echo;
use crate::parser::strip_ansi;
use crate::protocol::current_timestamp_ms;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Normalized error lines remembered for loop detection
const RECENT_ERROR_LINES: usize = 50;
const MAX_CONTENT_PREVIEW: usize = 200;
/// An unterminated line longer than this is judged as it stands
const MAX_PARTIAL_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckReason {
    ExtendedIdle,
    ErrorLoop,
    OutputLoop,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StuckEvent {
    pub reason: StuckReason,
    pub details: String,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeated_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repetitions: Option<u32>,
}

struct StuckState {
    last_output: Instant,
    recent_errors: VecDeque<String>,
    /// Output after the last line break
    partial: String,
    last_line: Option<String>,
    line_repeats: u32,
    stuck: Option<StuckReason>,
}

pub struct StuckDetector {
    config: StuckConfig,
    error_patterns: Vec<Regex>,
    state: Mutex<StuckState>,
    events: broadcast::Sender<StuckEvent>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl StuckDetector {
    pub fn new(config: StuckConfig) -> Arc<Self> {
        let error_patterns = config
            .error_patterns
            .iter()
            .filter_map(|p| match RegexBuilder::new(p).case_insensitive(true).build() {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "skipping invalid error pattern");
                    None
                }
            })
            .collect();
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            config,
            error_patterns,
            state: Mutex::new(StuckState {
                last_output: Instant::now(),
                recent_errors: VecDeque::with_capacity(RECENT_ERROR_LINES),
                partial: String::new(),
                last_line: None,
                line_repeats: 0,
                stuck: None,
            }),
            events,
            ticker: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StuckEvent> {
        self.events.subscribe()
    }

    /// Start the periodic extended-idle check.
    pub fn start(self: &Arc<Self>) {
        let detector = Arc::downgrade(self);
        let period = self.config.check_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                match detector.upgrade() {
                    Some(detector) => detector.check(),
                    None => break,
                }
            }
        });
        if let Some(previous) = self.ticker.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
    }

    pub fn on_output(&self, chunk: &str) {
        if is_relay_echo(chunk) {
            return;
        }
        let clean = strip_ansi(chunk);

        let fired = {
            let mut state = self.state.lock();
            state.last_output = Instant::now();
            if state.stuck == Some(StuckReason::ExtendedIdle) {
                debug!("output resumed, extended idle cleared");
                state.stuck = None;
            }
            if state.stuck.is_some() {
                return;
            }
            let lines = complete_lines(&mut state.partial, &clean);
            lines.iter().find_map(|line| {
                let line = normalize(line);
                if line.is_empty() {
                    return None;
                }
                self.detect_error_loop(&mut state, &line)
                    .or_else(|| self.detect_output_loop(&mut state, line))
            })
        };

        if let Some(event) = fired {
            self.emit(event);
        }
    }

    /// Run the periodic check now.
    pub fn check(&self) {
        self.check_at(Instant::now());
    }

    pub fn check_at(&self, now: Instant) {
        let fired = {
            let mut state = self.state.lock();
            let idle = now.saturating_duration_since(state.last_output);
            if state.stuck.is_some() || idle < self.config.extended_idle {
                None
            } else {
                state.stuck = Some(StuckReason::ExtendedIdle);
                Some(StuckEvent {
                    reason: StuckReason::ExtendedIdle,
                    details: format!("no output for {}s", idle.as_secs()),
                    timestamp: current_timestamp_ms(),
                    idle_duration_ms: Some(idle.as_millis() as u64),
                    repeated_content: None,
                    repetitions: None,
                })
            }
        };
        if let Some(event) = fired {
            self.emit(event);
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.last_output = Instant::now();
        state.recent_errors.clear();
        state.partial.clear();
        state.last_line = None;
        state.line_repeats = 0;
        if let Some(reason) = state.stuck.take() {
            debug!(?reason, "stuck state cleared");
        }
    }

    pub fn is_stuck(&self) -> bool {
        self.state.lock().stuck.is_some()
    }

    pub fn stuck_reason(&self) -> Option<StuckReason> {
        self.state.lock().stuck
    }

    /// Time since the last output
    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_output.elapsed()
    }

    fn detect_error_loop(&self, state: &mut StuckState, line: &str) -> Option<StuckEvent> {
        if !self.error_patterns.iter().any(|re| re.is_match(line)) {
            return None;
        }
        if state.recent_errors.len() == RECENT_ERROR_LINES {
            state.recent_errors.pop_front();
        }
        state.recent_errors.push_back(line.to_string());

        let count = state.recent_errors.iter().filter(|l| *l == line).count() as u32;
        if count < self.config.error_loop_threshold {
            return None;
        }
        state.stuck = Some(StuckReason::ErrorLoop);
        Some(StuckEvent {
            reason: StuckReason::ErrorLoop,
            details: format!("same error repeated {} times", count),
            timestamp: current_timestamp_ms(),
            idle_duration_ms: None,
            repeated_content: Some(preview(line)),
            repetitions: Some(count),
        })
    }

    /// Short lines (prompts, spinners) neither count nor break a run.
    fn detect_output_loop(&self, state: &mut StuckState, line: String) -> Option<StuckEvent> {
        if line.chars().count() < self.config.min_loop_length {
            return None;
        }
        if state.last_line.as_deref() == Some(line.as_str()) {
            state.line_repeats += 1;
        } else {
            state.last_line = Some(line);
            state.line_repeats = 1;
        }

        if state.line_repeats < self.config.output_loop_threshold {
            return None;
        }
        state.stuck = Some(StuckReason::OutputLoop);
        Some(StuckEvent {
            reason: StuckReason::OutputLoop,
            details: format!("same output repeated {} times", state.line_repeats),
            timestamp: current_timestamp_ms(),
            idle_duration_ms: None,
            repeated_content: state.last_line.as_deref().map(preview),
            repetitions: Some(state.line_repeats),
        })
    }

    fn emit(&self, event: StuckEvent) {
        warn!(reason = ?event.reason, "agent looks stuck: {}", event.details);
        let _ = self.events.send(event);
    }
}

impl Drop for StuckDetector {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.get_mut().take() {
            handle.abort();
        }
    }
}

/// Strip control sequences, collapse whitespace, trim, lowercase.
pub fn normalize(text: &str) -> String {
    strip_ansi(text)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Append `chunk` to the unterminated tail and take every finished line.
///
/// Carriage returns end a line too, since terminals redraw status lines with them.
fn complete_lines(partial: &mut String, chunk: &str) -> Vec<String> {
    partial.push_str(chunk);
    let Some(last_break) = partial.rfind(['\n', '\r']) else {
        if partial.len() > MAX_PARTIAL_LINE {
            return vec![std::mem::take(partial)];
        }
        return Vec::new();
    };
    let rest = partial.split_off(last_break + 1);
    let done = std::mem::replace(partial, rest);
    done.split(['\n', '\r']).map(str::to_string).collect()
}

fn preview(text: &str) -> String {
    text.chars().take(MAX_CONTENT_PREVIEW).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> Arc<StuckDetector> {
        StuckDetector::new(StuckConfig::default())
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize("  \x1b[1mBuilding   Project\x1b[0m \n\t now "),
            "building project now"
        );
    }

    #[tokio::test]
    async fn test_output_loop_fires_once() {
        let stuck = detector();
        let mut events = stuck.subscribe();
        let line = "Thinking about the next step to take here";
        stuck.on_output(&format!("{}\n", line));
        stuck.on_output(&format!("\x1b[2m{}\x1b[0m  \r\n", line.to_uppercase()));
        assert!(!stuck.is_stuck());
        stuck.on_output(&format!("{}\n", line));
        stuck.on_output(&format!("{}\n", line));

        let event = events.try_recv().unwrap();
        assert_eq!(event.reason, StuckReason::OutputLoop);
        assert_eq!(event.repetitions, Some(3));
        assert!(events.try_recv().is_err());
        assert_eq!(stuck.stuck_reason(), Some(StuckReason::OutputLoop));
    }

    #[tokio::test]
    async fn test_output_loop_ignores_chunk_boundaries() {
        let stuck = detector();
        let mut events = stuck.subscribe();
        let output = "Thinking about the next step to take here\n".repeat(3);
        // Same text, cut at different places each time
        stuck.on_output(&output[..10]);
        stuck.on_output(&output[10..50]);
        stuck.on_output(&output[50..51]);
        assert!(!stuck.is_stuck());
        stuck.on_output(&output[51..97]);
        assert!(!stuck.is_stuck());
        stuck.on_output(&output[97..]);

        let event = events.try_recv().unwrap();
        assert_eq!(event.reason, StuckReason::OutputLoop);
        assert_eq!(event.repetitions, Some(3));
        assert_eq!(
            event.repeated_content.as_deref(),
            Some("thinking about the next step to take here")
        );
    }

    #[test]
    fn test_whole_chunk_repeats_with_different_lines_do_not_loop() {
        let stuck = detector();
        let chunk = "Reading src/main.rs for more context\nThinking about the next step to take here\n";
        for _ in 0..3 {
            stuck.on_output(chunk);
        }
        assert!(!stuck.is_stuck());
    }

    #[test]
    fn test_short_lines_never_loop() {
        let stuck = detector();
        for _ in 0..10 {
            stuck.on_output("> \n");
        }
        assert!(!stuck.is_stuck());
    }

    #[test]
    fn test_interrupted_lines_do_not_loop() {
        let stuck = detector();
        let line = "Thinking about the next step to take here\n";
        stuck.on_output(line);
        stuck.on_output(line);
        stuck.on_output("Reading src/main.rs for more context\n");
        stuck.on_output(line);
        assert!(!stuck.is_stuck());
    }

    #[tokio::test]
    async fn test_error_loop() {
        let stuck = detector();
        let mut events = stuck.subscribe();
        for i in 0..3 {
            stuck.on_output(&format!("attempt {}\nError: connection refused\n", i));
        }
        let event = events.try_recv().unwrap();
        assert_eq!(event.reason, StuckReason::ErrorLoop);
        assert_eq!(event.repetitions, Some(3));
        assert_eq!(
            event.repeated_content.as_deref(),
            Some("error: connection refused")
        );
    }

    #[test]
    fn test_extended_idle() {
        let stuck = StuckDetector::new(StuckConfig {
            extended_idle: Duration::from_secs(60),
            ..Default::default()
        });
        let mut events = stuck.subscribe();
        stuck.check_at(Instant::now() + Duration::from_secs(30));
        assert!(!stuck.is_stuck());
        stuck.check_at(Instant::now() + Duration::from_secs(61));
        let event = events.try_recv().unwrap();
        assert_eq!(event.reason, StuckReason::ExtendedIdle);
        assert!(event.idle_duration_ms.unwrap() >= 60_000);
        stuck.check_at(Instant::now() + Duration::from_secs(120));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_output_after_idle_clears_stuck() {
        let stuck = StuckDetector::new(StuckConfig {
            extended_idle: Duration::from_secs(60),
            ..Default::default()
        });
        let mut events = stuck.subscribe();
        stuck.check_at(Instant::now() + Duration::from_secs(61));
        assert_eq!(stuck.stuck_reason(), Some(StuckReason::ExtendedIdle));

        // An injected message echo is not the agent talking
        stuck.on_output("Relay message from Lead [m1]: hi\n");
        assert!(stuck.is_stuck());

        stuck.on_output("Compiling relay-agent v0.1.0\n");
        assert!(!stuck.is_stuck());

        // Re-armed: a second silence fires again
        stuck.check_at(Instant::now() + Duration::from_secs(61));
        let reasons: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.reason)
            .collect();
        assert_eq!(reasons, vec![StuckReason::ExtendedIdle, StuckReason::ExtendedIdle]);
    }

    #[test]
    fn test_output_does_not_clear_loop_state() {
        let stuck = detector();
        for _ in 0..3 {
            stuck.on_output("Error: connection refused\n");
        }
        stuck.on_output("Compiling relay-agent v0.1.0\n");
        assert_eq!(stuck.stuck_reason(), Some(StuckReason::ErrorLoop));
    }

    #[test]
    fn test_reset_rearms() {
        let stuck = detector();
        let line = "Thinking about the next step to take here\n";
        for _ in 0..3 {
            stuck.on_output(line);
        }
        assert!(stuck.is_stuck());
        stuck.reset();
        assert!(!stuck.is_stuck());
        stuck.on_output(line);
        assert!(!stuck.is_stuck());
    }

    #[tokio::test]
    async fn test_periodic_check_detects_idle() {
        let stuck = StuckDetector::new(StuckConfig {
            extended_idle: Duration::from_millis(40),
            check_interval: Duration::from_millis(20),
            ..Default::default()
        });
        let mut events = stuck.subscribe();
        stuck.start();
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.reason, StuckReason::ExtendedIdle);
        stuck.stop();
    }
}
