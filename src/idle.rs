//! Idle detection for the wrapped agent.
//!
//! Three signals are combined:
//! - `process_state`: the process is blocked reading its terminal (Linux only)
//! - `output_silence`: no output for at least the configured silence window
//! - `natural_ending`: the last output line looks like a finished prompt or sentence

use crate::config::IdleConfig;
use crate::inject::is_relay_echo;
use crate::parser::strip_ansi;
use parking_lot::Mutex;
use regex::Regex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const PROCESS_STATE_CONFIDENCE: f64 = 0.95;
const SILENCE_BASE_CONFIDENCE: f64 = 0.6;
const SILENCE_MAX_BONUS: f64 = 0.2;
const NATURAL_ENDING_CONFIDENCE: f64 = 0.6;
/// Heuristic signals alone never reach process-state certainty
const HEURISTIC_CAP: f64 = 0.9;
const TAIL_MAX_CHARS: usize = 2000;

/// Kernel wait channels of a task sleeping in a terminal read
#[cfg(target_os = "linux")]
const INPUT_WAIT_CHANNELS: &[&str] = &["n_tty_read", "tty_read", "wait_woken"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleSource {
    ProcessState,
    OutputSilence,
    NaturalEnding,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdleSignal {
    pub source: IdleSource,
    pub confidence: f64,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdleResult {
    pub is_idle: bool,
    pub confidence: f64,
    pub signals: Vec<IdleSignal>,
}

struct IdleState {
    last_output: Instant,
    /// ANSI-stripped tail of recent output
    tail: String,
    /// Explicit ready signal seen since the last output
    ready_hint: bool,
}

/// Judges whether the agent is waiting for input
pub struct IdleDetector {
    config: IdleConfig,
    prompt: Option<Regex>,
    pid: Mutex<Option<u32>>,
    state: Mutex<IdleState>,
}

impl IdleDetector {
    pub fn new(config: IdleConfig) -> Self {
        let prompt = match Regex::new(&config.prompt_pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = %config.prompt_pattern, error = %e, "invalid prompt pattern, ignoring");
                None
            }
        };
        Self {
            config,
            prompt,
            pid: Mutex::new(None),
            state: Mutex::new(IdleState {
                last_output: Instant::now(),
                tail: String::new(),
                ready_hint: false,
            }),
        }
    }

    /// Track a process whose kernel state can be inspected.
    pub fn set_pid(&self, pid: Option<u32>) {
        *self.pid.lock() = pid;
    }

    /// Feed a raw output chunk.
    pub fn on_output(&self, chunk: &str) {
        if chunk.is_empty() || is_relay_echo(chunk) {
            return;
        }
        let clean = strip_ansi(chunk);
        let mut state = self.state.lock();
        state.last_output = Instant::now();
        state.ready_hint = false;
        state.tail.push_str(&clean);
        trim_tail(&mut state.tail);
    }

    /// Record an explicit ready hint (e.g. a detected prompt).
    pub fn mark_ready(&self) {
        self.state.lock().ready_hint = true;
    }

    /// Clear silence tracking, e.g. right after an injection.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.last_output = Instant::now();
        state.tail.clear();
        state.ready_hint = false;
    }

    /// Time since the last non-echo output
    pub fn silence(&self) -> Duration {
        self.state.lock().last_output.elapsed()
    }

    pub fn check_idle(&self, min_silence: Option<Duration>) -> IdleResult {
        let min_silence = min_silence.unwrap_or(self.config.min_silence);
        let (silence, last_line, ready_hint) = {
            let state = self.state.lock();
            let last_line = state
                .tail
                .lines()
                .rev()
                .map(str::trim_end)
                .find(|line| !line.trim().is_empty())
                .unwrap_or("")
                .to_string();
            (state.last_output.elapsed(), last_line, state.ready_hint)
        };

        let mut signals = Vec::new();

        if let Some(pid) = *self.pid.lock() {
            if waiting_on_input(pid) == Some(true) {
                signals.push(IdleSignal {
                    source: IdleSource::ProcessState,
                    confidence: PROCESS_STATE_CONFIDENCE,
                    details: format!("pid {} blocked reading its terminal", pid),
                });
            }
        }

        if silence >= min_silence {
            signals.push(IdleSignal {
                source: IdleSource::OutputSilence,
                confidence: silence_confidence(silence, min_silence),
                details: format!("{}ms without output", silence.as_millis()),
            });
        }

        if ready_hint || self.looks_finished(&last_line) {
            signals.push(IdleSignal {
                source: IdleSource::NaturalEnding,
                confidence: NATURAL_ENDING_CONFIDENCE,
                details: if ready_hint {
                    "ready signal".to_string()
                } else {
                    format!("last line: {:?}", truncate(&last_line, 40))
                },
            });
        }

        let confidence = combine(&signals);
        IdleResult {
            is_idle: confidence >= self.config.confidence_threshold,
            confidence,
            signals,
        }
    }

    /// Poll until idle or until `timeout` elapses; returns the last result.
    pub async fn wait_for_idle(&self, timeout: Duration, poll: Duration) -> IdleResult {
        let start = Instant::now();
        loop {
            let result = self.check_idle(None);
            if result.is_idle {
                return result;
            }
            if start.elapsed() >= timeout {
                debug!(
                    confidence = result.confidence,
                    "gave up waiting for idle after {}ms",
                    timeout.as_millis()
                );
                return result;
            }
            tokio::time::sleep(poll.min(timeout.saturating_sub(start.elapsed()))).await;
        }
    }

    fn looks_finished(&self, line: &str) -> bool {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return false;
        }
        if self.prompt.as_ref().is_some_and(|re| re.is_match(trimmed)) {
            return true;
        }
        trimmed.ends_with(&['.', '!', '?', '>', '$', '%', '#', '❯'][..])
    }
}

/// 0.6 at exactly `min`, rising linearly to 0.8 at `2 * min`
fn silence_confidence(silence: Duration, min: Duration) -> f64 {
    if min.is_zero() {
        return SILENCE_BASE_CONFIDENCE + SILENCE_MAX_BONUS;
    }
    let over = silence.saturating_sub(min).as_secs_f64() / min.as_secs_f64();
    SILENCE_BASE_CONFIDENCE + SILENCE_MAX_BONUS * over.min(1.0)
}

fn combine(signals: &[IdleSignal]) -> f64 {
    if let Some(state) = signals
        .iter()
        .find(|s| s.source == IdleSource::ProcessState)
    {
        return state.confidence;
    }
    // Noisy-or of the heuristics
    let miss: f64 = signals.iter().map(|s| 1.0 - s.confidence).product();
    if signals.is_empty() {
        0.0
    } else {
        (1.0 - miss).min(HEURISTIC_CAP)
    }
}

fn trim_tail(tail: &mut String) {
    let chars = tail.chars().count();
    if chars <= TAIL_MAX_CHARS {
        return;
    }
    let start = tail
        .char_indices()
        .nth(chars - TAIL_MAX_CHARS)
        .map(|(i, _)| i)
        .unwrap_or(0);
    tail.drain(..start);
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(target_os = "linux")]
fn waiting_on_input(pid: u32) -> Option<bool> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // comm may contain spaces; state follows the closing paren
    let state = stat.rsplit_once(')')?.1.split_whitespace().next()?;
    if state != "S" {
        return Some(false);
    }
    let wchan = std::fs::read_to_string(format!("/proc/{}/wchan", pid)).ok()?;
    Some(INPUT_WAIT_CHANNELS.iter().any(|c| wchan.contains(c)))
}

#[cfg(not(target_os = "linux"))]
fn waiting_on_input(_pid: u32) -> Option<bool> {
    None
}
