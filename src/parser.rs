//! Output parser for relay commands and agent status detection.
//!
//! Scans agent output for:
//! - `->relay-file:ID` commands whose content lives in the outbox directory
//!   (header format preferred, JSON accepted)
//! - `->relay:Target <<<body>>>` fenced and `->relay:Target body` inline messages
//! - `->relay:spawn` / `->relay:release` worker lifecycle commands
//! - `KIND: continuity` outbox files
//! - Prompt patterns and the `->pty:ready` signal (idle hints)

use crate::protocol::{ContinuityAction, ContinuityCommand, ParsedRelayCommand};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::cmp::Reverse;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Explicit "I am waiting for input" marker an agent may print
pub const READY_SIGNAL: &str = "->pty:ready";

/// Parse buffer bound; older text is dropped
const MAX_BUFFER_BYTES: usize = 64 * 1024;

const DEFAULT_PROMPT: &str = r"^[>$%#] $";

/// Prompt suffixes of common agent CLIs and shells
const COMMON_PROMPTS: &[&str] = &["> ", "$ ", ">>> ", "codex> "];

static FILE_PATTERN: OnceLock<Regex> = OnceLock::new();
static INLINE_PATTERN: OnceLock<Regex> = OnceLock::new();
static FENCED_PATTERN: OnceLock<Regex> = OnceLock::new();
static SPAWN_FENCED_PATTERN: OnceLock<Regex> = OnceLock::new();
static SPAWN_QUOTED_PATTERN: OnceLock<Regex> = OnceLock::new();
static RELEASE_PATTERN: OnceLock<Regex> = OnceLock::new();
static FENCE_OPEN_PATTERN: OnceLock<Regex> = OnceLock::new();
static THREAD_PATTERN: OnceLock<Regex> = OnceLock::new();
static ANSI_PATTERN: OnceLock<Regex> = OnceLock::new();

fn compiled(cell: &'static OnceLock<Regex>, source: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(source).expect("built-in pattern is valid"))
}

/// `->relay-file:ID`, the agent wrote the command into the outbox
fn file_pattern() -> &'static Regex {
    compiled(&FILE_PATTERN, r"->relay-file:([a-zA-Z0-9_-]+)")
}

/// `->relay:Target [thread:x] body` on one line
fn inline_pattern() -> &'static Regex {
    compiled(
        &INLINE_PATTERN,
        r"(?m)^[\s>$%#\-*]*->relay:(\S+)(?:[ \t]+\[thread:([^\]]+)\])?[ \t]+(.+?)\r?$",
    )
}

/// `->relay:Target [thread:x] <<<body>>>`, body may span lines
fn fenced_pattern() -> &'static Regex {
    compiled(
        &FENCED_PATTERN,
        r"(?ms)->relay:(\S+)(?:[ \t]+\[thread:([^\]]+)\])?\s+<<<\s*(.*?)>>>",
    )
}

/// `->relay:spawn Name cli <<<task>>>`
fn spawn_fenced_pattern() -> &'static Regex {
    compiled(
        &SPAWN_FENCED_PATTERN,
        r"(?ms)->relay:spawn\s+(\w+)\s+(\w+)\s*<<<\s*(.*?)>>>",
    )
}

/// `->relay:spawn Name cli "task"`
fn spawn_quoted_pattern() -> &'static Regex {
    compiled(
        &SPAWN_QUOTED_PATTERN,
        r#"(?m)->relay:spawn\s+(\w+)\s+(\w+)\s+"([^"]+)""#,
    )
}

/// `->relay:release Name`
fn release_pattern() -> &'static Regex {
    compiled(&RELEASE_PATTERN, r"(?m)->relay:release\s+(\w+)")
}

/// Opening of a fenced command, terminated or not
fn fence_open_pattern() -> &'static Regex {
    compiled(&FENCE_OPEN_PATTERN, r"->relay:\S+[^\n]*?<<<")
}

fn thread_pattern() -> &'static Regex {
    compiled(&THREAD_PATTERN, r"\[thread:([^\]]+)\]")
}

fn ansi_pattern() -> &'static Regex {
    compiled(
        &ANSI_PATTERN,
        r"\x1B\[[0-9;?]*[A-Za-z]|\x1B\][^\x07\x1B]*(?:\x07|\x1B\\)|\x1B[()][A-Za-z0-9]",
    )
}

/// Relay command read from an outbox file, either format
#[derive(Debug, Default)]
struct OutboxMessage {
    /// "message", "spawn" or "release"
    kind: String,
    to: Option<String>,
    /// Message body, or the task for spawn
    body: Option<String>,
    /// Worker name for spawn/release
    name: Option<String>,
    cli: Option<String>,
    thread: Option<String>,
    data: Option<Value>,
}

/// JSON outbox format
#[derive(Debug, Deserialize)]
struct JsonOutboxMessage {
    kind: String,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    cli: Option<String>,
    #[serde(default)]
    task: Option<String>,
    #[serde(default)]
    thread: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl From<JsonOutboxMessage> for OutboxMessage {
    fn from(json: JsonOutboxMessage) -> Self {
        Self {
            kind: json.kind.to_lowercase(),
            to: json.to,
            body: json.body.or(json.task),
            name: json.name,
            cli: json.cli,
            thread: json.thread,
            data: json.data,
        }
    }
}

enum OutboxCommand {
    Relay(ParsedRelayCommand),
    Continuity(ContinuityCommand),
}

/// Command candidate located in the unparsed output
struct Found {
    start: usize,
    end: usize,
    kind: FoundKind,
}

enum FoundKind {
    Relay(ParsedRelayCommand),
    /// `->relay-file:ID`, read only once the match is accepted
    File(String),
}

impl Found {
    fn new(m: &regex::Match<'_>, kind: FoundKind) -> Self {
        Self {
            start: m.start(),
            end: m.end(),
            kind,
        }
    }
}

/// Split `Headers\n\nBody` into uppercase header pairs and the trimmed body.
fn split_headers(content: &str) -> (Vec<(String, String)>, Option<String>) {
    let mut parts = content.splitn(2, "\n\n");
    let headers = parts
        .next()
        .unwrap_or_default()
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once(':')?;
            Some((key.trim().to_uppercase(), value.trim().to_string()))
        })
        .collect();
    let body = parts.next().map(|b| b.trim().to_string());
    (headers, body)
}

/// Parse the header format:
/// ```text
/// TO: AgentName
/// KIND: message
/// THREAD: optional
///
/// Body content here
/// Can span multiple lines
/// ```
fn parse_header_format(content: &str) -> Option<OutboxMessage> {
    let (headers, body) = split_headers(content);
    let mut msg = OutboxMessage {
        body,
        ..Default::default()
    };
    for (key, value) in headers {
        match key.as_str() {
            "TO" => msg.to = Some(value),
            "KIND" => msg.kind = value.to_lowercase(),
            "NAME" => msg.name = Some(value),
            "CLI" => msg.cli = Some(value),
            "THREAD" => msg.thread = Some(value),
            _ => {}
        }
    }

    if msg.kind.is_empty() && msg.to.is_some() {
        msg.kind = "message".to_string();
    }
    (!msg.kind.is_empty()).then_some(msg)
}

/// Parse the continuity header format:
/// ```text
/// KIND: continuity
/// ACTION: save
///
/// Body content here
/// ```
fn parse_continuity_format(content: &str) -> Option<ContinuityCommand> {
    let (headers, body) = split_headers(content);
    let mut kind = None;
    let mut action = None;
    for (key, value) in headers {
        match key.as_str() {
            "KIND" => kind = Some(value.to_lowercase()),
            "ACTION" => action = Some(value.to_lowercase()),
            _ => {}
        }
    }

    if kind.as_deref() != Some("continuity") {
        return None;
    }
    let action = match action.as_deref()? {
        "save" => ContinuityAction::Save,
        "load" => ContinuityAction::Load,
        "uncertain" => ContinuityAction::Uncertain,
        _ => return None,
    };
    Some(ContinuityCommand::new(action, body.unwrap_or_default()))
}

/// `Bob[thread:x]` -> (`Bob`, `x`)
fn split_target(target: &str, thread: Option<&str>) -> (String, Option<String>) {
    match target.find("[thread:") {
        Some(pos) => {
            let embedded = thread_pattern()
                .captures(&target[pos..])
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
            (
                target[..pos].to_string(),
                thread.map(str::to_string).or(embedded),
            )
        }
        None => (target.to_string(), thread.map(str::to_string)),
    }
}

fn is_lifecycle_target(target: &str) -> bool {
    target == "spawn" || target == "release"
}

/// Output parser state
pub struct OutputParser {
    /// Agent name (the "from" field of parsed commands)
    agent_name: String,
    prompt_pattern: Regex,
    /// ANSI-stripped output not yet discarded
    buffer: String,
    /// Everything before this offset was already scanned for commands
    last_parsed_pos: usize,
    /// Outbox directory for file-based commands
    outbox_path: Option<PathBuf>,
}

impl OutputParser {
    pub fn new(agent_name: String, prompt_pattern: &str) -> Self {
        let prompt_pattern = Regex::new(prompt_pattern).unwrap_or_else(|e| {
            warn!("Invalid prompt pattern {:?} ({}), using default", prompt_pattern, e);
            compiled(&DEFAULT_PROMPT_PATTERN, DEFAULT_PROMPT).clone()
        });
        Self {
            agent_name,
            prompt_pattern,
            buffer: String::new(),
            last_parsed_pos: 0,
            outbox_path: None,
        }
    }

    /// Enable `->relay-file:ID` commands read from `outbox_path`
    pub fn with_outbox(mut self, outbox_path: PathBuf) -> Self {
        self.outbox_path = Some(outbox_path);
        self
    }

    /// Process new output and return any parsed commands
    pub fn process(&mut self, output: &[u8]) -> ParseResult {
        let text = String::from_utf8_lossy(output);
        self.buffer.push_str(&strip_ansi(&text));

        let ready_signal = self.take_ready_signal();
        let (commands, continuity_commands) = self.parse_pending();

        if !commands.is_empty() || !continuity_commands.is_empty() {
            debug!(
                "Parsed {} relay and {} continuity commands",
                commands.len(),
                continuity_commands.len()
            );
        }

        let prompt_detected = self.check_for_prompt();
        self.truncate_buffer(MAX_BUFFER_BYTES);

        ParseResult {
            commands,
            continuity_commands,
            prompt_detected,
            ready_signal,
        }
    }

    /// Remove `->pty:ready` from the unparsed region, reporting whether it was there
    fn take_ready_signal(&mut self) -> bool {
        let pending = &self.buffer[self.last_parsed_pos..];
        if !pending.contains(READY_SIGNAL) {
            return false;
        }
        let stripped = pending.replace(READY_SIGNAL, "");
        self.buffer.truncate(self.last_parsed_pos);
        self.buffer.push_str(&stripped);
        true
    }

    fn parse_pending(&mut self) -> (Vec<ParsedRelayCommand>, Vec<ContinuityCommand>) {
        let pending = &self.buffer[self.last_parsed_pos..];
        let mut found = self.find_commands(pending);

        // Output order; at equal offsets the longer match wins
        found.sort_by_key(|f| (f.start, Reverse(f.end)));
        let mut accepted: Vec<Found> = Vec::with_capacity(found.len());
        for f in found {
            if accepted.last().map_or(true, |prev| f.start >= prev.end) {
                accepted.push(f);
            }
        }

        // A fence still being written holds back everything after it
        let open_fence = fence_open_pattern()
            .find_iter(pending)
            .map(|m| m.start())
            .find(|&s| !accepted.iter().any(|f| f.start <= s && s < f.end));
        if let Some(cutoff) = open_fence {
            accepted.retain(|f| f.end <= cutoff);
        }

        let mut commands = Vec::new();
        let mut continuity = Vec::new();
        let mut consumed = 0;
        for f in accepted {
            match f.kind {
                FoundKind::Relay(cmd) => {
                    self.log_command(&cmd);
                    commands.push(cmd);
                }
                FoundKind::File(id) => {
                    let Some(outbox) = &self.outbox_path else {
                        continue;
                    };
                    match self.read_outbox_command(outbox, &id, &pending[f.start..f.end]) {
                        Some(OutboxCommand::Relay(cmd)) => {
                            self.log_command(&cmd);
                            commands.push(cmd);
                        }
                        Some(OutboxCommand::Continuity(cmd)) => continuity.push(cmd),
                        None => continue,
                    }
                }
            }
            consumed = f.end;
        }

        self.last_parsed_pos += consumed;
        (commands, continuity)
    }

    /// Every command candidate in `text`, unordered and possibly overlapping.
    /// Single-line forms are only matched on complete lines.
    fn find_commands(&self, text: &str) -> Vec<Found> {
        let complete = text.rfind('\n').map(|i| &text[..=i]).unwrap_or("");
        let mut found = Vec::new();

        if self.outbox_path.is_some() {
            for caps in file_pattern().captures_iter(complete) {
                let (Some(whole), Some(id)) = (caps.get(0), caps.get(1)) else {
                    continue;
                };
                found.push(Found::new(&whole, FoundKind::File(id.as_str().to_string())));
            }
        }

        for caps in spawn_fenced_pattern()
            .captures_iter(text)
            .chain(spawn_quoted_pattern().captures_iter(complete))
        {
            let (Some(whole), Some(name), Some(cli), Some(task)) =
                (caps.get(0), caps.get(1), caps.get(2), caps.get(3))
            else {
                continue;
            };
            let cmd = ParsedRelayCommand::new_spawn(
                self.agent_name.clone(),
                name.as_str().to_string(),
                cli.as_str().to_string(),
                task.as_str().trim().to_string(),
                whole.as_str().to_string(),
            );
            found.push(Found::new(&whole, FoundKind::Relay(cmd)));
        }

        for caps in release_pattern().captures_iter(complete) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let cmd = ParsedRelayCommand::new_release(
                self.agent_name.clone(),
                name.as_str().to_string(),
                whole.as_str().to_string(),
            );
            found.push(Found::new(&whole, FoundKind::Relay(cmd)));
        }

        for caps in fenced_pattern().captures_iter(text) {
            let (Some(whole), Some(target), Some(body)) = (caps.get(0), caps.get(1), caps.get(3))
            else {
                continue;
            };
            if is_lifecycle_target(target.as_str()) {
                continue;
            }
            let (to, thread) = split_target(target.as_str(), caps.get(2).map(|m| m.as_str()));
            let cmd = self.message(to, body.as_str().trim(), thread, whole.as_str());
            found.push(Found::new(&whole, FoundKind::Relay(cmd)));
        }

        for caps in inline_pattern().captures_iter(complete) {
            let (Some(whole), Some(target), Some(body)) = (caps.get(0), caps.get(1), caps.get(3))
            else {
                continue;
            };
            // Opening line of a fence
            if is_lifecycle_target(target.as_str()) || body.as_str().starts_with("<<<") {
                continue;
            }
            let (to, thread) = split_target(target.as_str(), caps.get(2).map(|m| m.as_str()));
            let cmd = self.message(to, body.as_str().trim(), thread, whole.as_str());
            found.push(Found::new(&whole, FoundKind::Relay(cmd)));
        }

        found
    }

    fn log_command(&self, cmd: &ParsedRelayCommand) {
        match cmd.kind.as_str() {
            "spawn" => info!(
                "{} spawning {} with {}",
                self.agent_name,
                cmd.spawn_name.as_deref().unwrap_or_default(),
                cmd.spawn_cli.as_deref().unwrap_or_default()
            ),
            "release" => info!(
                "{} releasing {}",
                self.agent_name,
                cmd.release_name.as_deref().unwrap_or_default()
            ),
            _ => debug!("Parsed message: {} -> {}", self.agent_name, cmd.to),
        }
    }

    fn message(&self, to: String, body: &str, thread: Option<String>, raw: &str) -> ParsedRelayCommand {
        let cmd = ParsedRelayCommand::new_message(
            self.agent_name.clone(),
            to,
            body.to_string(),
            raw.to_string(),
        );
        match thread {
            Some(thread) => cmd.with_thread(thread),
            None => cmd,
        }
    }

    fn read_outbox_command(&self, outbox: &PathBuf, id: &str, raw: &str) -> Option<OutboxCommand> {
        let candidates = [outbox.join(id), outbox.join(format!("{}.json", id))];
        let Some(path) = candidates.iter().find(|p| p.exists()) else {
            if id.starts_with("spawn") || id == "release" {
                warn!("Spawn/release file not found in {:?}: {}", outbox, id);
            } else {
                debug!("Relay file not found in {:?}: {}", outbox, id);
            }
            return None;
        };

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read relay file {:?}: {}", path, e);
                return None;
            }
        };

        let command = if let Some(continuity) = parse_continuity_format(&content) {
            Some(OutboxCommand::Continuity(continuity))
        } else {
            let msg = parse_header_format(&content).or_else(|| {
                serde_json::from_str::<JsonOutboxMessage>(&sanitize_json_from_shell(&content))
                    .map_err(|e| debug!("Relay file {} is neither header nor JSON: {}", id, e))
                    .ok()
                    .map(OutboxMessage::from)
            })?;
            self.outbox_to_command(msg, raw).map(OutboxCommand::Relay)
        };

        if command.is_some() {
            if let Err(e) = std::fs::remove_file(path) {
                debug!("Could not remove processed relay file {:?}: {}", path, e);
            }
        }
        command
    }

    fn outbox_to_command(&self, msg: OutboxMessage, raw: &str) -> Option<ParsedRelayCommand> {
        let cmd = match msg.kind.as_str() {
            "spawn" => {
                let (Some(name), Some(cli)) = (msg.name, msg.cli) else {
                    warn!("File spawn from {} missing name or cli", self.agent_name);
                    return None;
                };
                ParsedRelayCommand::new_spawn(
                    self.agent_name.clone(),
                    name,
                    cli,
                    msg.body.unwrap_or_default(),
                    raw.to_string(),
                )
            }
            "release" => {
                let Some(name) = msg.name else {
                    warn!("File release from {} missing name", self.agent_name);
                    return None;
                };
                ParsedRelayCommand::new_release(self.agent_name.clone(), name, raw.to_string())
            }
            _ => {
                let Some(to) = msg.to else {
                    debug!("File message missing 'to' field");
                    return None;
                };
                self.message(to, msg.body.as_deref().unwrap_or_default(), msg.thread, raw)
            }
        };
        Some(match msg.data {
            Some(data) => cmd.with_data(data),
            None => cmd,
        })
    }

    /// Check if the buffer ends with a prompt
    fn check_for_prompt(&self) -> bool {
        let Some(last_line) = self.buffer.lines().last() else {
            return false;
        };
        if self.prompt_pattern.is_match(last_line) {
            return true;
        }
        // lines() drops the trailing newline, so a prompt is only a prompt
        // while the cursor sits on it
        if self.buffer.ends_with('\n') {
            return false;
        }
        let trimmed = last_line.trim_start();
        COMMON_PROMPTS.iter().any(|p| trimmed.ends_with(p))
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.last_parsed_pos = 0;
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Keep roughly the last `max_size` bytes
    pub fn truncate_buffer(&mut self, max_size: usize) {
        if self.buffer.len() <= max_size {
            return;
        }
        let target = self.buffer.len() - max_size;
        let start = (target..=self.buffer.len())
            .find(|&i| self.buffer.is_char_boundary(i))
            .unwrap_or(self.buffer.len());
        self.buffer.drain(..start);
        self.last_parsed_pos = self.last_parsed_pos.saturating_sub(start);
    }
}

static DEFAULT_PROMPT_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Result of parsing output
#[derive(Debug, Default)]
pub struct ParseResult {
    pub commands: Vec<ParsedRelayCommand>,
    pub continuity_commands: Vec<ContinuityCommand>,
    /// Last line looks like a prompt
    pub prompt_detected: bool,
    /// `->pty:ready` was printed
    pub ready_signal: bool,
}

impl ParseResult {
    /// Whether the output hints that the agent waits for input
    pub fn is_ready(&self) -> bool {
        self.prompt_detected || self.ready_signal
    }
}

/// Strip ANSI escape sequences from text
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").into_owned()
}

/// Sanitize JSON that was written by shell commands
/// Fixes common issues:
/// 1. Literal newlines in strings -> \n escape
/// 2. Invalid bash escapes like \! -> just the character
fn sanitize_json_from_shell(json: &str) -> String {
    let mut result = String::with_capacity(json.len());
    let mut in_string = false;
    let mut chars = json.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                result.push(c);
                in_string = !in_string;
            }
            '\\' if in_string => match chars.peek().copied() {
                // Valid JSON escape: keep it and its escaped char together
                Some(next @ ('"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u')) => {
                    chars.next();
                    result.push(c);
                    result.push(next);
                }
                // Shell-only escape: drop the backslash
                Some(
                    next @ ('!' | '[' | ']' | '(' | ')' | '{' | '}' | '$' | '`' | '\'' | ' '
                    | '*' | '?' | '#' | '~' | '=' | '%' | '^' | '&' | ';' | '|' | '<' | '>'),
                ) => {
                    chars.next();
                    result.push(next);
                }
                _ => result.push(c),
            },
            '\n' if in_string => result.push_str("\\n"),
            '\r' if in_string => result.push_str("\\r"),
            '\t' if in_string => result.push_str("\\t"),
            _ => result.push(c),
        }
    }

    result
}

/// Remove control characters other than newline and tab
pub fn sanitize_for_injection(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}
