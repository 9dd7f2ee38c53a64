//! relay-agent: wraps an agent CLI in a PTY and connects it to the relay.
//!
//! Usage:
//!   relay-agent --name myagent --relay /tmp/agent-relay.sock -- claude --model opus

use anyhow::{Context, Result};
use clap::Parser;
use relay_agent::config::{ConnectionConfig, IdleConfig, InjectionConfig, StuckConfig};
use relay_agent::protocol::FramingMode;
use relay_agent::pty::{terminal_size, AsyncPty, Pty, DEFAULT_ENTER_DELAY};
use relay_agent::transport::TransportAddr;
use relay_agent::{AgentSession, Config, RelayClient};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Cursor position query some CLIs block on until answered
const CURSOR_QUERIES: [&str; 2] = ["\x1b[6n", "\x1b[?6n"];
/// Reply with the cursor at (1, 1)
const CURSOR_REPLY: &[u8] = b"\x1b[1;1R";

/// Connect an agent CLI to the agent relay
#[derive(Parser, Debug)]
#[command(name = "relay-agent")]
#[command(about = "Relay connection and reliable message injection for agent CLIs")]
#[command(version)]
struct Args {
    /// Agent name announced to the relay
    #[arg(short, long, env = "AGENT_RELAY_NAME")]
    name: String,

    /// Relay address: socket path, unix://PATH or tcp://HOST:PORT
    #[arg(short, long, env = "AGENT_RELAY_SOCKET", default_value = "/tmp/agent-relay.sock")]
    relay: String,

    /// Use the 5-byte frame header (length + format byte)
    #[arg(long)]
    modern_framing: bool,

    /// Regex pattern to detect the agent's prompt
    #[arg(long, default_value = r"^[>$%#❯] ?$")]
    prompt_pattern: String,

    /// Milliseconds of silence before output counts towards idle
    #[arg(long, default_value = "1500")]
    idle_timeout: u64,

    /// Maximum queued messages before new ones are rejected
    #[arg(long, default_value = "50")]
    queue_max: usize,

    /// Injection attempts per message
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Linear retry backoff unit in milliseconds
    #[arg(long, default_value = "300")]
    retry_delay: u64,

    /// Do not wait for the injected text to show up in the output
    #[arg(long)]
    skip_verification: bool,

    /// Do not tell senders about messages that could not be injected
    #[arg(long)]
    no_failure_notice: bool,

    /// Seconds without output before the agent is reported stuck
    #[arg(long, default_value = "600")]
    stuck_timeout: u64,

    /// Give up reconnecting after this many attempts
    #[arg(long, default_value = "10")]
    max_reconnect_attempts: u32,

    /// Emit parsed commands and pipeline events as JSON lines on stderr
    #[arg(long)]
    json_output: bool,

    /// Log level or filter (error, warn, info, debug, trace, relay_agent=debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Terminal rows (headless mode)
    #[arg(long)]
    rows: Option<u16>,

    /// Terminal columns (headless mode)
    #[arg(long)]
    cols: Option<u16>,

    /// Tee agent output into this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Outbox directory for ->relay-file: commands
    #[arg(long)]
    outbox: Option<PathBuf>,

    /// Directory for continuity summaries
    #[arg(long, env = "AGENT_RELAY_CONTINUITY_DIR")]
    continuity_dir: Option<PathBuf>,

    /// Command to run (after --)
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

impl Args {
    fn into_config(self) -> Config {
        let cli = self
            .command
            .first()
            .map(|c| Path::new(c).file_name().map_or(c.clone(), |n| n.to_string_lossy().into_owned()));
        let working_directory = std::env::current_dir()
            .ok()
            .map(|d| d.to_string_lossy().into_owned());

        Config {
            connection: ConnectionConfig {
                agent_name: self.name,
                entity_type: Some("agent".to_string()),
                cli,
                working_directory,
                address: TransportAddr::parse(&self.relay),
                framing: if self.modern_framing {
                    FramingMode::Modern
                } else {
                    FramingMode::Legacy
                },
                max_reconnect_attempts: self.max_reconnect_attempts,
                ..Default::default()
            },
            idle: IdleConfig {
                min_silence: Duration::from_millis(self.idle_timeout),
                prompt_pattern: self.prompt_pattern,
                ..Default::default()
            },
            stuck: StuckConfig {
                extended_idle: Duration::from_secs(self.stuck_timeout),
                ..Default::default()
            },
            injection: InjectionConfig {
                queue_max: self.queue_max,
                max_attempts: self.max_attempts,
                retry_backoff: Duration::from_millis(self.retry_delay),
                skip_verification: self.skip_verification,
                notify_on_failure: !self.no_failure_notice,
                ..Default::default()
            },
            outbox: self.outbox,
            continuity_dir: self.continuity_dir,
            json_output: self.json_output,
            command: self.command,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let (rows, cols) = (args.rows, args.cols);
    let log_path = args.log_file.clone();
    let config = args.into_config();

    info!("relay-agent v{}", env!("CARGO_PKG_VERSION"));
    info!("Agent: {}", config.agent_name());
    info!("Relay: {}", config.connection.address);
    info!("Command: {:?}", config.command);

    let mut log_file = log_path.as_deref().map(open_log_file).transpose()?;

    let pty = Pty::spawn(&config.command, rows, cols).context("Failed to spawn agent")?;
    let interactive = Pty::set_raw_mode().context("Failed to set raw mode")?;
    info!(
        "Running in {} mode",
        if interactive { "interactive (TTY)" } else { "headless (no TTY)" }
    );
    let mut async_pty = AsyncPty::new(pty);

    let client = RelayClient::new(config.connection.clone());
    let backend = Arc::new(async_pty.backend(DEFAULT_ENTER_DELAY));
    let mut session = AgentSession::new(config, client.clone(), backend);
    session.start();
    if let Err(e) = client.connect().await {
        error!("Relay client unavailable: {}", e);
    }

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigwinch = signal(SignalKind::window_change())?;
    let mut stdin_rx = spawn_stdin_reader();
    let mut stdout = tokio::io::stdout();
    let mut child_watchdog = tokio::time::interval(Duration::from_secs(1));

    loop {
        select! {
            _ = sigint.recv() => {
                debug!("SIGINT received, forwarding to agent");
                let _ = async_pty.signal(nix::sys::signal::Signal::SIGINT);
            }

            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break;
            }

            _ = sigwinch.recv() => {
                if let Some((rows, cols)) = terminal_size() {
                    if let Err(e) = async_pty.resize(rows, cols) {
                        warn!("Resize failed: {}", e);
                    }
                }
            }

            Some(data) = stdin_rx.recv() => {
                if let Err(e) = async_pty.send(data).await {
                    error!("Failed to send to PTY: {}", e);
                }
            }

            output = async_pty.recv() => {
                let Some(data) = output else {
                    info!("PTY closed");
                    break;
                };

                let text = String::from_utf8_lossy(&data);
                if CURSOR_QUERIES.iter().any(|q| text.contains(q)) {
                    debug!("Answering cursor position query");
                    if let Err(e) = async_pty.send(CURSOR_REPLY.to_vec()).await {
                        warn!("Failed to answer cursor position query: {}", e);
                    }
                }

                stdout.write_all(&data).await?;
                stdout.flush().await?;

                if let Some(file) = log_file.as_mut() {
                    if let Err(e) = file.write_all(&data) {
                        warn!("Log file write failed, disabling: {}", e);
                        log_file = None;
                    }
                }

                session.on_output(&data);
            }

            _ = child_watchdog.tick() => {
                if let Some(code) = async_pty.try_wait() {
                    info!("Agent exited with code {}", code);
                    break;
                }
            }
        }
    }

    info!("Shutting down...");
    session.shutdown().await;
    client.destroy().await;
    let exit_code = async_pty.shutdown();
    Pty::restore_terminal();
    info!("Goodbye!");

    if let Some(code) = exit_code.filter(|c| *c > 0) {
        std::process::exit(code);
    }
    Ok(())
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("Failed to create log directory {:?}: {}", parent, e);
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;
    info!("Logging output to: {}", path.display());
    Ok(file)
}

/// Blocking stdin reader; stdin has no async form that works in raw mode
fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(32);
    std::thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}
