//! PTY (pseudo-terminal) management for the wrapped agent.
//!
//! Provides:
//! - Spawning the agent CLI behind a PTY
//! - Async output/input channels backed by reader and writer threads
//! - Terminal passthrough helpers (raw mode, resize)
//! - `PtyBackend`, the injection backend that types into the PTY

use crate::inject::AgentBackend;
use crate::parser::sanitize_for_injection;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, execvp, fork, setsid, write, ForkResult, Pid};
use std::ffi::CString;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Delay between typing a message and pressing Enter
pub const DEFAULT_ENTER_DELAY: Duration = Duration::from_millis(200);

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

/// Terminal settings before raw mode, restored on exit
static ORIGINAL_TERMIOS: OnceLock<libc::termios> = OnceLock::new();

/// Freshly spawned child behind a PTY master
pub struct Pty {
    master_fd: OwnedFd,
    child_pid: Pid,
}

impl Pty {
    /// Spawn `command` behind a new PTY.
    /// `rows`/`cols` override terminal detection (headless mode).
    pub fn spawn(command: &[String], rows: Option<u16>, cols: Option<u16>) -> Result<Self> {
        if command.is_empty() {
            anyhow::bail!("Command cannot be empty");
        }
        // Built before fork: the child must not allocate
        let args = command
            .iter()
            .map(|s| CString::new(s.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .context("Command contains a NUL byte")?;

        let winsize = match (rows, cols) {
            (Some(r), Some(c)) => winsize(r, c),
            _ => terminal_size()
                .map(|(r, c)| winsize(r, c))
                .unwrap_or_else(|| winsize(DEFAULT_ROWS, DEFAULT_COLS)),
        };

        let OpenptyResult { master, slave } =
            openpty(&winsize, None).context("Failed to open PTY")?;

        match unsafe { fork() }.context("Failed to fork")? {
            ForkResult::Parent { child } => {
                drop(slave);

                let flags = OFlag::from_bits_truncate(fcntl(master.as_raw_fd(), FcntlArg::F_GETFL)?);
                fcntl(
                    master.as_raw_fd(),
                    FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
                )?;

                info!("Spawned {} with PID {}", command[0], child);
                Ok(Self {
                    master_fd: master,
                    child_pid: child,
                })
            }
            ForkResult::Child => {
                drop(master);
                let _ = setsid();

                let slave_raw = slave.as_raw_fd();
                unsafe {
                    libc::ioctl(slave_raw, libc::TIOCSCTTY as libc::c_ulong, 0);
                }
                let _ = dup2(slave_raw, libc::STDIN_FILENO);
                let _ = dup2(slave_raw, libc::STDOUT_FILENO);
                let _ = dup2(slave_raw, libc::STDERR_FILENO);
                if slave_raw > 2 {
                    drop(slave);
                }

                let _ = execvp(&args[0], &args);
                // Only reached when exec failed
                unsafe { libc::_exit(127) }
            }
        }
    }

    pub fn child_pid(&self) -> Pid {
        self.child_pid
    }

    /// Whether stdin is a TTY
    pub fn is_tty() -> bool {
        unsafe { libc::isatty(libc::STDIN_FILENO) != 0 }
    }

    /// Put stdin in raw mode for transparent passthrough.
    /// Returns Ok(false) when stdin is not a TTY (headless mode).
    pub fn set_raw_mode() -> Result<bool> {
        if !Self::is_tty() {
            debug!("stdin is not a TTY, skipping raw mode (headless mode)");
            return Ok(false);
        }

        let stdin_fd = libc::STDIN_FILENO;
        let mut termios: libc::termios = unsafe { std::mem::zeroed() };
        if unsafe { libc::tcgetattr(stdin_fd, &mut termios) } != 0 {
            anyhow::bail!("Failed to get terminal attributes");
        }
        let _ = ORIGINAL_TERMIOS.set(termios);

        let mut raw = termios;
        raw.c_lflag &= !(libc::ECHO | libc::ICANON | libc::ISIG | libc::IEXTEN);
        raw.c_iflag &= !(libc::IXON | libc::ICRNL);
        raw.c_oflag &= !libc::OPOST;
        if unsafe { libc::tcsetattr(stdin_fd, libc::TCSANOW, &raw) } != 0 {
            anyhow::bail!("Failed to set raw mode");
        }

        debug!("Terminal set to raw mode");
        Ok(true)
    }

    /// Restore the terminal settings saved by `set_raw_mode`
    pub fn restore_terminal() {
        if let Some(termios) = ORIGINAL_TERMIOS.get() {
            unsafe {
                libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, termios);
            }
            debug!("Terminal restored");
        }
    }
}

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Size of the controlling terminal as (rows, cols)
pub fn terminal_size() -> Option<(u16, u16)> {
    let mut ws = winsize(0, 0);
    let ok = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) } == 0;
    (ok && ws.ws_row > 0 && ws.ws_col > 0).then_some((ws.ws_row, ws.ws_col))
}

/// Async PTY wrapper for use with tokio.
///
/// Blocking reads and writes run on dedicated threads; the rest of the
/// wrapper sees two channels.
pub struct AsyncPty {
    output_rx: mpsc::Receiver<Vec<u8>>,
    input_tx: mpsc::Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
    child_pid: Pid,
    /// Keeps the master open; reader and writer threads borrow its raw fd
    master: OwnedFd,
    exit_code: Option<i32>,
}

impl AsyncPty {
    pub fn new(pty: Pty) -> Self {
        let Pty {
            master_fd,
            child_pid,
        } = pty;
        let running = Arc::new(AtomicBool::new(true));
        let fd = master_fd.as_raw_fd();

        let (output_tx, output_rx) = mpsc::channel(64);
        let (input_tx, input_rx) = mpsc::channel(64);

        let reader_running = Arc::clone(&running);
        std::thread::spawn(move || reader_thread(fd, reader_running, output_tx));

        let writer_running = Arc::clone(&running);
        std::thread::spawn(move || writer_thread(fd, writer_running, input_rx));

        Self {
            output_rx,
            input_tx,
            running,
            child_pid,
            master: master_fd,
            exit_code: None,
        }
    }

    /// Next output chunk; None once the child closed the terminal
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.output_rx.recv().await
    }

    pub async fn send(&self, data: Vec<u8>) -> Result<()> {
        self.input_tx
            .send(data)
            .await
            .map_err(|_| anyhow::anyhow!("PTY channel closed"))
    }

    /// Injection backend writing into this PTY
    pub fn backend(&self, enter_delay: Duration) -> PtyBackend {
        PtyBackend::new(
            self.input_tx.clone(),
            Some(self.child_pid.as_raw() as u32),
            enter_delay,
        )
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn child_pid(&self) -> Pid {
        self.child_pid
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let ws = winsize(rows, cols);
        if unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) } < 0 {
            anyhow::bail!("Failed to resize PTY");
        }
        debug!("PTY resized to {}x{}", cols, rows);
        Ok(())
    }

    pub fn signal(&self, sig: Signal) -> Result<()> {
        signal::kill(self.child_pid, sig)?;
        Ok(())
    }

    /// Reap the child if it exited; returns its exit code (128+N for signal N)
    pub fn try_wait(&mut self) -> Option<i32> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }
        let code = match waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => Some(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => Some(128 + sig as i32),
            Ok(_) => None,
            Err(nix::errno::Errno::ECHILD) => Some(-1),
            Err(e) => {
                warn!("waitpid failed: {}", e);
                None
            }
        };
        if code.is_some() {
            self.running.store(false, Ordering::SeqCst);
            self.exit_code = code;
        }
        code
    }

    /// Terminate the child (SIGTERM, then SIGKILL after 2s) and reap it.
    pub fn shutdown(&mut self) -> Option<i32> {
        self.running.store(false, Ordering::SeqCst);
        if self.try_wait().is_some() {
            return self.exit_code;
        }
        let _ = self.signal(Signal::SIGTERM);

        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            if self.try_wait().is_some() {
                return self.exit_code;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        warn!("Child {} ignored SIGTERM, killing", self.child_pid);
        let _ = self.signal(Signal::SIGKILL);
        self.exit_code = match waitpid(self.child_pid, None) {
            Ok(WaitStatus::Exited(_, code)) => Some(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => Some(128 + sig as i32),
            _ => Some(-1),
        };
        self.exit_code
    }
}

impl Drop for AsyncPty {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reader_thread(fd: RawFd, running: Arc<AtomicBool>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 4096];
    while running.load(Ordering::SeqCst) {
        match nix::unistd::read(fd, &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(nix::errno::Errno::EAGAIN) => {
                std::thread::sleep(Duration::from_millis(10));
            }
            // Child closed the terminal
            Err(nix::errno::Errno::EIO) => break,
            Err(e) => {
                error!("PTY read error: {}", e);
                break;
            }
        }
    }
    running.store(false, Ordering::SeqCst);
    debug!("Reader thread exiting");
}

fn writer_thread(fd: RawFd, running: Arc<AtomicBool>, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = rx.blocking_recv() {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let mut written = 0;
        while written < data.len() {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            match write(borrowed, &data[written..]) {
                Ok(n) => written += n,
                Err(nix::errno::Errno::EAGAIN) => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    error!("PTY write error: {}", e);
                    break;
                }
            }
        }
    }
    debug!("Writer thread exiting");
}

/// Types injected messages into the agent's PTY: text, a short pause, Enter.
#[derive(Clone)]
pub struct PtyBackend {
    input: mpsc::Sender<Vec<u8>>,
    pid: Option<u32>,
    enter_delay: Duration,
}

impl PtyBackend {
    pub fn new(input: mpsc::Sender<Vec<u8>>, pid: Option<u32>, enter_delay: Duration) -> Self {
        Self {
            input,
            pid,
            enter_delay,
        }
    }
}

impl AgentBackend for PtyBackend {
    fn requires_verification(&self) -> bool {
        true
    }

    fn perform_injection<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let text = sanitize_for_injection(text);
            self.input
                .send(text.into_bytes())
                .await
                .map_err(|_| anyhow::anyhow!("PTY input closed"))?;
            tokio::time::sleep(self.enter_delay).await;
            self.input
                .send(b"\r".to_vec())
                .await
                .map_err(|_| anyhow::anyhow!("PTY input closed"))?;
            Ok(())
        })
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }
}
