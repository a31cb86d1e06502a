//! Newline-delimited transport over stdio or a child process's pipes

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{check_outgoing, Transport, TransportError, TransportStatistics};
use crate::config::{ServerConfig, DEFAULT_MAX_MESSAGE_SIZE};
use crate::protocol::codec;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone)]
pub struct StdioConfig {
    pub max_message_size: usize,
    pub queue_capacity: usize,
    /// Time a child gets to exit after SIGTERM before it is killed
    pub grace_period: Duration,
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            queue_capacity: 1000,
            grace_period: Duration::from_secs(5),
        }
    }
}

impl From<&ServerConfig> for StdioConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            queue_capacity: config.queue_capacity,
            grace_period: config.process_grace(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: Option<u32>,
    pub command: Option<String>,
    pub state: ProcessState,
    pub started_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub statistics: TransportStatistics,
}

struct Shared {
    state: RwLock<ProcessState>,
    stats: Mutex<TransportStatistics>,
    exit_code: Mutex<Option<i32>>,
}

impl Shared {
    fn set_state(&self, state: ProcessState) {
        *self.state.write() = state;
    }

    fn fail(&self, err: &dyn std::fmt::Display) {
        self.stats.lock().record_error(err);
        self.set_state(ProcessState::Error);
    }
}

/// One frame cut from the byte stream
#[derive(Debug, PartialEq)]
enum Frame {
    Line(String),
    Oversize(usize),
    InvalidUtf8,
}

/// Splits a byte stream on `\n`, discarding lines longer than `max`.
///
/// Only the bytes of each push are searched for the delimiter, so a line
/// arriving in many small reads is scanned once.
struct LineBuffer {
    buf: Vec<u8>,
    max: usize,
    discarding: bool,
}

impl LineBuffer {
    fn new(max: usize) -> Self {
        Self {
            buf: Vec::new(),
            max,
            discarding: false,
        }
    }

    fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut rest = data;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = (&rest[..pos], &rest[pos + 1..]);
            rest = tail;
            if self.discarding {
                self.discarding = false;
                continue;
            }
            self.buf.extend_from_slice(head);
            let line = std::mem::take(&mut self.buf);
            frames.push(self.frame(&line));
        }

        if !self.discarding {
            self.buf.extend_from_slice(rest);
        }
        if self.buf.len() > self.max {
            if !self.discarding {
                frames.push(Frame::Oversize(self.buf.len()));
            }
            self.buf.clear();
            self.discarding = true;
        }
        frames
    }

    /// Flush a trailing line that never got its newline
    fn finish(&mut self) -> Option<Frame> {
        if self.discarding || self.buf.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buf);
        Some(self.frame(&line))
    }

    fn frame(&self, line: &[u8]) -> Frame {
        if line.len() > self.max {
            return Frame::Oversize(line.len());
        }
        match std::str::from_utf8(line) {
            Ok(text) => Frame::Line(text.trim().to_string()),
            Err(_) => Frame::InvalidUtf8,
        }
    }
}

/// Newline-framed JSON-RPC transport.
///
/// Built over the process's own stdin/stdout, a spawned child's pipes, or
/// any reader/writer pair. Inbound lines are validated before they reach
/// the bounded queue drained by [`Transport::receive`].
pub struct StdioTransport {
    config: StdioConfig,
    shared: Arc<Shared>,
    reader: Mutex<Option<BoxedReader>>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    inbound_tx: Mutex<Option<mpsc::Sender<String>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    pid: Option<u32>,
    command: Option<String>,
    started_at: DateTime<Utc>,
}

impl StdioTransport {
    /// Transport over this process's stdin and stdout
    pub fn stdio(config: StdioConfig) -> Self {
        Self::from_streams(tokio::io::stdin(), tokio::io::stdout(), config)
    }

    /// Frame an arbitrary reader/writer pair, e.g. one half of a duplex in tests
    pub fn from_streams<R, W>(reader: R, writer: W, config: StdioConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::build(Box::new(reader), Box::new(writer), config, None, None)
    }

    /// Spawn `command` and talk to it over its stdin/stdout. Its stderr is
    /// forwarded to the log. Must be called inside a tokio runtime.
    pub fn spawn(
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
        config: StdioConfig,
    ) -> Result<Self, TransportError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Spawn(format!("{}: {}", command, e)))?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("stdout was not captured".to_string()))?;
        let stderr = child.stderr.take();

        info!(pid = ?pid, command, "Spawned process");
        let transport = Self::build(
            Box::new(stdout),
            Box::new(stdin),
            config,
            Some(child),
            Some(command.to_string()),
        );
        if let Some(stderr) = stderr {
            transport
                .tasks
                .lock()
                .push(tokio::spawn(forward_stderr(stderr, pid)));
        }
        Ok(transport)
    }

    fn build(
        reader: BoxedReader,
        writer: BoxedWriter,
        config: StdioConfig,
        child: Option<Child>,
        command: Option<String>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let pid = child.as_ref().and_then(Child::id);
        Self {
            config,
            shared: Arc::new(Shared {
                state: RwLock::new(ProcessState::Starting),
                stats: Mutex::new(TransportStatistics::default()),
                exit_code: Mutex::new(None),
            }),
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
            tasks: Mutex::new(Vec::new()),
            child: tokio::sync::Mutex::new(child),
            pid,
            command,
            started_at: Utc::now(),
        }
    }

    pub fn state(&self) -> ProcessState {
        *self.shared.state.read()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            command: self.command.clone(),
            state: self.state(),
            started_at: self.started_at,
            exit_code: *self.shared.exit_code.lock(),
            statistics: self.statistics(),
        }
    }

    /// Wait for the child to exit and return its exit code. `None` when the
    /// transport has no child or it was killed by a signal.
    pub async fn wait(&self) -> Result<Option<i32>, TransportError> {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return Ok(*self.shared.exit_code.lock());
        };
        let status = child.wait().await?;
        *self.shared.exit_code.lock() = status.code();
        info!(pid = ?self.pid, code = ?status.code(), "Process exited");
        Ok(status.code())
    }

    /// SIGTERM the child, then SIGKILL it if it outlives the grace period
    async fn stop_child(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        if let Err(e) = terminate(&mut child) {
            warn!(pid = ?self.pid, error = %e, "Failed to signal process");
        }
        let code = match tokio::time::timeout(self.config.grace_period, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                warn!(pid = ?self.pid, error = %e, "Failed to wait for process");
                None
            }
            Err(_) => {
                warn!(
                    pid = ?self.pid,
                    grace = ?self.config.grace_period,
                    "Process did not exit in time, killing"
                );
                if let Err(e) = child.kill().await {
                    error!(pid = ?self.pid, error = %e, "Failed to kill process");
                }
                None
            }
        };
        *self.shared.exit_code.lock() = code;
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // Already reaped
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = i32::try_from(pid).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        match self.state() {
            ProcessState::Running => return Ok(()),
            ProcessState::Starting => {}
            _ => return Err(TransportError::Closed),
        }
        let reader = self.reader.lock().take();
        let tx = self.inbound_tx.lock().take();
        let (Some(reader), Some(tx)) = (reader, tx) else {
            return Err(TransportError::Closed);
        };

        self.shared.set_state(ProcessState::Running);
        let handle = tokio::spawn(read_loop(
            reader,
            tx,
            Arc::clone(&self.shared),
            self.config.max_message_size,
        ));
        self.tasks.lock().push(handle);
        info!(pid = ?self.pid, "Stdio transport running");
        Ok(())
    }

    async fn send(&self, message: &str) -> Result<(), TransportError> {
        check_outgoing(message, self.config.max_message_size, true)?;
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        let written = async {
            writer.write_all(message.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                self.shared.stats.lock().record_sent(message.len() + 1);
                debug!(bytes = message.len(), "Sent frame");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Write failed");
                self.shared.fail(&e);
                Err(e.into())
            }
        }
    }

    async fn receive(&self) -> Option<String> {
        self.inbound_rx.lock().await.recv().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut state = self.shared.state.write();
            if *state != ProcessState::Stopped {
                *state = ProcessState::Stopping;
            }
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "Writer shutdown failed");
            }
        }
        self.stop_child().await;

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.inbound_tx.lock().take();
        self.shared.set_state(ProcessState::Stopped);
        info!(pid = ?self.pid, "Stdio transport stopped");
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.state() == ProcessState::Running
    }

    fn statistics(&self) -> TransportStatistics {
        self.shared.stats.lock().clone()
    }
}

async fn read_loop(
    mut reader: BoxedReader,
    tx: mpsc::Sender<String>,
    shared: Arc<Shared>,
    max_message_size: usize,
) {
    let mut buffer = LineBuffer::new(max_message_size);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let (frames, eof) = match reader.read(&mut chunk).await {
            Ok(0) => (buffer.finish().into_iter().collect::<Vec<_>>(), true),
            Ok(n) => (buffer.push(&chunk[..n]), false),
            Err(e) => {
                error!(error = %e, "Read failed");
                shared.fail(&e);
                return;
            }
        };

        for frame in frames {
            if !enqueue(frame, &tx, &shared).await {
                return;
            }
        }
        if eof {
            break;
        }
    }

    debug!("Input closed");
    let mut state = shared.state.write();
    if *state == ProcessState::Running {
        *state = ProcessState::Stopped;
    }
}

/// Validate and queue one frame. Returns false once the consumer is gone.
async fn enqueue(frame: Frame, tx: &mpsc::Sender<String>, shared: &Shared) -> bool {
    let line = match frame {
        Frame::Line(line) if line.is_empty() => return true,
        Frame::Line(line) => line,
        Frame::Oversize(size) => {
            warn!(size, "Dropping oversized frame");
            shared.stats.lock().record_error(format!("frame of {} bytes exceeds limit", size));
            return true;
        }
        Frame::InvalidUtf8 => {
            warn!("Dropping frame with invalid UTF-8");
            shared.stats.lock().record_error("invalid UTF-8");
            return true;
        }
    };

    if let Err(e) = codec::validate_message(&line) {
        warn!(error = %e.message, "Dropping malformed frame");
        shared.stats.lock().record_error(&e.message);
        return true;
    }

    shared.stats.lock().record_received(line.len());
    tx.send(line).await.is_ok()
}

async fn forward_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(pid = ?pid, "stderr: {}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(pid = ?pid, error = %e, "stderr closed");
                break;
            }
        }
    }
}
