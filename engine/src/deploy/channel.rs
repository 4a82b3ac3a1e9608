//! Command execution channel
//!
//! A channel runs one command at a time against the target, streams its output
//! line by line into a [`LineSink`] and enforces a deadline. The process
//! plumbing shared by the ssh and local channels lives in [`supervise`].

use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::models::report::Stream;
use crate::storage::settings::ExecutionSettings;

/// Exit code reported when the deadline expires
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when the command is aborted
pub const ABORT_EXIT_CODE: i32 = 130;

/// One line of command output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub line: String,
    pub at: DateTime<Utc>,
}

impl OutputLine {
    pub fn new(stream: Stream, line: impl Into<String>) -> Self {
        Self {
            stream,
            line: line.into(),
            at: Utc::now(),
        }
    }
}

/// Receives output lines in arrival order
#[async_trait]
pub trait LineSink: Send {
    async fn accept(&mut self, line: OutputLine);
}

#[async_trait]
impl LineSink for Vec<OutputLine> {
    async fn accept(&mut self, line: OutputLine) {
        self.push(line);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Timeout,
    Aborted,
}

/// How a command run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub cancelled: bool,
    pub cancel_reason: Option<CancelReason>,
}

impl ExecOutcome {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            cancelled: false,
            cancel_reason: None,
        }
    }

    pub fn cancelled(reason: CancelReason) -> Self {
        let exit_code = match reason {
            CancelReason::Timeout => TIMEOUT_EXIT_CODE,
            CancelReason::Aborted => ABORT_EXIT_CODE,
        };
        Self {
            exit_code,
            cancelled: true,
            cancel_reason: Some(reason),
        }
    }

    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The target could not be reached or the connection dropped
    #[error("connection to target failed: {0}")]
    Connection(String),

    /// The local client process could not be started
    #[error("unable to start command: {0}")]
    Spawn(String),

    #[error("invalid command request: {0}")]
    Invalid(String),
}

impl From<ChannelError> for EngineError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Invalid(msg) => EngineError::ValidationError(msg),
            other => EngineError::ChannelError(other.to_string()),
        }
    }
}

/// Executes commands on the target host
#[async_trait]
pub trait Channel: Send + Sync {
    /// Run `command`, forwarding every output line to `sink` before returning.
    ///
    /// The command is terminated when `timeout` elapses or `cancel` fires; the
    /// outcome then carries a synthetic exit code and `cancelled = true`.
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        sink: &mut dyn LineSink,
    ) -> Result<ExecOutcome, ChannelError>;

    /// Release any connection held for the session
    async fn close(&self) {}

    fn describe(&self) -> String;
}

/// Tuning shared by the process-backed channels
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub line_buffer_capacity: usize,
    pub drain_timeout: Duration,
    pub kill_grace: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            line_buffer_capacity: 256,
            drain_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_secs(2),
        }
    }
}

impl ChannelOptions {
    pub fn from_settings(execution: &ExecutionSettings, kill_grace_secs: u64) -> Self {
        Self {
            line_buffer_capacity: execution.line_buffer_capacity.max(1),
            drain_timeout: execution.drain_timeout(),
            kill_grace: Duration::from_secs(kill_grace_secs),
        }
    }
}

pub fn check_timeout(timeout: Duration) -> Result<(), ChannelError> {
    if timeout.is_zero() {
        return Err(ChannelError::Invalid("timeout must be greater than zero".to_string()));
    }
    Ok(())
}

/// Process-specific part of [`supervise`]
#[async_trait]
pub trait Terminator: Send {
    /// Inspect a line before it reaches the sink; `false` hides it
    fn observe(&mut self, _line: &OutputLine) -> bool {
        true
    }

    /// Stop the command and everything it started
    async fn terminate(&mut self, child: &mut Child);
}

/// Result of a supervised child process
#[derive(Debug)]
pub struct Supervised {
    pub status: Option<ExitStatus>,
    pub cancel_reason: Option<CancelReason>,
}

impl Supervised {
    pub fn outcome(&self) -> ExecOutcome {
        match (self.cancel_reason, self.status) {
            (Some(reason), _) => ExecOutcome::cancelled(reason),
            (None, Some(status)) => ExecOutcome::exited(exit_code(&status)),
            (None, None) => ExecOutcome::exited(-1),
        }
    }
}

/// Exit code of a finished process, `128 + signal` when killed by a signal
pub fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Drive a spawned child to completion while streaming its output.
///
/// stdout and stderr are read by two tasks feeding one bounded channel, so the
/// sink sees lines interleaved in arrival order. Readers are drained and joined
/// before this returns.
pub async fn supervise(
    mut child: Child,
    timeout: Duration,
    cancel: &CancellationToken,
    sink: &mut dyn LineSink,
    options: &ChannelOptions,
    terminator: &mut dyn Terminator,
) -> Result<Supervised, ChannelError> {
    let (tx, mut rx) = mpsc::channel::<OutputLine>(options.line_buffer_capacity.max(1));
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, Stream::Primary, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, Stream::Error, tx.clone()));
    }
    drop(tx);

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut status = None;
    let mut cancel_reason = None;
    loop {
        tokio::select! {
            Some(line) = rx.recv() => {
                if terminator.observe(&line) {
                    sink.accept(line).await;
                }
            }
            result = child.wait() => {
                status = Some(result.map_err(|e| ChannelError::Spawn(e.to_string()))?);
                break;
            }
            _ = &mut deadline => {
                cancel_reason = Some(CancelReason::Timeout);
                break;
            }
            _ = cancel.cancelled() => {
                cancel_reason = Some(CancelReason::Aborted);
                break;
            }
        }
    }

    if let Some(reason) = cancel_reason {
        debug!("Terminating command ({:?})", reason);
        terminator.terminate(&mut child).await;
        match tokio::time::timeout(options.drain_timeout, child.wait()).await {
            Ok(Ok(exit)) => status = Some(exit),
            Ok(Err(e)) => warn!("Unable to reap terminated command: {}", e),
            Err(_) => {
                warn!("Command did not exit after termination, killing client");
                let _ = child.start_kill();
            }
        }
    }

    // Output written just before exit is still in flight
    let drain = async {
        while let Some(line) = rx.recv().await {
            if terminator.observe(&line) {
                sink.accept(line).await;
            }
        }
    };
    if tokio::time::timeout(options.drain_timeout, drain).await.is_err() {
        warn!("Output still open after {:?}, detaching readers", options.drain_timeout);
        for reader in &readers {
            reader.abort();
        }
    }
    for reader in readers {
        let _ = reader.await;
    }

    Ok(Supervised {
        status,
        cancel_reason,
    })
}

fn spawn_reader<R>(reader: R, stream: Stream, tx: mpsc::Sender<OutputLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    let line = OutputLine::new(stream, String::from_utf8_lossy(&buf));
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Output reader stopped: {}", e);
                    break;
                }
            }
        }
    })
}
