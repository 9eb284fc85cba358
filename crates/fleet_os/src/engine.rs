//! Execution engine: runs one command over a leased session.
//!
//! Enforces the wall-clock timeout, bounds captured output per stream and
//! forwards output to an observer as it arrives.

use crate::pool::Lease;
use crate::{ExecExit, OutputChunk};
use fleet_core::config::ExecutionConfig;
use fleet_core::{FleetError, OutputStream, Server};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Receives output while a command runs.
pub trait OutputObserver: Send + Sync {
    fn on_output(&self, stream: OutputStream, text: &str);
}

/// Discards output.
impl OutputObserver for () {
    fn on_output(&self, _stream: OutputStream, _text: &str) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Exited(i32),
    TimedOut,
    /// Stopped on request before it finished.
    Killed,
    /// The session broke mid-run.
    Lost(String),
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub outcome: ExecutionOutcome,
    pub stdout: String,
    pub stderr: String,
    /// Either stream hit the capture bound.
    pub truncated: bool,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn exit_code(&self) -> Option<i32> {
        match self.outcome {
            ExecutionOutcome::Exited(code) => Some(code),
            _ => None,
        }
    }
}

/// Bounded capture of one output stream.
struct CaptureBuffer {
    bytes: Vec<u8>,
    limit: usize,
    omitted: usize,
}

impl CaptureBuffer {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            omitted: 0,
        }
    }

    /// Keep what fits and return how many bytes of `data` were kept.
    fn push(&mut self, data: &[u8]) -> usize {
        let room = self.limit.saturating_sub(self.bytes.len());
        let kept = room.min(data.len());
        self.bytes.extend_from_slice(&data[..kept]);
        self.omitted += data.len() - kept;
        kept
    }

    fn finish(self) -> (String, bool) {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.omitted > 0 {
            text.push_str(&format!("\n[output truncated: {} bytes omitted]", self.omitted));
        }
        (text, self.omitted > 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    TimedOut,
    Cancelled,
}

/// Wrap `text` so it runs from the server's working directory, if it has one.
pub fn command_line(server: &Server, text: &str) -> String {
    match server.workdir.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        Some(dir) => format!("cd {} && {}", shell_quote(dir), text),
        None => text.to_string(),
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub struct ExecutionEngine {
    max_output_bytes: usize,
    kill_grace: Duration,
}

impl ExecutionEngine {
    pub fn new(config: &ExecutionConfig) -> Self {
        Self::with_limits(config.max_output_bytes, config.kill_grace())
    }

    pub fn with_limits(max_output_bytes: usize, kill_grace: Duration) -> Self {
        Self {
            max_output_bytes,
            kill_grace,
        }
    }

    /// Run `command` on the lease's session.
    ///
    /// When `timeout` elapses or `cancel` fires, the session is told to kill
    /// the command and gets `kill_grace` to wind down. If it still has not
    /// returned the command is abandoned and the lease poisoned, as it is
    /// whenever the session fails.
    pub async fn execute(
        &self,
        lease: &mut Lease,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        observer: &dyn OutputObserver,
    ) -> ExecutionResult {
        let started = Instant::now();
        let server_id = lease.server_id();
        let holder = lease
            .holder()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "without holder".to_string());
        let mut stdout = CaptureBuffer::new(self.max_output_bytes);
        let mut stderr = CaptureBuffer::new(self.max_output_bytes);

        let (tx, mut rx) = mpsc::channel::<OutputChunk>(64);
        let kill = CancellationToken::new();
        let mut stop = None;
        let mut finished = None;

        match lease.session_mut() {
            Some(session) => {
                let exec = session.exec(command, tx, kill.clone());
                tokio::pin!(exec);
                let deadline = tokio::time::sleep(timeout);
                tokio::pin!(deadline);

                loop {
                    tokio::select! {
                        Some(chunk) = rx.recv() => {
                            capture(&chunk, &mut stdout, &mut stderr, observer);
                        }
                        result = &mut exec => {
                            finished = Some(result);
                            break;
                        }
                        _ = cancel.cancelled(), if stop.is_none() => {
                            tracing::info!("Killing cancelled command: {}", short_label(command));
                            stop = Some(StopReason::Cancelled);
                            kill.cancel();
                            deadline.as_mut().reset(Instant::now() + self.kill_grace);
                        }
                        _ = &mut deadline => {
                            if stop.is_some() {
                                tracing::warn!(
                                    "Command {} did not stop within {:.1}s grace, abandoning its connection to {}",
                                    holder,
                                    self.kill_grace.as_secs_f64(),
                                    server_id
                                );
                                break;
                            }
                            tracing::warn!(
                                "Command timed out after {:.1}s: {}",
                                timeout.as_secs_f64(),
                                short_label(command)
                            );
                            stop = Some(StopReason::TimedOut);
                            kill.cancel();
                            deadline.as_mut().reset(Instant::now() + self.kill_grace);
                        }
                    }
                }
            }
            None => {
                drop(tx);
                finished = Some(Err(anyhow::anyhow!("lease has no session")));
            }
        }

        while let Ok(chunk) = rx.try_recv() {
            capture(&chunk, &mut stdout, &mut stderr, observer);
        }

        let outcome = match (finished, stop) {
            (Some(Ok(_)), Some(StopReason::TimedOut)) => ExecutionOutcome::TimedOut,
            (Some(Ok(ExecExit::Exited(code))), _) => ExecutionOutcome::Exited(code),
            (Some(Ok(ExecExit::Killed)), _) => ExecutionOutcome::Killed,
            (Some(Err(e)), stop) => {
                tracing::warn!("Session failed while running command: {:#}", e);
                lease.poison();
                match stop {
                    Some(StopReason::TimedOut) => ExecutionOutcome::TimedOut,
                    Some(StopReason::Cancelled) => ExecutionOutcome::Killed,
                    None => ExecutionOutcome::Lost(format!("{:#}", e)),
                }
            }
            (None, stop) => {
                lease.poison();
                match stop {
                    Some(StopReason::Cancelled) => ExecutionOutcome::Killed,
                    _ => ExecutionOutcome::TimedOut,
                }
            }
        };

        let (stdout, out_truncated) = stdout.finish();
        let (mut stderr, err_truncated) = stderr.finish();
        if outcome == ExecutionOutcome::TimedOut {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!("[{}]", FleetError::Timeout(timeout)));
        }

        ExecutionResult {
            outcome,
            stdout,
            stderr,
            truncated: out_truncated || err_truncated,
            duration: started.elapsed(),
        }
    }
}

fn capture(
    chunk: &OutputChunk,
    stdout: &mut CaptureBuffer,
    stderr: &mut CaptureBuffer,
    observer: &dyn OutputObserver,
) {
    let buffer = match chunk.stream {
        OutputStream::Stdout => stdout,
        OutputStream::Stderr => stderr,
    };
    let kept = buffer.push(&chunk.data);
    if kept > 0 {
        observer.on_output(chunk.stream, &String::from_utf8_lossy(&chunk.data[..kept]));
    }
}

/// First line of a command, shortened for log lines.
fn short_label(command: &str) -> String {
    let first = command.lines().next().unwrap_or_default();
    if first.chars().count() > 60 {
        format!("{}...", first.chars().take(60).collect::<String>())
    } else {
        first.to_string()
    }
}
