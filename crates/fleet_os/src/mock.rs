//! Mock connector: scripted sessions for testing without real servers.

use crate::{ConnectTarget, Connector, ExecExit, OutputChunk, RemoteSession};
use anyhow::Result;
use async_trait::async_trait;
use fleet_core::{Credential, FleetError, FleetResult, OutputStream};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A failure the connector can be scripted to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Connect,
    Auth,
}

impl MockFailure {
    fn to_error(self, target: &ConnectTarget) -> FleetError {
        match self {
            MockFailure::Connect => FleetError::Connect(format!("{}: connection refused", target)),
            MockFailure::Auth => FleetError::Auth(format!("{} rejected the credential", target)),
        }
    }
}

/// How a scripted command behaves.
#[derive(Debug, Clone)]
pub struct MockRun {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub ignore_kill: bool,
    pub lose_connection: bool,
    pub panic: bool,
}

impl MockRun {
    pub fn exit(code: i32) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: code,
            duration: Duration::ZERO,
            ignore_kill: false,
            lose_connection: false,
            panic: false,
        }
    }

    pub fn stdout(mut self, text: impl Into<String>) -> Self {
        self.stdout = text.into();
        self
    }

    pub fn stderr(mut self, text: impl Into<String>) -> Self {
        self.stderr = text.into();
        self
    }

    pub fn lasting(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Keep running through a kill request until `duration` elapses.
    pub fn ignoring_kill(mut self) -> Self {
        self.ignore_kill = true;
        self
    }

    /// Emit the output, then fail as if the connection dropped.
    pub fn losing_connection(mut self) -> Self {
        self.lose_connection = true;
        self
    }

    /// Panic inside the session, as a broken transport would.
    pub fn panicking(mut self) -> Self {
        self.panic = true;
        self
    }
}

#[derive(Default)]
struct MockState {
    failures: Mutex<VecDeque<MockFailure>>,
    always_fail: Mutex<Option<MockFailure>>,
    runs: Mutex<HashMap<String, MockRun>>,
    executed: Mutex<Vec<String>>,
    connects: AtomicU32,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    kills: AtomicU32,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connector whose sessions run scripted commands.
///
/// Unknown commands exit 0 and echo their text on stdout. Clones share state,
/// so a test can keep one handle while the pool owns another.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next connection attempt with `failure`. Queued failures are
    /// used up in order.
    pub fn fail_next(&self, failure: MockFailure) -> &Self {
        locked(&self.state.failures).push_back(failure);
        self
    }

    /// Fail every attempt until cleared with `None`.
    pub fn fail_always(&self, failure: Option<MockFailure>) {
        *locked(&self.state.always_fail) = failure;
    }

    pub fn script(&self, command: impl Into<String>, run: MockRun) -> &Self {
        locked(&self.state.runs).insert(command.into(), run);
        self
    }

    /// Successful connection count.
    pub fn connects(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Commands in the order they started executing.
    pub fn executed(&self) -> Vec<String> {
        locked(&self.state.executed).clone()
    }

    /// Highest number of commands ever executing at once.
    pub fn peak_running(&self) -> usize {
        self.state.peak_running.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> u32 {
        self.state.kills.load(Ordering::SeqCst)
    }

    fn run_for(&self, command: &str) -> MockRun {
        let runs = locked(&self.state.runs);
        runs.get(command)
            .or_else(|| {
                // Commands may be wrapped as `cd '<dir>' && <text>`
                runs.iter()
                    .find(|(text, _)| command.ends_with(&format!("&& {}", text)))
                    .map(|(_, run)| run)
            })
            .cloned()
            .unwrap_or_else(|| MockRun::exit(0).stdout(format!("{}\n", command)))
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
        _credential: &Credential,
    ) -> FleetResult<Box<dyn RemoteSession>> {
        let always = *locked(&self.state.always_fail);
        let next = locked(&self.state.failures).pop_front();
        if let Some(failure) = next.or(always) {
            return Err(failure.to_error(target));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            connector: self.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn name(&self) -> &str {
        "MockConnector"
    }
}

pub struct MockSession {
    connector: MockConnector,
    closed: Arc<AtomicBool>,
}

struct RunningGuard<'a>(&'a MockState);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn exec(
        &mut self,
        command: &str,
        output: mpsc::Sender<OutputChunk>,
        kill: CancellationToken,
    ) -> Result<ExecExit> {
        let state = &self.connector.state;
        let run = self.connector.run_for(command);
        locked(&state.executed).push(command.to_string());

        let now_running = state.running.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_running.fetch_max(now_running, Ordering::SeqCst);
        let _guard = RunningGuard(state);

        for line in run.stdout.split_inclusive('\n') {
            let chunk = OutputChunk { stream: OutputStream::Stdout, data: line.as_bytes().to_vec() };
            let _ = output.send(chunk).await;
        }
        for line in run.stderr.split_inclusive('\n') {
            let chunk = OutputChunk { stream: OutputStream::Stderr, data: line.as_bytes().to_vec() };
            let _ = output.send(chunk).await;
        }

        if run.panic {
            panic!("scripted panic while running {}", command);
        }

        if run.lose_connection {
            self.closed.store(true, Ordering::SeqCst);
            anyhow::bail!("connection reset by peer");
        }

        if run.ignore_kill {
            tokio::time::sleep(run.duration).await;
            if kill.is_cancelled() {
                state.kills.fetch_add(1, Ordering::SeqCst);
            }
            return Ok(ExecExit::Exited(run.exit_code));
        }

        tokio::select! {
            _ = tokio::time::sleep(run.duration) => Ok(ExecExit::Exited(run.exit_code)),
            _ = kill.cancelled() => {
                state.kills.fetch_add(1, Ordering::SeqCst);
                Ok(ExecExit::Killed)
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "MockSession"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::Secret;

    fn target() -> ConnectTarget {
        ConnectTarget {
            host: "web-1".into(),
            port: 22,
            username: "deploy".into(),
        }
    }

    fn credential() -> Credential {
        Credential::Password {
            password: Secret::new("pw"),
        }
    }

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let mock = MockConnector::new();
        mock.fail_next(MockFailure::Connect).fail_next(MockFailure::Auth);
        assert!(matches!(
            mock.connect(&target(), &credential()).await,
            Err(FleetError::Connect(_))
        ));
        assert!(matches!(
            mock.connect(&target(), &credential()).await,
            Err(FleetError::Auth(_))
        ));
        assert!(mock.connect(&target(), &credential()).await.is_ok());
        assert_eq!(mock.connects(), 1);
    }

    #[tokio::test]
    async fn test_unknown_command_echoes() {
        let mock = MockConnector::new();
        let mut session = mock.connect(&target(), &credential()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let exit = session.exec("uptime", tx, CancellationToken::new()).await.unwrap();
        assert_eq!(exit, ExecExit::Exited(0));
        let chunk = rx.recv().await.unwrap();
        assert_eq!(chunk.data, b"uptime\n");
        assert_eq!(mock.executed(), vec!["uptime".to_string()]);
    }

    #[tokio::test]
    async fn test_workdir_wrapped_command_matches_script() {
        let mock = MockConnector::new();
        mock.script("git pull", MockRun::exit(1));
        let mut session = mock.connect(&target(), &credential()).await.unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let exit = session
            .exec("cd '/srv/app' && git pull", tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(exit, ExecExit::Exited(1));
    }
}
