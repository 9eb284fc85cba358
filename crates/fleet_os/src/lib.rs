pub mod engine;
pub mod local;
pub mod mock;
pub mod pool;
pub mod retry;
pub mod ssh;

pub use engine::{command_line, ExecutionEngine, ExecutionOutcome, ExecutionResult, OutputObserver};
pub use local::LocalConnector;
pub use pool::{ConnectionPool, Lease};
pub use retry::RetryConfig;
pub use ssh::SshConnector;

use async_trait::async_trait;
use fleet_core::{Credential, FleetResult, OutputStream, Server};
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Where to connect and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl From<&Server> for ConnectTarget {
    fn from(server: &Server) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            username: server.username.clone(),
        }
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// A slice of output from a running command.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

/// How a remote command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecExit {
    Exited(i32),
    /// Stopped because the kill token fired.
    Killed,
}

/// An authenticated session to one server.
///
/// Implementors:
/// - `SshSession`: a russh client connection
/// - `LocalSession`: `sh -c` on this machine
#[async_trait]
pub trait RemoteSession: Send {
    /// Run `command`, sending output chunks as they arrive.
    ///
    /// Once `kill` is cancelled the implementation makes a best effort to stop
    /// the remote process and returns `ExecExit::Killed`. An `Err` means the
    /// session itself is broken and must not be reused.
    async fn exec(
        &mut self,
        command: &str,
        output: mpsc::Sender<OutputChunk>,
        kill: CancellationToken,
    ) -> anyhow::Result<ExecExit>;

    fn is_closed(&self) -> bool;

    async fn close(&mut self);

    /// Session type name (for logs)
    fn name(&self) -> &str;
}

/// Opens sessions. Failures are `FleetError::Connect` for network trouble and
/// `FleetError::Auth` when the credential is refused.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        target: &ConnectTarget,
        credential: &Credential,
    ) -> FleetResult<Box<dyn RemoteSession>>;

    fn name(&self) -> &str;
}
