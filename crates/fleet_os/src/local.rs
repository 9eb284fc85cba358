use crate::{ConnectTarget, Connector, ExecExit, OutputChunk, RemoteSession};
use anyhow::{Context, Result};
use async_trait::async_trait;
use fleet_core::{Credential, FleetResult, OutputStream};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Runs every command in a local shell. Credentials and addresses are
/// ignored.
#[derive(Default)]
pub struct LocalConnector;

impl LocalConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
        _credential: &Credential,
    ) -> FleetResult<Box<dyn RemoteSession>> {
        tracing::debug!("Opening local session in place of {}", target);
        Ok(Box::new(LocalSession { closed: false }))
    }

    fn name(&self) -> &str {
        "LocalConnector"
    }
}

pub struct LocalSession {
    closed: bool,
}

#[async_trait]
impl RemoteSession for LocalSession {
    async fn exec(
        &mut self,
        command: &str,
        output: mpsc::Sender<OutputChunk>,
        kill: CancellationToken,
    ) -> Result<ExecExit> {
        // sh -c keeps shell features (pipes, redirects, &&)
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn local shell")?;

        let stdout = child.stdout.take().context("stdout not captured")?;
        let stderr = child.stderr.take().context("stderr not captured")?;
        let out_pump = spawn_pump(stdout, OutputStream::Stdout, output.clone());
        let err_pump = spawn_pump(stderr, OutputStream::Stderr, output);

        tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for local command")?;
                let _ = out_pump.await;
                let _ = err_pump.await;
                Ok(ExecExit::Exited(status.code().unwrap_or(-1)))
            }
            _ = kill.cancelled() => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!("Failed to kill local command: {}", e);
                }
                let _ = child.wait().await;
                // Grandchildren may still hold the pipes open
                out_pump.abort();
                err_pump.abort();
                Ok(ExecExit::Killed)
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) {
        self.closed = true;
    }

    fn name(&self) -> &str {
        "LocalSession"
    }
}

fn spawn_pump<R>(
    mut reader: R,
    stream: OutputStream,
    output: mpsc::Sender<OutputChunk>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = OutputChunk {
                        stream,
                        data: buf[..n].to_vec(),
                    };
                    if output.send(chunk).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Local {:?} pipe read failed: {}", stream, e);
                    break;
                }
            }
        }
    })
}
