use crate::{ConnectTarget, Connector, ExecExit, OutputChunk, RemoteSession};
use anyhow::{Context, Result};
use async_trait::async_trait;
use fleet_core::{Credential, FleetError, FleetResult, OutputStream};
use russh::*;
use russh_keys::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// SSH extended-data stream number for stderr.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host keys are accepted as presented (ssh -o StrictHostKeyChecking=no).
        // TODO: pin host keys per server at registration and reject mismatches here.
        Ok(true)
    }
}

pub struct SshConnector {
    config: Arc<client::Config>,
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        let config = client::Config {
            inactivity_timeout: None,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
        credential: &Credential,
    ) -> FleetResult<Box<dyn RemoteSession>> {
        let addr = (target.host.clone(), target.port);
        let connecting = client::connect(self.config.clone(), addr, ClientHandler);

        // russh::client::connect handles the TCP connection itself
        let mut handle = match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                return Err(FleetError::Connect(format!("{}: {:#}", target, e)));
            }
            Err(_) => {
                return Err(FleetError::Connect(format!(
                    "{}: timed out after {}s",
                    target,
                    self.connect_timeout.as_secs()
                )));
            }
        };

        let authenticated = match credential {
            Credential::PrivateKey { key, passphrase } => {
                let key_pair =
                    decode_secret_key(key.expose(), passphrase.as_ref().map(|p| p.expose()))
                        .map_err(|e| {
                            FleetError::Auth(format!("unusable private key for {}: {}", target, e))
                        })?;
                handle
                    .authenticate_publickey(&target.username, Arc::new(key_pair))
                    .await
            }
            Credential::Password { password } => {
                handle
                    .authenticate_password(&target.username, password.expose())
                    .await
            }
        }
        .map_err(|e| {
            FleetError::Connect(format!("{}: dropped during authentication: {}", target, e))
        })?;

        if !authenticated {
            return Err(FleetError::Auth(format!("{} rejected the credential", target)));
        }

        tracing::debug!("SSH session established to {}", target);
        Ok(Box::new(SshSession { handle }))
    }

    fn name(&self) -> &str {
        "SshConnector"
    }
}

pub struct SshSession {
    handle: client::Handle<ClientHandler>,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(
        &mut self,
        command: &str,
        output: mpsc::Sender<OutputChunk>,
        kill: CancellationToken,
    ) -> Result<ExecExit> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .context("Failed to open SSH channel")?;
        channel
            .exec(true, command)
            .await
            .context("Failed to start remote command")?;

        let mut exit_code = None;
        loop {
            tokio::select! {
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { ref data }) => {
                        let chunk = OutputChunk { stream: OutputStream::Stdout, data: data.to_vec() };
                        let _ = output.send(chunk).await;
                    }
                    Some(ChannelMsg::ExtendedData { ref data, ext }) => {
                        if ext == SSH_EXTENDED_DATA_STDERR {
                            let chunk = OutputChunk { stream: OutputStream::Stderr, data: data.to_vec() };
                            let _ = output.send(chunk).await;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status as i32);
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        tracing::debug!("Remote command terminated by signal {:?}", signal_name);
                        exit_code.get_or_insert(-1);
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = kill.cancelled() => {
                    // Servers may ignore signal requests; closing the channel
                    // hangs up the remote side either way.
                    if let Err(e) = channel.signal(Sig::KILL).await {
                        tracing::debug!("SSH kill signal not delivered: {}", e);
                    }
                    let _ = channel.close().await;
                    return Ok(ExecExit::Killed);
                }
            }
        }

        match exit_code {
            Some(code) => Ok(ExecExit::Exited(code)),
            None => anyhow::bail!("SSH channel closed without an exit status"),
        }
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close(&mut self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            tracing::debug!("SSH disconnect failed: {}", e);
        }
    }

    fn name(&self) -> &str {
        "SshSession"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::Secret;

    #[tokio::test]
    async fn test_unreachable_host_is_connect_error() {
        let connector = SshConnector::new(Duration::from_secs(2));
        let target = ConnectTarget {
            // Port 9 on loopback is never an SSH server
            host: "127.0.0.1".into(),
            port: 9,
            username: "deploy".into(),
        };
        let credential = Credential::Password {
            password: Secret::new("x"),
        };
        match connector.connect(&target, &credential).await {
            Err(FleetError::Connect(msg)) => assert!(msg.contains("127.0.0.1:9")),
            Err(other) => panic!("Expected ConnectError, got {}", other),
            Ok(_) => panic!("Expected ConnectError, got a session"),
        }
    }

    #[test]
    fn test_connector_name() {
        assert_eq!(SshConnector::new(Duration::from_secs(1)).name(), "SshConnector");
    }
}
