//! Periodic reachability probes for every registered server.

use crate::Dispatcher;
use fleet_core::{FleetError, FleetResult, ServerId, ServerStatus};
use futures_util::future::join_all;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What one probe found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    /// Network-level failure.
    Unreachable(String),
    /// The server answered but refused the credential.
    Rejected(String),
}

impl From<&FleetResult<()>> for ProbeOutcome {
    fn from(result: &FleetResult<()>) -> Self {
        match result {
            Ok(()) => ProbeOutcome::Reachable,
            Err(FleetError::Auth(msg)) => ProbeOutcome::Rejected(msg.clone()),
            Err(e) => ProbeOutcome::Unreachable(e.to_string()),
        }
    }
}

pub struct HealthMonitor {
    dispatcher: Dispatcher,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(dispatcher: Dispatcher, interval: Duration) -> Self {
        Self {
            dispatcher,
            interval,
        }
    }

    /// Probe every server once, concurrently.
    pub async fn check_all(&self) -> Vec<(ServerId, ServerStatus)> {
        let servers = match self.dispatcher.list_servers().await {
            Ok(servers) => servers,
            Err(e) => {
                tracing::error!("Health check could not list servers: {}", e);
                return Vec::new();
            }
        };

        let probes = servers.iter().map(|server| self.dispatcher.probe_server(server.id));
        let mut statuses = Vec::with_capacity(servers.len());
        for (server, result) in servers.iter().zip(join_all(probes).await) {
            match result {
                Ok(updated) => statuses.push((updated.id, updated.status)),
                Err(e) => tracing::warn!("Health check of {} failed: {}", server.name, e),
            }
        }
        statuses
    }

    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Health monitor running every {}s", self.interval.as_secs());
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let statuses = self.check_all().await;
                        let online = statuses
                            .iter()
                            .filter(|(_, status)| *status == ServerStatus::Online)
                            .count();
                        tracing::debug!("Health check: {}/{} servers online", online, statuses.len());
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}
