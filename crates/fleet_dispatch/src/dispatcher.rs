use crate::health::ProbeOutcome;
use crate::lane::{Lane, LaneMsg, Reply};
use crate::notify::{EventBus, Subscription, Topic};
use crate::{DispatchOptions, Shared};
use anyhow::anyhow;
use chrono::Utc;
use fleet_core::{
    AuditPage, AuditQuery, Caller, Command, CommandFilter, CommandId, CommandKind, CommandState,
    CredentialVault, FleetConfig, FleetError, FleetResult, NewServer, Server, ServerId,
    ServerPatch, ServerStatus, Store, SubmissionPolicy,
};
use fleet_os::{ConnectionPool, ExecutionEngine};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

const RESTART_REASON: &str = "interrupted by dispatcher restart";

/// What [`Dispatcher::recover`] found at start-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
    /// Commands that were running and are now failed.
    pub interrupted: usize,
    /// Pending commands put back on their server's queue.
    pub requeued: usize,
}

struct Inner {
    shared: Arc<Shared>,
    vault: Arc<CredentialVault>,
    policy: SubmissionPolicy,
    lanes: Mutex<HashMap<ServerId, mpsc::Sender<LaneMsg>>>,
}

/// Entry point for every command and server operation. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        vault: Arc<CredentialVault>,
        pool: Arc<ConnectionPool>,
        engine: Arc<ExecutionEngine>,
        bus: Arc<EventBus>,
        config: &FleetConfig,
    ) -> Self {
        let shared = Shared {
            store,
            pool,
            engine,
            bus,
            options: DispatchOptions::from(config),
        };
        Self {
            inner: Arc::new(Inner {
                shared: Arc::new(shared),
                vault,
                policy: SubmissionPolicy::new(&config.dispatch),
                lanes: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<ServerId, mpsc::Sender<LaneMsg>>> {
        self.inner.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The lane for `server_id`, started on first use.
    async fn lane(&self, server_id: ServerId) -> FleetResult<mpsc::Sender<LaneMsg>> {
        if let Some(lane) = self.lanes().get(&server_id) {
            return Ok(lane.clone());
        }
        let server = self.get_server(server_id).await?;
        let shared = self.inner.shared.clone();
        Ok(self
            .lanes()
            .entry(server_id)
            .or_insert_with(|| Lane::spawn(server, shared))
            .clone())
    }

    /// Send a request to a server's lane and wait for its answer.
    async fn ask<T>(
        &self,
        server_id: ServerId,
        make: impl FnOnce(Reply<T>) -> LaneMsg,
    ) -> FleetResult<T> {
        let lane = self.lane(server_id).await?;
        let (reply, answer) = oneshot::channel();
        // Lanes only stop once their server is deleted
        lane.send(make(reply))
            .await
            .map_err(|_| FleetError::NotFound(format!("server {}", server_id)))?;
        answer
            .await
            .map_err(|_| FleetError::NotFound(format!("server {}", server_id)))?
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.shared().bus.subscribe(topic)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Validate and queue a command. When `kind` is omitted it is inferred
    /// from the text.
    pub async fn submit(
        &self,
        caller: &Caller,
        server_id: ServerId,
        text: &str,
        kind: Option<CommandKind>,
    ) -> FleetResult<Command> {
        self.inner.policy.authorize_submit(caller)?;
        let text = self.inner.policy.check_text(text)?;
        if self.shared().store.get_server(server_id).await?.is_none() {
            return Err(FleetError::Validation(format!("unknown server {}", server_id)));
        }

        let kind = kind.unwrap_or_else(|| CommandKind::infer(text));
        let command = Command::new(server_id, caller.user_id, text, kind);
        self.ask(server_id, |reply| LaneMsg::Submit { command, reply })
            .await
    }

    /// Cancel a command that has not started yet.
    pub async fn cancel(&self, caller: &Caller, id: CommandId) -> FleetResult<Command> {
        self.inner.policy.authorize_submit(caller)?;
        let command = self.get_command(id).await?;
        if command.state != CommandState::Pending {
            return Err(FleetError::Conflict(format!(
                "command {} is {} and cannot be cancelled",
                id, command.state
            )));
        }
        let by = caller.user_id;
        self.ask(command.server_id, |reply| LaneMsg::Cancel { id, by, reply })
            .await
    }

    /// Ask a running command to stop. Returns at once; the command ends
    /// `cancelled` unless it finishes on its own first.
    pub async fn terminate(&self, caller: &Caller, id: CommandId) -> FleetResult<Command> {
        self.inner.policy.authorize_submit(caller)?;
        let command = self.get_command(id).await?;
        match command.state {
            CommandState::Running => {}
            CommandState::Pending => {
                return Err(FleetError::Conflict(format!(
                    "command {} has not started; cancel it instead",
                    id
                )))
            }
            state => {
                return Err(FleetError::Conflict(format!(
                    "command {} is already {}",
                    id, state
                )))
            }
        }
        let by = caller.user_id;
        self.ask(command.server_id, |reply| LaneMsg::Terminate { id, by, reply })
            .await
    }

    pub async fn get_command(&self, id: CommandId) -> FleetResult<Command> {
        self.shared()
            .store
            .get_command(id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("command {}", id)))
    }

    pub async fn list_commands(&self, filter: &CommandFilter) -> FleetResult<Vec<Command>> {
        Ok(self.shared().store.list_commands(filter).await?)
    }

    pub async fn audit(&self, query: &AuditQuery) -> FleetResult<AuditPage> {
        Ok(self.shared().store.query(query).await?)
    }

    // ========================================================================
    // Servers
    // ========================================================================

    pub async fn register_server(&self, caller: &Caller, new: NewServer) -> FleetResult<Server> {
        self.inner.policy.authorize_manage(caller)?;

        let name = new.name.trim();
        let host = new.host.trim();
        let username = new.username.trim();
        if name.is_empty() || host.is_empty() || username.is_empty() {
            return Err(FleetError::Validation(
                "name, host and username are required".to_string(),
            ));
        }
        if new.port == 0 {
            return Err(FleetError::Validation("port must be between 1 and 65535".to_string()));
        }
        let max_concurrent = new
            .max_concurrent_commands
            .unwrap_or(self.shared().options.default_max_concurrent);
        if max_concurrent == 0 {
            return Err(FleetError::Validation(
                "max_concurrent_commands must be at least 1".to_string(),
            ));
        }

        let credential_ref = self.inner.vault.store(&new.credential).await?;
        let server = Server {
            id: Uuid::new_v4(),
            name: name.to_string(),
            host: host.to_string(),
            port: new.port,
            username: username.to_string(),
            credential_ref,
            max_concurrent_commands: max_concurrent,
            workdir: new
                .workdir
                .as_deref()
                .map(str::trim)
                .filter(|dir| !dir.is_empty())
                .map(str::to_string),
            status: ServerStatus::Offline,
            last_seen: None,
            created_by: Some(caller.user_id),
            created_at: Utc::now(),
        };
        self.shared().store.insert_server(&server).await?;
        tracing::info!(
            "Registered server {} ({}) at {} by {}",
            server.name,
            server.id,
            server.address(),
            caller.user_id
        );
        Ok(server)
    }

    pub async fn update_server(
        &self,
        caller: &Caller,
        id: ServerId,
        patch: ServerPatch,
    ) -> FleetResult<Server> {
        self.inner.policy.authorize_manage(caller)?;
        self.ask(id, |reply| LaneMsg::Update { patch, reply }).await
    }

    /// Remove an idle server. Its sealed credential and pooled connections
    /// go with it; its audit entries stay.
    pub async fn delete_server(&self, caller: &Caller, id: ServerId) -> FleetResult<Server> {
        self.inner.policy.authorize_manage(caller)?;
        let server = self.ask(id, |reply| LaneMsg::Delete { reply }).await?;
        self.lanes().remove(&id);
        self.shared().pool.forget(id);
        if let Err(e) = self.inner.vault.remove(&server.credential_ref).await {
            tracing::warn!("Failed to remove credential of deleted server {}: {}", id, e);
        }
        tracing::info!("Server {} ({}) deleted by {}", server.name, id, caller.user_id);
        Ok(server)
    }

    pub async fn get_server(&self, id: ServerId) -> FleetResult<Server> {
        self.shared()
            .store
            .get_server(id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("server {}", id)))
    }

    pub async fn list_servers(&self) -> FleetResult<Vec<Server>> {
        Ok(self.shared().store.list_servers().await?)
    }

    /// Probe one server and record the result through its lane.
    pub async fn probe_server(&self, id: ServerId) -> FleetResult<Server> {
        let server = self.get_server(id).await?;
        let result = self.shared().pool.probe(&server).await;
        let outcome = ProbeOutcome::from(&result);
        self.ask(id, |reply| LaneMsg::Probed { outcome, reply }).await
    }

    // ========================================================================
    // Start-up
    // ========================================================================

    /// Settle commands left over from a previous run: anything `running`
    /// was cut off and fails, anything `pending` is queued again in
    /// submission order.
    pub async fn recover(&self) -> FleetResult<Recovery> {
        let mut recovery = Recovery::default();
        let store = &self.shared().store;

        for mut command in store.commands_in_state(CommandState::Running).await? {
            command.advance(CommandState::Failed, Utc::now())?;
            command.reason = Some(RESTART_REASON.to_string());
            self.shared().commit(&command).await?;
            recovery.interrupted += 1;
        }

        for command in store.commands_in_state(CommandState::Pending).await? {
            let lane = match self.lane(command.server_id).await {
                Ok(lane) => lane,
                Err(e) => {
                    tracing::error!("Cannot re-queue command {}: {}", command.id, e);
                    continue;
                }
            };
            lane.send(LaneMsg::Requeue { command })
                .await
                .map_err(|_| anyhow!("lane stopped during recovery"))?;
            recovery.requeued += 1;
        }

        if recovery != Recovery::default() {
            tracing::info!(
                "Recovered {} interrupted and {} pending commands",
                recovery.interrupted,
                recovery.requeued
            );
        }
        Ok(recovery)
    }
}
