//! Per-server lane: the single task that owns one server's queue, its
//! in-flight commands and its status.
//!
//! Workers acquire connections concurrently, but a command only moves to
//! `running` when the lane approves it, and approvals go out in submission
//! order. Every write to a command on this server, and to the server row
//! itself, happens here.

use crate::health::ProbeOutcome;
use crate::Shared;
use chrono::Utc;
use fleet_core::{
    Command, CommandEvent, CommandId, CommandState, FleetError, FleetResult, OutputStream, Server,
    ServerId, ServerPatch, ServerStatus, UserId,
};
use fleet_os::{command_line, ExecutionOutcome, ExecutionResult, OutputObserver};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const LANE_MAILBOX: usize = 256;

pub(crate) type Reply<T> = oneshot::Sender<FleetResult<T>>;

pub(crate) enum LaneMsg {
    Submit {
        command: Command,
        reply: Reply<Command>,
    },
    /// A pending command found at start-up; already persisted and audited.
    Requeue {
        command: Command,
    },
    Cancel {
        id: CommandId,
        by: UserId,
        reply: Reply<Command>,
    },
    Terminate {
        id: CommandId,
        by: UserId,
        reply: Reply<Command>,
    },
    Update {
        patch: ServerPatch,
        reply: Reply<Server>,
    },
    Probed {
        outcome: ProbeOutcome,
        reply: Reply<Server>,
    },
    /// Remove the server if it is idle, then stop the lane.
    Delete {
        reply: Reply<Server>,
    },
    /// A worker holds a connection and asks to start.
    Acquired {
        id: CommandId,
        approve: oneshot::Sender<bool>,
    },
    /// A worker could not get a connection.
    Unavailable {
        id: CommandId,
        error: FleetError,
    },
    Finished {
        id: CommandId,
        result: ExecutionResult,
    },
    /// A worker task ended without reporting back.
    Crashed {
        id: CommandId,
        reason: String,
    },
}

enum Phase {
    Acquiring,
    Ready(oneshot::Sender<bool>),
    Running,
}

struct Slot {
    command: Command,
    /// Aborts the acquisition while pending, kills the command once running.
    stop: CancellationToken,
    phase: Phase,
    terminated_by: Option<UserId>,
}

pub(crate) struct Lane {
    server: Server,
    shared: Arc<Shared>,
    mailbox: mpsc::Sender<LaneMsg>,
    queue: VecDeque<Command>,
    /// Keyed by dispatch order.
    inflight: BTreeMap<u64, Slot>,
    next_seq: u64,
    deleted: bool,
}

impl Lane {
    pub(crate) fn spawn(server: Server, shared: Arc<Shared>) -> mpsc::Sender<LaneMsg> {
        let (tx, rx) = mpsc::channel(LANE_MAILBOX);
        tracing::debug!("Starting lane for server {} ({})", server.name, server.id);
        let lane = Lane {
            server,
            shared,
            mailbox: tx.clone(),
            queue: VecDeque::new(),
            inflight: BTreeMap::new(),
            next_seq: 0,
            deleted: false,
        };
        tokio::spawn(lane.run(rx));
        tx
    }

    async fn run(mut self, mut rx: mpsc::Receiver<LaneMsg>) {
        while let Some(msg) = rx.recv().await {
            self.handle(msg).await;
            if self.deleted {
                break;
            }
            self.start_ready().await;
            self.dispatch();
        }
        tracing::debug!("Lane for server {} ({}) stopped", self.server.name, self.server.id);
    }

    async fn handle(&mut self, msg: LaneMsg) {
        match msg {
            LaneMsg::Submit { command, reply } => {
                let _ = reply.send(self.enqueue(command).await);
            }
            LaneMsg::Requeue { command } => {
                tracing::info!("Re-queued pending command {} on {}", command.id, self.server.name);
                self.queue.push_back(command);
            }
            LaneMsg::Cancel { id, by, reply } => {
                let _ = reply.send(self.cancel(id, by).await);
            }
            LaneMsg::Terminate { id, by, reply } => {
                let _ = reply.send(self.terminate(id, by));
            }
            LaneMsg::Update { patch, reply } => {
                let _ = reply.send(self.update(patch).await);
            }
            LaneMsg::Probed { outcome, reply } => {
                self.apply_probe(&outcome).await;
                let _ = reply.send(Ok(self.server.clone()));
            }
            LaneMsg::Delete { reply } => {
                let _ = reply.send(self.delete().await);
            }
            LaneMsg::Acquired { id, approve } => match self.slot_mut(id) {
                Some(slot) => slot.phase = Phase::Ready(approve),
                // Cancelled while connecting
                None => {
                    let _ = approve.send(false);
                }
            },
            LaneMsg::Unavailable { id, error } => self.unavailable(id, error).await,
            LaneMsg::Finished { id, result } => self.finish(id, result).await,
            LaneMsg::Crashed { id, reason } => self.crashed(id, reason).await,
        }
    }

    fn slot_mut(&mut self, id: CommandId) -> Option<&mut Slot> {
        self.inflight.values_mut().find(|slot| slot.command.id == id)
    }

    fn take_slot(&mut self, id: CommandId) -> Option<Slot> {
        let seq = *self
            .inflight
            .iter()
            .find(|(_, slot)| slot.command.id == id)?
            .0;
        self.inflight.remove(&seq)
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    async fn advance(
        &self,
        command: &mut Command,
        next: CommandState,
        reason: Option<String>,
    ) -> FleetResult<()> {
        command.advance(next, Utc::now())?;
        if reason.is_some() {
            command.reason = reason;
        }
        self.shared.commit(command).await
    }

    /// Fail a pending command, logging instead of propagating storage errors.
    async fn fail_pending(&self, mut command: Command, reason: String) {
        if let Err(e) = self.advance(&mut command, CommandState::Failed, Some(reason)).await {
            tracing::error!("Failed to record failure of command {}: {}", command.id, e);
        }
    }

    async fn enqueue(&mut self, command: Command) -> FleetResult<Command> {
        if self.queue.len() >= self.shared.options.max_queue_depth {
            return Err(FleetError::ServerUnavailable(format!(
                "{} already has {} commands queued",
                self.server.name,
                self.queue.len()
            )));
        }
        self.shared.store.insert_command(&command).await?;
        self.shared.announce(&command).await?;
        tracing::info!(
            "Queued command {} on {} ({} ahead)",
            command.id,
            self.server.name,
            self.queue.len() + self.inflight.len()
        );
        self.queue.push_back(command.clone());
        Ok(command)
    }

    async fn cancel(&mut self, id: CommandId, by: UserId) -> FleetResult<Command> {
        let reason = Some(format!("cancelled by {}", by));

        // Leave the command in place until the cancellation is stored
        if let Some(pos) = self.queue.iter().position(|c| c.id == id) {
            let mut command = self.queue[pos].clone();
            self.advance(&mut command, CommandState::Cancelled, reason).await?;
            self.queue.remove(pos);
            tracing::info!("Cancelled queued command {}", id);
            return Ok(command);
        }

        match self.slot_mut(id).map(|slot| matches!(slot.phase, Phase::Running)) {
            Some(true) => Err(FleetError::Conflict(format!(
                "command {} is already running; terminate it instead",
                id
            ))),
            Some(false) => {
                let Some(mut command) = self.slot_mut(id).map(|slot| slot.command.clone()) else {
                    return Err(FleetError::Conflict(format!("command {} is not pending", id)));
                };
                self.advance(&mut command, CommandState::Cancelled, reason).await?;
                if let Some(slot) = self.take_slot(id) {
                    slot.stop.cancel();
                    if let Phase::Ready(approve) = slot.phase {
                        let _ = approve.send(false);
                    }
                }
                tracing::info!("Cancelled command {} while it waited for a connection", id);
                Ok(command)
            }
            None => Err(FleetError::Conflict(format!("command {} is not pending", id))),
        }
    }

    fn terminate(&mut self, id: CommandId, by: UserId) -> FleetResult<Command> {
        let queued = self.queue.iter().any(|c| c.id == id);
        match self.slot_mut(id) {
            Some(slot) if matches!(slot.phase, Phase::Running) => {
                slot.terminated_by.get_or_insert(by);
                slot.stop.cancel();
                tracing::info!("Terminating running command {} at the request of {}", id, by);
                Ok(slot.command.clone())
            }
            Some(_) => Err(FleetError::Conflict(format!(
                "command {} has not started; cancel it instead",
                id
            ))),
            None if queued => Err(FleetError::Conflict(format!(
                "command {} has not started; cancel it instead",
                id
            ))),
            None => Err(FleetError::Conflict(format!("command {} is not running", id))),
        }
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Hand queued commands to workers while there are free slots.
    fn dispatch(&mut self) {
        while self.inflight.len() < self.server.slots() {
            let Some(command) = self.queue.pop_front() else {
                break;
            };
            let stop = CancellationToken::new();
            let seq = self.next_seq;
            self.next_seq += 1;

            let worker = tokio::spawn(work(
                self.shared.clone(),
                self.server.clone(),
                command.clone(),
                stop.clone(),
                self.mailbox.clone(),
            ));
            tokio::spawn(supervise(command.id, worker, self.mailbox.clone()));
            self.inflight.insert(
                seq,
                Slot {
                    command,
                    stop,
                    phase: Phase::Acquiring,
                    terminated_by: None,
                },
            );
        }
    }

    /// Start connected commands in dispatch order. A command that is still
    /// connecting holds back everything dispatched after it.
    async fn start_ready(&mut self) {
        loop {
            let next = self
                .inflight
                .iter()
                .find(|(_, slot)| !matches!(slot.phase, Phase::Running))
                .map(|(seq, slot)| (*seq, matches!(slot.phase, Phase::Ready(_))));
            let seq = match next {
                Some((seq, true)) => seq,
                _ => return,
            };
            let Some(slot) = self.inflight.get_mut(&seq) else {
                return;
            };
            let Phase::Ready(approve) = std::mem::replace(&mut slot.phase, Phase::Running) else {
                return;
            };
            let mut command = slot.command.clone();

            match self.advance(&mut command, CommandState::Running, None).await {
                Ok(()) => {
                    tracing::info!("Started command {} on {}", command.id, self.server.name);
                    if let Some(slot) = self.inflight.get_mut(&seq) {
                        slot.command = command;
                    }
                    let _ = approve.send(true);
                    self.mark_reachable().await;
                }
                Err(e) => {
                    tracing::error!("Could not start command {}: {}", command.id, e);
                    let _ = approve.send(false);
                    self.inflight.remove(&seq);
                    self.fail_pending(command, format!("could not start: {}", e)).await;
                }
            }
        }
    }

    async fn finish(&mut self, id: CommandId, result: ExecutionResult) {
        let Some(slot) = self.take_slot(id) else {
            tracing::warn!("Finished report for unknown command {}", id);
            return;
        };
        let mut command = slot.command;
        command.exit_code = result.exit_code();
        command.stdout = Some(result.stdout);
        command.stderr = Some(result.stderr);

        let (state, reason) = match result.outcome {
            ExecutionOutcome::Exited(0) => (CommandState::Completed, "exited with status 0".to_string()),
            ExecutionOutcome::Exited(code) => (CommandState::Failed, format!("exited with status {}", code)),
            ExecutionOutcome::TimedOut => (
                CommandState::Failed,
                FleetError::Timeout(self.shared.options.command_timeout).to_string(),
            ),
            ExecutionOutcome::Killed => (
                CommandState::Cancelled,
                match slot.terminated_by {
                    Some(user) => format!("terminated by {}", user),
                    None => "terminated".to_string(),
                },
            ),
            ExecutionOutcome::Lost(msg) => (
                CommandState::Failed,
                FleetError::Connect(format!("connection lost during execution: {}", msg)).to_string(),
            ),
        };

        match self.advance(&mut command, state, Some(reason)).await {
            Ok(()) => tracing::info!(
                "Command {} on {} finished {} in {:.1}s",
                id,
                self.server.name,
                state,
                result.duration.as_secs_f64()
            ),
            Err(e) => tracing::error!("Failed to record completion of command {}: {}", id, e),
        }
    }

    /// A worker died before reporting. The command fails and the slot is
    /// freed so the rest of the queue keeps moving.
    async fn crashed(&mut self, id: CommandId, reason: String) {
        let Some(slot) = self.take_slot(id) else {
            return;
        };
        tracing::error!("Worker for command {} on {} crashed: {}", id, self.server.name, reason);
        slot.stop.cancel();
        if let Phase::Ready(approve) = slot.phase {
            let _ = approve.send(false);
        }
        let mut command = slot.command;
        let reason = format!("worker crashed: {}", reason);
        if let Err(e) = self.advance(&mut command, CommandState::Failed, Some(reason)).await {
            tracing::error!("Failed to record failure of command {}: {}", id, e);
        }
    }

    /// The connection pool gave up: the server is in error and nothing
    /// queued for it can run.
    async fn unavailable(&mut self, id: CommandId, error: FleetError) {
        tracing::warn!("Server {} unavailable: {}", self.server.name, error);
        let reason = FleetError::ServerUnavailable(format!("{}: {}", self.server.name, error)).to_string();

        if let Some(slot) = self.take_slot(id) {
            self.fail_pending(slot.command, reason.clone()).await;
        }
        let queued: Vec<Command> = self.queue.drain(..).collect();
        if !queued.is_empty() {
            tracing::warn!("Failing {} queued commands on {}", queued.len(), self.server.name);
        }
        for command in queued {
            self.fail_pending(command, reason.clone()).await;
        }

        self.set_status(ServerStatus::Error, false).await;
    }

    // ========================================================================
    // Server state
    // ========================================================================

    async fn set_status(&mut self, status: ServerStatus, seen: bool) {
        let changed = self.server.status != status;
        self.server.status = status;
        if seen {
            self.server.last_seen = Some(Utc::now());
        }
        if changed {
            tracing::info!("Server {} is now {}", self.server.name, status.as_str());
        }
        if changed || seen {
            if let Err(e) = self.shared.store.update_server(&self.server).await {
                tracing::error!("Failed to save status of {}: {}", self.server.name, e);
            }
        }
    }

    /// A connection was just used successfully; this also clears `error`.
    async fn mark_reachable(&mut self) {
        self.set_status(ServerStatus::Online, true).await;
    }

    async fn apply_probe(&mut self, outcome: &ProbeOutcome) {
        match outcome {
            ProbeOutcome::Reachable => self.set_status(ServerStatus::Online, true).await,
            ProbeOutcome::Rejected(msg) => {
                tracing::warn!("Health probe of {} rejected: {}", self.server.name, msg);
                self.set_status(ServerStatus::Error, false).await;
            }
            ProbeOutcome::Unreachable(msg) => {
                tracing::debug!("Health probe of {} failed: {}", self.server.name, msg);
                // error only clears on a successful connection
                if self.server.status != ServerStatus::Error {
                    self.set_status(ServerStatus::Offline, false).await;
                }
            }
        }
    }

    async fn delete(&mut self) -> FleetResult<Server> {
        let active = self.queue.len() + self.inflight.len();
        if active > 0 {
            return Err(FleetError::Conflict(format!(
                "{} still has {} pending or running commands",
                self.server.name, active
            )));
        }
        if !self.shared.store.delete_server(self.server.id).await? {
            return Err(FleetError::NotFound(format!("server {}", self.server.id)));
        }
        tracing::info!("Deleted server {} ({})", self.server.name, self.server.id);
        self.deleted = true;
        Ok(self.server.clone())
    }

    async fn update(&mut self, patch: ServerPatch) -> FleetResult<Server> {
        let mut updated = self.server.clone();
        if let Some(name) = patch.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(FleetError::Validation("server name is empty".to_string()));
            }
            updated.name = name.to_string();
        }
        if let Some(limit) = patch.max_concurrent_commands {
            if limit == 0 {
                return Err(FleetError::Validation(
                    "max_concurrent_commands must be at least 1".to_string(),
                ));
            }
            updated.max_concurrent_commands = limit;
        }
        if let Some(workdir) = patch.workdir {
            let workdir = workdir.trim();
            updated.workdir = (!workdir.is_empty()).then(|| workdir.to_string());
        }

        self.shared.store.update_server(&updated).await?;
        if updated.max_concurrent_commands != self.server.max_concurrent_commands {
            self.shared.pool.forget(updated.id);
        }
        tracing::info!("Updated server {} ({})", updated.name, updated.id);
        self.server = updated;
        Ok(self.server.clone())
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Publishes a running command's output on the bus.
struct BusObserver {
    shared: Arc<Shared>,
    command_id: CommandId,
    server_id: ServerId,
}

impl OutputObserver for BusObserver {
    fn on_output(&self, stream: OutputStream, text: &str) {
        self.shared.bus.publish(CommandEvent::output(
            self.command_id,
            self.server_id,
            stream,
            text.to_string(),
        ));
    }
}

/// Report a worker that panicked so its slot does not stay taken.
async fn supervise(id: CommandId, worker: JoinHandle<()>, lane: mpsc::Sender<LaneMsg>) {
    let Err(e) = worker.await else {
        return;
    };
    let reason = if e.is_panic() {
        let panic = e.into_panic();
        panic
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
            .unwrap_or_else(|| "panicked".to_string())
    } else {
        "cancelled".to_string()
    };
    let _ = lane.send(LaneMsg::Crashed { id, reason }).await;
}

/// One command's trip through the pool and the engine.
async fn work(
    shared: Arc<Shared>,
    server: Server,
    command: Command,
    stop: CancellationToken,
    lane: mpsc::Sender<LaneMsg>,
) {
    let id = command.id;
    let acquired = tokio::select! {
        result = shared.pool.acquire(&server, Some(id)) => result,
        _ = stop.cancelled() => return,
    };
    let mut lease = match acquired {
        Ok(lease) => lease,
        Err(error) => {
            let _ = lane.send(LaneMsg::Unavailable { id, error }).await;
            return;
        }
    };

    let (approve, approved) = oneshot::channel();
    if lane.send(LaneMsg::Acquired { id, approve }).await.is_err() {
        shared.pool.release(lease);
        return;
    }
    if !approved.await.unwrap_or(false) {
        shared.pool.release(lease);
        return;
    }

    let observer = BusObserver {
        shared: shared.clone(),
        command_id: id,
        server_id: server.id,
    };
    let line = command_line(&server, &command.text);
    let result = shared
        .engine
        .execute(&mut lease, &line, shared.options.command_timeout, &stop, &observer)
        .await;
    shared.pool.release(lease);

    let _ = lane.send(LaneMsg::Finished { id, result }).await;
}
