//! Command queue and dispatcher.
//!
//! Commands are queued per server and run through the connection pool and
//! execution engine. Each server has one lane task that serializes every
//! state change for that server; lanes run independently of each other.

pub mod dispatcher;
pub mod health;
mod lane;
pub mod notify;

pub use dispatcher::{Dispatcher, Recovery};
pub use health::{HealthMonitor, ProbeOutcome};
pub use notify::{EventBus, Subscription, Topic};

use fleet_core::{Command, CommandEvent, FleetConfig, FleetResult, Store, Transition};
use fleet_os::{ConnectionPool, ExecutionEngine};
use std::sync::Arc;
use std::time::Duration;

/// Dispatcher tuning taken from configuration.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub command_timeout: Duration,
    pub max_queue_depth: usize,
    pub default_max_concurrent: u32,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self::from(&FleetConfig::default())
    }
}

impl From<&FleetConfig> for DispatchOptions {
    fn from(config: &FleetConfig) -> Self {
        Self {
            command_timeout: config.execution.timeout(),
            max_queue_depth: config.dispatch.max_queue_depth,
            default_max_concurrent: config.dispatch.default_max_concurrent.max(1),
        }
    }
}

/// What lanes and workers share.
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) engine: Arc<ExecutionEngine>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) options: DispatchOptions,
}

impl Shared {
    /// Audit and broadcast a command's current state.
    pub(crate) async fn announce(&self, command: &Command) -> FleetResult<()> {
        self.store.record(&Transition::from(command)).await?;
        self.bus.publish(CommandEvent::transition(command));
        Ok(())
    }

    /// Persist a command's latest transition, then audit and broadcast it.
    pub(crate) async fn commit(&self, command: &Command) -> FleetResult<()> {
        self.store.update_command(command).await?;
        self.announce(command).await
    }
}
