pub mod config;
pub mod error;
pub mod model;
pub mod policy;
pub mod vault;

pub use config::FleetConfig;
pub use error::{FleetError, FleetResult};
pub use model::*;
pub use policy::SubmissionPolicy;
pub use vault::{Credential, CredentialVault, Secret, SecretBackend, VaultKey};

use async_trait::async_trait;

/// Persistence for registered servers.
#[async_trait]
pub trait ServerRepository: Send + Sync {
    async fn insert_server(&self, server: &Server) -> anyhow::Result<()>;
    async fn update_server(&self, server: &Server) -> anyhow::Result<()>;
    async fn get_server(&self, id: ServerId) -> anyhow::Result<Option<Server>>;
    async fn list_servers(&self) -> anyhow::Result<Vec<Server>>;
    /// Remove a server and its command rows. Audit entries are kept.
    /// Returns `false` when there was no such server.
    async fn delete_server(&self, id: ServerId) -> anyhow::Result<bool>;
}

/// Persistence for command rows. The dispatcher is the only writer.
#[async_trait]
pub trait CommandRepository: Send + Sync {
    async fn insert_command(&self, command: &Command) -> anyhow::Result<()>;
    async fn update_command(&self, command: &Command) -> anyhow::Result<()>;
    async fn get_command(&self, id: CommandId) -> anyhow::Result<Option<Command>>;
    /// Newest first.
    async fn list_commands(&self, filter: &CommandFilter) -> anyhow::Result<Vec<Command>>;
    /// Oldest first, used when recovering after a restart.
    async fn commands_in_state(&self, state: CommandState) -> anyhow::Result<Vec<Command>>;
}

/// Append-only audit trail of command transitions.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Returns `false` when the (command, state) pair was already recorded.
    async fn record(&self, transition: &Transition) -> anyhow::Result<bool>;
    async fn query(&self, query: &AuditQuery) -> anyhow::Result<AuditPage>;
}

/// Everything the dispatcher persists, behind one handle.
pub trait Store: ServerRepository + CommandRepository + AuditLog {}

impl<T: ServerRepository + CommandRepository + AuditLog> Store for T {}
