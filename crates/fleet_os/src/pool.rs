//! Connection pool: reusable authenticated sessions per server.
//!
//! Each server gets a semaphore sized to its `max_concurrent_commands`. A
//! [`Lease`] owns one permit and one session, so at most that many sessions
//! are ever leased for a server, and idle + leased never exceeds the limit.
//! Dropping a lease without [`ConnectionPool::release`] discards its session
//! and frees the slot.

use crate::retry::{with_retry, RetryConfig};
use crate::{ConnectTarget, Connector, RemoteSession};
use fleet_core::config::PoolConfig;
use fleet_core::{CommandId, CredentialVault, FleetError, FleetResult, Server, ServerId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct IdleConnection {
    session: Box<dyn RemoteSession>,
    last_used_at: Instant,
}

struct ServerSlots {
    limit: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
}

impl ServerSlots {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            permits: Arc::new(Semaphore::new(limit)),
            idle: Mutex::new(Vec::new()),
        }
    }

    fn idle(&self) -> MutexGuard<'_, Vec<IdleConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Most recently used live connection, discarding stale ones on the way.
    fn take_idle(&self, ttl: Duration) -> Option<Box<dyn RemoteSession>> {
        let mut idle = self.idle();
        while let Some(conn) = idle.pop() {
            if conn.last_used_at.elapsed() <= ttl && !conn.session.is_closed() {
                return Some(conn.session);
            }
            discard(conn.session);
        }
        None
    }

    fn reap(&self, ttl: Duration) -> usize {
        let mut idle = self.idle();
        let before = idle.len();
        let (keep, stale): (Vec<_>, Vec<_>) = idle
            .drain(..)
            .partition(|c| c.last_used_at.elapsed() <= ttl && !c.session.is_closed());
        *idle = keep;
        for conn in stale {
            discard(conn.session);
        }
        before - idle.len()
    }
}

/// Close a session in the background, if there is a runtime to do it on.
fn discard(mut session: Box<dyn RemoteSession>) {
    if let Ok(rt) = tokio::runtime::Handle::try_current() {
        rt.spawn(async move { session.close().await });
    }
}

// ============================================================================
// Lease
// ============================================================================

/// Exclusive use of one pooled connection. Holding it is what allows a
/// command to run; only one execution happens per lease at a time.
pub struct Lease {
    server_id: ServerId,
    holder: Option<CommandId>,
    session: Option<Box<dyn RemoteSession>>,
    slots: Arc<ServerSlots>,
    fresh: bool,
    poisoned: bool,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn holder(&self) -> Option<CommandId> {
        self.holder
    }

    /// True when the session was opened for this lease rather than reused.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Mark the session unusable so `release` discards it.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub(crate) fn session_mut(&mut self) -> Option<&mut Box<dyn RemoteSession>> {
        self.session.as_mut()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::debug!("Lease for {} dropped unreleased, discarding session", self.server_id);
            discard(session);
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    vault: Arc<CredentialVault>,
    retry: RetryConfig,
    idle_ttl: Duration,
    servers: Mutex<HashMap<ServerId, Arc<ServerSlots>>>,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        vault: Arc<CredentialVault>,
        config: &PoolConfig,
    ) -> Self {
        Self::with_retry(connector, vault, RetryConfig::from(config), config.idle_ttl())
    }

    pub fn with_retry(
        connector: Arc<dyn Connector>,
        vault: Arc<CredentialVault>,
        retry: RetryConfig,
        idle_ttl: Duration,
    ) -> Self {
        Self {
            connector,
            vault,
            retry,
            idle_ttl,
            servers: Mutex::new(HashMap::new()),
        }
    }

    fn servers(&self) -> MutexGuard<'_, HashMap<ServerId, Arc<ServerSlots>>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slots_for(&self, server: &Server) -> Arc<ServerSlots> {
        self.servers()
            .entry(server.id)
            .or_insert_with(|| Arc::new(ServerSlots::new(server.slots())))
            .clone()
    }

    /// Wait for a free slot on `server`, then hand out an idle connection or
    /// open a new one (with bounded retries).
    pub async fn acquire(&self, server: &Server, holder: Option<CommandId>) -> FleetResult<Lease> {
        let slots = self.slots_for(server);
        let permit = slots
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FleetError::ServerUnavailable(format!("pool for {} is closed", server.name)))?;

        if let Some(session) = slots.take_idle(self.idle_ttl) {
            return Ok(Lease {
                server_id: server.id,
                holder,
                session: Some(session),
                slots,
                fresh: false,
                poisoned: false,
                _permit: permit,
            });
        }

        // On failure the permit drops here and the slot is free again
        let session = self.establish(server).await?;
        Ok(Lease {
            server_id: server.id,
            holder,
            session: Some(session),
            slots,
            fresh: true,
            poisoned: false,
            _permit: permit,
        })
    }

    async fn establish(&self, server: &Server) -> FleetResult<Box<dyn RemoteSession>> {
        let credential = self.vault.resolve(&server.credential_ref).await?;
        let target = ConnectTarget::from(server);
        with_retry(&self.retry, &server.name, |_| {
            self.connector.connect(&target, &credential)
        })
        .await
    }

    /// Return a lease's connection for reuse, or drop it if it went bad.
    pub fn release(&self, mut lease: Lease) {
        let Some(session) = lease.session.take() else {
            return;
        };
        if lease.poisoned || session.is_closed() {
            tracing::debug!("Discarding {} connection for {}", session.name(), lease.server_id);
            discard(session);
            return;
        }
        lease.slots.idle().push(IdleConnection {
            session,
            last_used_at: Instant::now(),
        });
    }

    /// Open and close a session without touching the pool. Single attempt.
    pub async fn probe(&self, server: &Server) -> FleetResult<()> {
        let credential = self.vault.resolve(&server.credential_ref).await?;
        let mut session = self
            .connector
            .connect(&ConnectTarget::from(server), &credential)
            .await?;
        session.close().await;
        Ok(())
    }

    /// Drop all idle connections for a server and size its slots afresh on
    /// the next acquire. Outstanding leases keep their old slots.
    pub fn forget(&self, server_id: ServerId) {
        if let Some(slots) = self.servers().remove(&server_id) {
            for conn in slots.idle().drain(..) {
                discard(conn.session);
            }
        }
    }

    /// Close idle connections older than the TTL. Returns how many closed.
    pub fn reap_idle(&self) -> usize {
        let all: Vec<Arc<ServerSlots>> = self.servers().values().cloned().collect();
        all.iter().map(|slots| slots.reap(self.idle_ttl)).sum()
    }

    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                let closed = pool.reap_idle();
                if closed > 0 {
                    tracing::debug!("Closed {} idle connections past TTL", closed);
                }
            }
        })
    }

    pub fn idle_count(&self, server_id: ServerId) -> usize {
        self.servers()
            .get(&server_id)
            .map(|slots| slots.idle().len())
            .unwrap_or(0)
    }

    /// Slots not currently leased; `None` for a server never acquired.
    pub fn available_slots(&self, server_id: ServerId) -> Option<usize> {
        self.servers()
            .get(&server_id)
            .map(|slots| slots.permits.available_permits())
    }

    pub fn slot_limit(&self, server_id: ServerId) -> Option<usize> {
        self.servers().get(&server_id).map(|slots| slots.limit)
    }
}
