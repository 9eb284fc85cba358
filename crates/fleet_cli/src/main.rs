mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_core::config::Transport;
use fleet_core::{CredentialVault, FleetConfig, SecretBackend, Store, VaultKey};
use fleet_dispatch::{Dispatcher, EventBus, HealthMonitor};
use fleet_gateway::GatewayServer;
use fleet_os::{Connector, ConnectionPool, ExecutionEngine, LocalConnector, SshConnector};
use fleet_store::SqliteStore;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fleetd", author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path (overrides the config file)
    #[arg(long)]
    db: Option<String>,

    /// Address the gateway binds to
    #[arg(long)]
    host: Option<String>,

    /// Port the gateway listens on
    #[arg(short, long)]
    port: Option<u16>,

    /// Emit logs as JSON lines
    #[arg(long, env = "FLEET_LOG_JSON")]
    log_json: bool,

    /// Write logs to a daily rolling file in this directory
    #[arg(long, env = "FLEET_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

/// `--config`, else `./fleet.toml`, else `<config dir>/fleet/fleet.toml`.
fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    let local = PathBuf::from("fleet.toml");
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("fleet").join("fleet.toml"))
        .filter(|path| path.exists())
        .unwrap_or(local)
}

/// A config file that was named or found must load; defaults are only used
/// when there is none.
fn load_config(args: &Args) -> Result<FleetConfig> {
    let path = config_path(args.config.clone());
    let mut config = if args.config.is_some() || path.exists() {
        info!("Loading config from {}", path.display());
        FleetConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?
    } else {
        info!("No config file found, using defaults");
        FleetConfig::load_or_default(&path)
    };
    if let Some(db) = &args.db {
        config.storage.db_path = db.clone();
    }
    if let Some(host) = &args.host {
        config.gateway.host = host.clone();
    }
    if let Some(port) = args.port {
        config.gateway.port = port;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let _log_guard = logging::init(args.log_json, args.log_dir.as_deref())?;

    let config = load_config(&args)?;
    run(config).await
}

async fn run(config: FleetConfig) -> Result<()> {
    info!("Starting fleetd...");

    info!("Opening database at {}...", config.storage.db_path);
    let store = Arc::new(
        SqliteStore::new(&config.storage.db_path)
            .await
            .context("Failed to open database")?,
    );

    let key = VaultKey::load_or_create(&config.vault.key_path)
        .with_context(|| format!("Failed to load vault key from {}", config.vault.key_path))?;
    let vault = Arc::new(CredentialVault::new(
        key,
        store.clone() as Arc<dyn SecretBackend>,
    ));

    let connector: Arc<dyn Connector> = match config.pool.transport {
        Transport::Ssh => Arc::new(SshConnector::new(config.pool.connect_timeout())),
        Transport::Local => {
            warn!("Using the local transport: commands run on this host");
            Arc::new(LocalConnector::new())
        }
    };
    info!("Using {} for server sessions", connector.name());

    let pool = Arc::new(ConnectionPool::new(connector, vault.clone(), &config.pool));
    let reaper = pool.spawn_reaper(Duration::from_secs(config.pool.reap_interval_secs.max(1)));
    let engine = Arc::new(ExecutionEngine::new(&config.execution));
    let bus = Arc::new(EventBus::new(config.notify.subscriber_backlog));

    let dispatcher = Dispatcher::new(
        store as Arc<dyn Store>,
        vault,
        pool,
        engine,
        bus,
        &config,
    );
    let recovery = dispatcher
        .recover()
        .await
        .context("Failed to recover commands from the previous run")?;
    info!(
        "Recovery: {} interrupted, {} re-queued",
        recovery.interrupted, recovery.requeued
    );

    let shutdown = CancellationToken::new();
    let health = if config.health.enabled {
        let interval = Duration::from_secs(config.health.interval_secs.max(1));
        Some(HealthMonitor::new(dispatcher.clone(), interval).spawn(shutdown.clone()))
    } else {
        info!("Health monitor disabled");
        None
    };

    let gateway = GatewayServer::new(dispatcher, &config.gateway.host, config.gateway.port);
    let subscribers = gateway.active_connections();
    let gateway = gateway.start(shutdown.clone());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!(
        "Shutting down with {} open event streams...",
        subscribers.load(Ordering::Relaxed)
    );
    shutdown.cancel();
    reaper.abort();
    if let Some(health) = health {
        let _ = health.await;
    }
    if tokio::time::timeout(Duration::from_secs(10), gateway).await.is_err() {
        warn!("Gateway did not stop within 10s");
    }
    info!("fleetd stopped");
    Ok(())
}
