use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub gateway: GatewayConfig,
    pub storage: StorageConfig,
    pub vault: VaultConfig,
    pub dispatch: DispatchConfig,
    pub pool: PoolConfig,
    pub execution: ExecutionConfig,
    pub notify: NotifyConfig,
    pub health: HealthConfig,
}

impl FleetConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    /// After loading, env var overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let mut config: FleetConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML config")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the pool or the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        let pool = &self.pool;
        if !pool.backoff_factor.is_finite() || pool.backoff_factor < 1.0 {
            anyhow::bail!(
                "pool.backoff_factor must be a finite number >= 1.0, got {}",
                pool.backoff_factor
            );
        }
        if pool.max_backoff_ms < pool.initial_backoff_ms {
            anyhow::bail!(
                "pool.max_backoff_ms ({}) is below pool.initial_backoff_ms ({})",
                pool.max_backoff_ms,
                pool.initial_backoff_ms
            );
        }
        if self.dispatch.max_queue_depth == 0 {
            anyhow::bail!("dispatch.max_queue_depth must be at least 1");
        }
        Ok(())
    }

    /// Try to load from path; if file doesn't exist, return defaults with env overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::info!("Config file not found or invalid ({}), using defaults", e);
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                cfg
            }
        }
    }

    /// Apply environment variable overrides on top of file-based config.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FLEET_DB_PATH") {
            self.storage.db_path = v;
        }
        if let Ok(v) = std::env::var("FLEET_HOST") {
            self.gateway.host = v;
        }
        if let Ok(v) = std::env::var("FLEET_PORT") {
            if let Ok(n) = v.parse() {
                self.gateway.port = n;
            }
        }
        if let Ok(v) = std::env::var("FLEET_VAULT_KEY_PATH") {
            self.vault.key_path = v;
        }
        if let Ok(v) = std::env::var("FLEET_COMMAND_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.execution.timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("FLEET_MAX_OUTPUT_BYTES") {
            if let Ok(n) = v.parse() {
                self.execution.max_output_bytes = n;
            }
        }
    }
}

// ============================================================================
// Sub-configs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8420,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "fleet.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// File holding the base64 sealing key; created on first start.
    pub key_path: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            key_path: "fleet.key".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Used when a server is registered without an explicit limit.
    pub default_max_concurrent: u32,
    /// Commands waiting per server before submissions are refused.
    pub max_queue_depth: usize,
    pub max_command_len: usize,
    pub blocked_commands: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent: 1,
            max_queue_depth: 256,
            max_command_len: 4096,
            blocked_commands: default_blocked_commands(),
        }
    }
}

fn default_blocked_commands() -> Vec<String> {
    vec![
        "rm -rf /".to_string(),
        "rm -rf /*".to_string(),
        "mkfs".to_string(),
        "dd if=".to_string(),
        ":(){ :|:& };:".to_string(),
        "> /dev/sda".to_string(),
    ]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub transport: Transport,
    pub idle_ttl_secs: u64,
    pub connect_timeout_secs: u64,
    /// Attempts per acquire, including the first.
    pub max_connect_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_factor: f64,
    pub reap_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Ssh,
            idle_ttl_secs: 300,
            connect_timeout_secs: 10,
            max_connect_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 5_000,
            backoff_factor: 2.0,
            reap_interval_secs: 30,
        }
    }
}

/// How sessions to servers are opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    #[default]
    Ssh,
    /// Run commands in a local shell, ignoring the server address. Meant for
    /// development setups.
    Local,
}

impl PoolConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub timeout_secs: u64,
    /// Per stream (stdout and stderr each).
    pub max_output_bytes: usize,
    /// How long a killed command may take to wind down before its
    /// connection is abandoned.
    pub kill_grace_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            max_output_bytes: 1024 * 1024,
            kill_grace_secs: 5,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Events buffered per subscriber before the oldest are dropped.
    pub subscriber_backlog: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            subscriber_backlog: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
