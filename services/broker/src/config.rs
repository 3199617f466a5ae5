use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use warden_auth::AuthConfig;
use warden_liveness::{PostgresConfig, ReaperConfig};

// Broker service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // Client listener bind address.
    pub listen_bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // If false, every client is admitted anonymously.
    pub auth_required: bool,
    // User nkeys admitted without an operator vouch.
    pub allowed_keys: Vec<String>,
    // Operator nkeys allowed to vouch for users.
    pub trusted_keys: Vec<String>,
    // Max age of a nonce when the client answers it.
    pub nonce_ttl_ms: u64,
    // Deadline for the client to send CONNECT.
    pub handshake_timeout_ms: u64,
    // Longest protocol line accepted from a client.
    pub max_line_bytes: usize,
    // Operator seed for the server identity; ephemeral when unset.
    pub server_seed_file: Option<PathBuf>,
    pub heartbeat_interval_ms: u64,
    pub grace_period_ms: u64,
    pub sweep_interval_ms: u64,
    pub poison_retention_secs: u64,
    // Log lines admitted per diagnostic window.
    pub diagnostic_capacity: u64,
    pub diagnostic_window_ms: u64,
    pub storage: StorageBackend,
    pub postgres: Option<PostgresConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Self::Memory),
            "postgres" | "pg" => Ok(Self::Postgres),
            other => bail!("unknown storage backend: {other}"),
        }
    }
}

const DEFAULT_LISTEN_BIND: &str = "0.0.0.0:4222";
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";
const DEFAULT_NONCE_TTL_MS: u64 = 30_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
const DEFAULT_GRACE_PERIOD_MS: u64 = 60_000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 30_000;
const DEFAULT_POISON_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_DIAGNOSTIC_CAPACITY: u64 = 10;
const DEFAULT_DIAGNOSTIC_WINDOW_MS: u64 = 60_000;
const DEFAULT_PG_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_PG_ACQUIRE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Deserialize)]
struct BrokerConfigOverride {
    listen_bind: Option<String>,
    metrics_bind: Option<String>,
    auth_required: Option<bool>,
    allowed_keys: Option<Vec<String>>,
    trusted_keys: Option<Vec<String>>,
    nonce_ttl_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    max_line_bytes: Option<usize>,
    server_seed_file: Option<PathBuf>,
    heartbeat_interval_ms: Option<u64>,
    grace_period_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
    poison_retention_secs: Option<u64>,
    diagnostic_capacity: Option<u64>,
    diagnostic_window_ms: Option<u64>,
    storage: Option<String>,
    postgres: Option<PostgresOverride>,
}

#[derive(Debug, Deserialize)]
struct PostgresOverride {
    url: Option<String>,
    max_connections: Option<u32>,
    acquire_timeout_ms: Option<u64>,
}

// A set but unparsable value is an error, never a silent default.
fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parse {key}")),
        Err(_) => Ok(None),
    }
}

// Zero keeps the default.
fn env_u64(key: &str, default: u64) -> Result<u64> {
    Ok(env_parse::<u64>(key)?
        .filter(|value| *value > 0)
        .unwrap_or(default))
}

fn env_key_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        let listen_bind = std::env::var("WARDEN_LISTEN_BIND")
            .unwrap_or_else(|_| DEFAULT_LISTEN_BIND.to_string())
            .parse()
            .with_context(|| "parse WARDEN_LISTEN_BIND")?;
        let metrics_bind = std::env::var("WARDEN_BROKER_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse WARDEN_BROKER_METRICS_BIND")?;
        // Auth stays on unless explicitly disabled.
        let auth_required = std::env::var("WARDEN_AUTH_REQUIRED")
            .ok()
            .map(|value| !matches!(value.as_str(), "0" | "false" | "no"))
            .unwrap_or(true);
        let storage = match std::env::var("WARDEN_STORE_BACKEND") {
            Ok(value) => value
                .parse()
                .with_context(|| "parse WARDEN_STORE_BACKEND")?,
            Err(_) => StorageBackend::Memory,
        };
        let postgres = match std::env::var("WARDEN_PG_URL") {
            Ok(url) => Some(PostgresConfig {
                url,
                max_connections: env_parse::<u32>("WARDEN_PG_MAX_CONNECTIONS")?
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_PG_MAX_CONNECTIONS),
                acquire_timeout_ms: env_u64(
                    "WARDEN_PG_ACQUIRE_TIMEOUT_MS",
                    DEFAULT_PG_ACQUIRE_TIMEOUT_MS,
                )?,
            }),
            Err(_) => None,
        };
        let config = Self {
            listen_bind,
            metrics_bind,
            auth_required,
            allowed_keys: env_key_list("WARDEN_ALLOWED_KEYS"),
            trusted_keys: env_key_list("WARDEN_TRUSTED_KEYS"),
            nonce_ttl_ms: env_u64("WARDEN_NONCE_TTL_MS", DEFAULT_NONCE_TTL_MS)?,
            handshake_timeout_ms: env_u64(
                "WARDEN_HANDSHAKE_TIMEOUT_MS",
                DEFAULT_HANDSHAKE_TIMEOUT_MS,
            )?,
            max_line_bytes: env_parse::<usize>("WARDEN_MAX_LINE_BYTES")?
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_LINE_BYTES),
            server_seed_file: std::env::var("WARDEN_SERVER_SEED_FILE")
                .ok()
                .map(PathBuf::from),
            heartbeat_interval_ms: env_u64(
                "WARDEN_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            )?,
            // Zero is a valid grace period.
            grace_period_ms: env_parse::<u64>("WARDEN_GRACE_PERIOD_MS")?
                .unwrap_or(DEFAULT_GRACE_PERIOD_MS),
            sweep_interval_ms: env_u64("WARDEN_SWEEP_INTERVAL_MS", DEFAULT_SWEEP_INTERVAL_MS)?,
            poison_retention_secs: env_u64(
                "WARDEN_POISON_RETENTION_SECS",
                DEFAULT_POISON_RETENTION_SECS,
            )?,
            diagnostic_capacity: env_u64(
                "WARDEN_DIAGNOSTIC_CAPACITY",
                DEFAULT_DIAGNOSTIC_CAPACITY,
            )?,
            diagnostic_window_ms: env_u64(
                "WARDEN_DIAGNOSTIC_WINDOW_MS",
                DEFAULT_DIAGNOSTIC_WINDOW_MS,
            )?,
            storage,
            postgres,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("WARDEN_BROKER_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read WARDEN_BROKER_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
            config.validate()?;
        }
        Ok(config)
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: BrokerConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse broker config yaml")?;
        if let Some(value) = override_cfg.listen_bind {
            self.listen_bind = value.parse().with_context(|| "parse listen_bind")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.auth_required {
            self.auth_required = value;
        }
        if let Some(value) = override_cfg.allowed_keys {
            self.allowed_keys = value;
        }
        if let Some(value) = override_cfg.trusted_keys {
            self.trusted_keys = value;
        }
        if let Some(value) = override_cfg.nonce_ttl_ms
            && value > 0
        {
            self.nonce_ttl_ms = value;
        }
        if let Some(value) = override_cfg.handshake_timeout_ms
            && value > 0
        {
            self.handshake_timeout_ms = value;
        }
        if let Some(value) = override_cfg.max_line_bytes
            && value > 0
        {
            self.max_line_bytes = value;
        }
        if let Some(value) = override_cfg.server_seed_file {
            self.server_seed_file = Some(value);
        }
        if let Some(value) = override_cfg.heartbeat_interval_ms
            && value > 0
        {
            self.heartbeat_interval_ms = value;
        }
        if let Some(value) = override_cfg.grace_period_ms {
            self.grace_period_ms = value;
        }
        if let Some(value) = override_cfg.sweep_interval_ms
            && value > 0
        {
            self.sweep_interval_ms = value;
        }
        if let Some(value) = override_cfg.poison_retention_secs
            && value > 0
        {
            self.poison_retention_secs = value;
        }
        if let Some(value) = override_cfg.diagnostic_capacity
            && value > 0
        {
            self.diagnostic_capacity = value;
        }
        if let Some(value) = override_cfg.diagnostic_window_ms
            && value > 0
        {
            self.diagnostic_window_ms = value;
        }
        if let Some(value) = override_cfg.storage {
            self.storage = value.parse().with_context(|| "parse storage")?;
        }
        if let Some(pg) = override_cfg.postgres {
            let mut merged = self.postgres.clone().unwrap_or(PostgresConfig {
                url: String::new(),
                max_connections: DEFAULT_PG_MAX_CONNECTIONS,
                acquire_timeout_ms: DEFAULT_PG_ACQUIRE_TIMEOUT_MS,
            });
            if let Some(url) = pg.url {
                merged.url = url;
            }
            if let Some(value) = pg.max_connections
                && value > 0
            {
                merged.max_connections = value;
            }
            if let Some(value) = pg.acquire_timeout_ms
                && value > 0
            {
                merged.acquire_timeout_ms = value;
            }
            self.postgres = Some(merged);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.storage == StorageBackend::Postgres
            && self
                .postgres
                .as_ref()
                .is_none_or(|pg| pg.url.trim().is_empty())
        {
            bail!("postgres storage selected but WARDEN_PG_URL is not set");
        }
        Ok(())
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            auth_required: self.auth_required,
            allowed_keys: self.allowed_keys.clone(),
            trusted_keys: self.trusted_keys.clone(),
            nonce_ttl: Duration::from_millis(self.nonce_ttl_ms),
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            grace_period: Duration::from_millis(self.grace_period_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            poison_retention: Duration::from_secs(self.poison_retention_secs),
            diagnostic_capacity: self.diagnostic_capacity,
            diagnostic_window: Duration::from_millis(self.diagnostic_window_ms),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn diagnostic_window(&self) -> Duration {
        Duration::from_millis(self.diagnostic_window_ms)
    }
}
