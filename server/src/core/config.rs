use std::fmt;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use super::cli::CliConfig;
use super::constants::{
    DEFAULT_CLEAR_EVERY, DEFAULT_HOST, DEFAULT_KEEPALIVE_INTERVAL_SECS,
    DEFAULT_LONG_POLLING_INTERVAL_MS, DEFAULT_MAX_BACKLOG_AGE_SECS, DEFAULT_MAX_BACKLOG_SIZE,
    DEFAULT_MAX_GLOBAL_BACKLOG_SIZE, DEFAULT_PORT, POSTGRES_DEFAULT_ACQUIRE_TIMEOUT_SECS,
    POSTGRES_DEFAULT_MAX_CONNECTIONS, POSTGRES_DEFAULT_MIN_CONNECTIONS,
};

// =============================================================================
// Backlog Backend Enum
// =============================================================================

/// Storage backend for channel backlogs and the firehose
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BacklogBackendType {
    #[default]
    Memory,
    Redis,
    Postgres,
}

impl fmt::Display for BacklogBackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BacklogBackendType::Memory => write!(f, "memory"),
            BacklogBackendType::Redis => write!(f, "redis"),
            BacklogBackendType::Postgres => write!(f, "postgres"),
        }
    }
}

// =============================================================================
// Config Sections
// =============================================================================

/// HTTP server binding
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Redis backend connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    pub url: String,
}

/// PostgreSQL backend connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub url: String,
    #[serde(default = "default_pg_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_pg_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_pg_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_pg_max_connections() -> u32 {
    POSTGRES_DEFAULT_MAX_CONNECTIONS
}

fn default_pg_min_connections() -> u32 {
    POSTGRES_DEFAULT_MIN_CONNECTIONS
}

fn default_pg_acquire_timeout_secs() -> u64 {
    POSTGRES_DEFAULT_ACQUIRE_TIMEOUT_SECS
}

/// Backlog store selection and retention bounds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BacklogConfig {
    pub backend: BacklogBackendType,
    pub redis: Option<RedisConfig>,
    pub postgres: Option<PostgresConfig>,
    pub max_backlog_size: u64,
    pub max_global_backlog_size: u64,
    pub max_backlog_age_secs: u64,
    pub clear_every: u64,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            backend: BacklogBackendType::Memory,
            redis: None,
            postgres: None,
            max_backlog_size: DEFAULT_MAX_BACKLOG_SIZE,
            max_global_backlog_size: DEFAULT_MAX_GLOBAL_BACKLOG_SIZE,
            max_backlog_age_secs: DEFAULT_MAX_BACKLOG_AGE_SECS,
            clear_every: DEFAULT_CLEAR_EVERY,
        }
    }
}

impl BacklogConfig {
    pub fn max_backlog_age(&self) -> Duration {
        Duration::from_secs(self.max_backlog_age_secs)
    }
}

/// Bus behavior toggles
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    pub long_polling_enabled: bool,
    pub long_polling_interval_ms: u64,
    pub chunked_encoding_enabled: bool,
    pub allow_broadcast: bool,
    /// Heartbeat publish interval; values below the minimum disable it
    pub keepalive_interval_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            long_polling_enabled: true,
            long_polling_interval_ms: DEFAULT_LONG_POLLING_INTERVAL_MS,
            chunked_encoding_enabled: true,
            allow_broadcast: false,
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL_SECS,
        }
    }
}

impl BusConfig {
    pub fn long_polling_interval(&self) -> Duration {
        Duration::from_millis(self.long_polling_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

// =============================================================================
// App Config
// =============================================================================

/// Fully resolved application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub backlog: BacklogConfig,
}

impl AppConfig {
    /// Build the configuration from defaults overlaid with CLI/env values
    pub fn load(cli: &CliConfig) -> Result<Self> {
        let mut config = Self::default();

        if let Some(host) = &cli.host {
            config.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            config.server.port = port;
        }

        if let Some(backend) = cli.backend {
            config.backlog.backend = backend;
        }
        if let Some(url) = &cli.redis_url {
            config.backlog.redis = Some(RedisConfig { url: url.clone() });
        }
        if let Some(url) = &cli.postgres_url {
            config.backlog.postgres = Some(PostgresConfig {
                url: url.clone(),
                max_connections: POSTGRES_DEFAULT_MAX_CONNECTIONS,
                min_connections: POSTGRES_DEFAULT_MIN_CONNECTIONS,
                acquire_timeout_secs: POSTGRES_DEFAULT_ACQUIRE_TIMEOUT_SECS,
            });
        }
        if let Some(size) = cli.max_backlog_size {
            config.backlog.max_backlog_size = size;
        }
        if let Some(size) = cli.max_global_backlog_size {
            config.backlog.max_global_backlog_size = size;
        }
        if let Some(age) = cli.max_backlog_age_secs {
            config.backlog.max_backlog_age_secs = age;
        }

        if let Some(interval) = cli.long_polling_interval_ms {
            config.bus.long_polling_interval_ms = interval;
            config.bus.long_polling_enabled = interval > 0;
        }
        if let Some(interval) = cli.keepalive_interval_secs {
            config.bus.keepalive_interval_secs = interval;
        }
        if let Some(allow) = cli.allow_broadcast {
            config.bus.allow_broadcast = allow;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        match self.backlog.backend {
            BacklogBackendType::Memory => {}
            BacklogBackendType::Redis => {
                if self.backlog.redis.is_none() {
                    bail!("redis backend selected but no redis URL configured");
                }
            }
            BacklogBackendType::Postgres => {
                if self.backlog.postgres.is_none() {
                    bail!("postgres backend selected but no postgres URL configured");
                }
            }
        }
        if self.backlog.max_backlog_size == 0 || self.backlog.max_global_backlog_size == 0 {
            bail!("backlog bounds must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.backlog.backend, BacklogBackendType::Memory);
        assert_eq!(config.backlog.max_backlog_size, 1000);
        assert_eq!(config.backlog.max_global_backlog_size, 2000);
        assert_eq!(config.bus.long_polling_interval_ms, 25_000);
        assert!(config.bus.long_polling_enabled);
        assert!(!config.bus.allow_broadcast);
    }

    #[test]
    fn test_backend_display() {
        assert_eq!(BacklogBackendType::Memory.to_string(), "memory");
        assert_eq!(BacklogBackendType::Redis.to_string(), "redis");
        assert_eq!(BacklogBackendType::Postgres.to_string(), "postgres");
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let mut config = AppConfig::default();
        config.backlog.backend = BacklogBackendType::Redis;
        assert!(config.validate().is_err());

        config.backlog.redis = Some(RedisConfig {
            url: "redis://localhost:6379/0".to_string(),
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_postgres_backend_requires_url() {
        let mut config = AppConfig::default();
        config.backlog.backend = BacklogBackendType::Postgres;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_backlog_bound_rejected() {
        let mut config = AppConfig::default();
        config.backlog.max_backlog_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = CliConfig {
            host: Some("0.0.0.0".to_string()),
            port: Some(9000),
            backend: None,
            redis_url: None,
            postgres_url: None,
            max_backlog_size: Some(5),
            max_global_backlog_size: None,
            max_backlog_age_secs: None,
            long_polling_interval_ms: Some(0),
            keepalive_interval_secs: None,
            allow_broadcast: Some(true),
        };
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.backlog.max_backlog_size, 5);
        assert!(!config.bus.long_polling_enabled);
        assert!(config.bus.allow_broadcast);
    }
}
