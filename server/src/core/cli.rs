use clap::{Parser, Subcommand};

use super::config::BacklogBackendType;
use super::constants::{
    ENV_ALLOW_BROADCAST, ENV_BACKLOG_BACKEND, ENV_HOST, ENV_KEEPALIVE_INTERVAL_SECS,
    ENV_LONG_POLLING_INTERVAL_MS, ENV_MAX_BACKLOG_AGE_SECS, ENV_MAX_BACKLOG_SIZE,
    ENV_MAX_GLOBAL_BACKLOG_SIZE, ENV_PORT, ENV_POSTGRES_URL, ENV_REDIS_URL,
};

#[derive(Parser)]
#[command(name = "fanline")]
#[command(version, about = "Reliable pub/sub message bus over HTTP long polling", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server host address
    #[arg(long, short = 'H', global = true, env = ENV_HOST)]
    pub host: Option<String>,

    /// Server port
    #[arg(long, short = 'p', global = true, env = ENV_PORT)]
    pub port: Option<u16>,

    /// Backlog backend (memory, redis or postgres)
    #[arg(long, global = true, env = ENV_BACKLOG_BACKEND, value_parser = parse_backend_type)]
    pub backend: Option<BacklogBackendType>,

    /// Redis URL for the redis backend (redis://host:port/db)
    #[arg(long, global = true, env = ENV_REDIS_URL)]
    pub redis_url: Option<String>,

    /// PostgreSQL URL for the postgres backend
    #[arg(long, global = true, env = ENV_POSTGRES_URL)]
    pub postgres_url: Option<String>,

    /// Per-channel backlog bound (entries)
    #[arg(long, global = true, env = ENV_MAX_BACKLOG_SIZE)]
    pub max_backlog_size: Option<u64>,

    /// Global backlog bound (entries)
    #[arg(long, global = true, env = ENV_MAX_GLOBAL_BACKLOG_SIZE)]
    pub max_global_backlog_size: Option<u64>,

    /// Backlog age bound in seconds
    #[arg(long, global = true, env = ENV_MAX_BACKLOG_AGE_SECS)]
    pub max_backlog_age_secs: Option<u64>,

    /// Long-poll hold interval in milliseconds (0 disables long polling)
    #[arg(long, global = true, env = ENV_LONG_POLLING_INTERVAL_MS)]
    pub long_polling_interval_ms: Option<u64>,

    /// Keepalive publish interval in seconds (below 20 disables it)
    #[arg(long, global = true, env = ENV_KEEPALIVE_INTERVAL_SECS)]
    pub keepalive_interval_secs: Option<u64>,

    /// Enable the HTTP broadcast publish endpoint
    #[arg(long, global = true, env = ENV_ALLOW_BROADCAST)]
    pub allow_broadcast: Option<bool>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Start the message bus server (default)
    Start,
}

/// Plain-data view of the parsed CLI options
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub backend: Option<BacklogBackendType>,
    pub redis_url: Option<String>,
    pub postgres_url: Option<String>,
    pub max_backlog_size: Option<u64>,
    pub max_global_backlog_size: Option<u64>,
    pub max_backlog_age_secs: Option<u64>,
    pub long_polling_interval_ms: Option<u64>,
    pub keepalive_interval_secs: Option<u64>,
    pub allow_broadcast: Option<bool>,
}

fn parse_backend_type(s: &str) -> Result<BacklogBackendType, String> {
    match s.to_lowercase().as_str() {
        "memory" => Ok(BacklogBackendType::Memory),
        "redis" => Ok(BacklogBackendType::Redis),
        "postgres" | "postgresql" => Ok(BacklogBackendType::Postgres),
        other => Err(format!(
            "unknown backend '{other}' (expected memory, redis or postgres)"
        )),
    }
}

/// Parse process arguments into the plain config plus the selected command
pub fn parse() -> (CliConfig, Option<Commands>) {
    let cli = Cli::parse();

    let config = CliConfig {
        host: cli.host,
        port: cli.port,
        backend: cli.backend,
        redis_url: cli.redis_url,
        postgres_url: cli.postgres_url,
        max_backlog_size: cli.max_backlog_size,
        max_global_backlog_size: cli.max_global_backlog_size,
        max_backlog_age_secs: cli.max_backlog_age_secs,
        long_polling_interval_ms: cli.long_polling_interval_ms,
        keepalive_interval_secs: cli.keepalive_interval_secs,
        allow_broadcast: cli.allow_broadcast,
    };

    (config, cli.command)
}
