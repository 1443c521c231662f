// =============================================================================
// Application Identity
// =============================================================================

/// Application name in lowercase (for paths and identifiers)
pub const APP_NAME_LOWER: &str = "fanline";

// =============================================================================
// Environment Variables
// =============================================================================

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "FANLINE_LOG";

/// Environment variable for server host
pub const ENV_HOST: &str = "FANLINE_HOST";

/// Environment variable for server port
pub const ENV_PORT: &str = "FANLINE_PORT";

/// Environment variable for the backlog backend (memory, redis or postgres)
pub const ENV_BACKLOG_BACKEND: &str = "FANLINE_BACKEND";

/// Environment variable for the Redis URL
pub const ENV_REDIS_URL: &str = "FANLINE_REDIS_URL";

/// Environment variable for the PostgreSQL URL
pub const ENV_POSTGRES_URL: &str = "FANLINE_POSTGRES_URL";

/// Environment variable for the long-poll hold interval in milliseconds
pub const ENV_LONG_POLLING_INTERVAL_MS: &str = "FANLINE_LONG_POLLING_INTERVAL_MS";

/// Environment variable for the keepalive interval in seconds
pub const ENV_KEEPALIVE_INTERVAL_SECS: &str = "FANLINE_KEEPALIVE_INTERVAL_SECS";

/// Environment variable enabling the broadcast endpoint
pub const ENV_ALLOW_BROADCAST: &str = "FANLINE_ALLOW_BROADCAST";

/// Environment variable for the per-channel backlog bound
pub const ENV_MAX_BACKLOG_SIZE: &str = "FANLINE_MAX_BACKLOG_SIZE";

/// Environment variable for the global backlog bound
pub const ENV_MAX_GLOBAL_BACKLOG_SIZE: &str = "FANLINE_MAX_GLOBAL_BACKLOG_SIZE";

/// Environment variable for the backlog age bound in seconds
pub const ENV_MAX_BACKLOG_AGE_SECS: &str = "FANLINE_MAX_BACKLOG_AGE_SECS";

// =============================================================================
// Server Defaults
// =============================================================================

/// Default server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default server port
pub const DEFAULT_PORT: u16 = 4550;

/// Base path segment for the polling endpoint
pub const MESSAGE_BUS_PATH: &str = "/message-bus";

/// Graceful shutdown timeout for background tasks
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// Channel Naming
// =============================================================================

/// Separator appended between a channel name and its site id
pub const SITE_SEPARATOR: &str = "$|$";

/// Prefix marking a tenant-wide channel (never site-scoped)
pub const GLOBAL_CHANNEL_PREFIX: &str = "/global/";

/// Escape sequence replacing `|` inside wire-encoded channel names
pub const PIPE_ESCAPE: &str = "$$123$$";

/// Synthetic channel carrying consolidated `{channel: last_id}` maps
pub const STATUS_CHANNEL: &str = "/__status";

/// Synthetic channel instructing consumers to reset their cursors
pub const FLUSH_CHANNEL: &str = "/__flush";

/// Channel carrying keepalive heartbeats
pub const KEEPALIVE_CHANNEL: &str = "/__mb_keepalive__/";

/// Path prefix reserved for the external diagnostics subsystem
pub const DIAGNOSTICS_PREFIX: &str = "/_diagnostics";

/// Sentinel payload published to wake up a blocked firehose subscription
pub const UNSUBSCRIBE_SENTINEL: &str = "$$UNSUBSCRIBE";

// =============================================================================
// Backlog Defaults
// =============================================================================

/// Default per-channel backlog bound (entries)
pub const DEFAULT_MAX_BACKLOG_SIZE: u64 = 1000;

/// Default global backlog bound (entries)
pub const DEFAULT_MAX_GLOBAL_BACKLOG_SIZE: u64 = 2000;

/// Default backlog age bound (7 days)
pub const DEFAULT_MAX_BACKLOG_AGE_SECS: u64 = 7 * 24 * 60 * 60;

/// Trim backlogs on every publish whose id is divisible by this
pub const DEFAULT_CLEAR_EVERY: u64 = 1;

/// Memory backend TTL sweep interval
pub const MEMORY_SWEEP_INTERVAL_MS: u64 = 1000;

/// Bound on the in-memory publish queue used while a store is read-only
pub const IN_MEMORY_QUEUE_LIMIT: usize = 1000;

/// Capacity of the in-process firehose broadcast channel
pub const FIREHOSE_CHANNEL_CAPACITY: usize = 10_000;

// =============================================================================
// Firehose Recovery
// =============================================================================

/// Bounded retries while replaying a gap in global ids
pub const GAP_RETRY_COUNT: u32 = 4;

/// Upper bound of the random backoff between gap replays (milliseconds)
pub const GAP_RETRY_MAX_BACKOFF_MS: u64 = 50;

/// Delay before the subscriber task reconnects after a backend error
pub const SUBSCRIBER_RETRY_DELAY_MS: u64 = 1000;

// =============================================================================
// Long Poll / Keepalive Defaults
// =============================================================================

/// Default long-poll hold interval (milliseconds)
pub const DEFAULT_LONG_POLLING_INTERVAL_MS: u64 = 25_000;

/// Default keepalive publish interval (seconds)
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 60;

/// Keepalive intervals below this disable the heartbeat entirely
pub const KEEPALIVE_MIN_INTERVAL_SECS: u64 = 20;

/// Grace window between triggering shutdown and force-exiting on a dead firehose
pub const KEEPALIVE_EXIT_GRACE_SECS: u64 = 5;

/// User id the keepalive heartbeat is restricted to
pub const KEEPALIVE_USER_ID: i64 = -1;

// =============================================================================
// Redis Backend Keys
// =============================================================================

/// Sorted-set key prefix for per-channel backlogs (score = message id)
pub const REDIS_BACKLOG_KEY_PREFIX: &str = "__mb_backlog_n_";

/// Counter key prefix for per-channel ids
pub const REDIS_BACKLOG_ID_KEY_PREFIX: &str = "__mb_backlog_id_n_";

/// Sorted-set key for the global backlog (score = global id)
pub const REDIS_GLOBAL_BACKLOG_KEY: &str = "__mb_global_backlog_n";

/// Counter key for the global id
pub const REDIS_GLOBAL_ID_KEY: &str = "__mb_global_id_n";

/// PUBSUB / NOTIFY channel prefix, suffixed with the database index or name
pub const NOTIFY_CHANNEL_PREFIX: &str = "_message_bus_";

// =============================================================================
// PostgreSQL Backend Defaults
// =============================================================================

pub const POSTGRES_DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const POSTGRES_DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const POSTGRES_DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// Poll interval inside the notify wait loop so cancellation stays responsive
pub const POSTGRES_NOTIFY_POLL_SECS: u64 = 10;
