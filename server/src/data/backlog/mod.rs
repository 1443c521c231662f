//! Durable channel/backlog layer
//!
//! Pluggable storage behind one contract: append-with-id, range read, trim
//! and a blocking firehose subscription.
//! - In-memory (default) — single-process, reference semantics
//! - Redis — sorted-set backlogs + PUBSUB notifications
//! - PostgreSQL — table-backed backlogs + LISTEN/NOTIFY

pub mod backend;
pub mod error;
pub mod firehose;
pub mod memory;
pub mod message;
pub mod postgres;
mod queue;
pub mod redis;

pub use backend::{BacklogBackend, FirehoseEvent, FirehoseSubscription, PublishOpts};
pub use error::BacklogError;
pub use firehose::{Firehose, MessageStream};
pub use memory::MemoryBacklogBackend;
pub use message::{Message, MessagePayload};
pub use postgres::PostgresBacklogBackend;
pub use redis::RedisBacklogBackend;

use std::sync::Arc;

use crate::core::config::{BacklogBackendType, BacklogConfig};

/// Construct the configured backend
pub async fn from_config(config: &BacklogConfig) -> Result<Arc<dyn BacklogBackend>, BacklogError> {
    let backend: Arc<dyn BacklogBackend> = match config.backend {
        BacklogBackendType::Memory => Arc::new(MemoryBacklogBackend::new(config)),
        BacklogBackendType::Redis => {
            let redis = config.redis.as_ref().ok_or_else(|| {
                BacklogError::Config("redis URL required for the redis backend".into())
            })?;
            Arc::new(RedisBacklogBackend::new(&redis.url, config).await?)
        }
        BacklogBackendType::Postgres => {
            let postgres = config.postgres.as_ref().ok_or_else(|| {
                BacklogError::Config("postgres URL required for the postgres backend".into())
            })?;
            Arc::new(PostgresBacklogBackend::new(postgres, config).await?)
        }
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_defaults_to_memory() {
        let backend = from_config(&BacklogConfig::default()).await.unwrap();
        assert_eq!(backend.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_from_config_rejects_missing_urls() {
        let mut config = BacklogConfig::default();
        config.backend = BacklogBackendType::Redis;
        assert!(matches!(
            from_config(&config).await,
            Err(BacklogError::Config(_))
        ));

        config.backend = BacklogBackendType::Postgres;
        assert!(matches!(
            from_config(&config).await,
            Err(BacklogError::Config(_))
        ));
    }
}
