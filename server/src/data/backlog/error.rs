//! Backlog backend error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BacklogError {
    #[error("Backlog configuration error: {0}")]
    Config(String),

    #[error("Backlog connection error: {0}")]
    Connection(String),

    #[error("Store is read-only: {0}")]
    ReadOnly(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Backlog operation failed: {0}")]
    Operation(String),

    #[error("Subscription lagged by {0} messages")]
    Lagged(u64),

    #[error("Subscription closed")]
    Closed,

    #[error("Redis error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),

    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),
}

impl BacklogError {
    /// Transient failures are retried and may fall back to the in-memory queue
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BacklogError::Connection(_) | BacklogError::ReadOnly(_) | BacklogError::Pool(_)
        )
    }
}
