//! Backlog backend trait definition
//!
//! Defines the contract every backlog store implements (memory, Redis,
//! PostgreSQL). A backend owns two bounded logical sequences — the
//! per-channel backlog ordered by `message_id` and the global backlog ordered
//! by `global_id` — plus a blocking notification stream (the firehose).
//!
//! The raw firehose carries notifications in whatever order the transport
//! delivers them; ordered replay with gap recovery is layered on top by
//! [`super::firehose::Firehose`].

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use super::error::BacklogError;
use super::message::Message;

/// Event received from the raw firehose
#[derive(Debug, Clone)]
pub enum FirehoseEvent {
    /// A published message, decoded from the wire form
    Message(Message),
    /// The distinguished unsubscribe sentinel was observed
    Unsubscribe,
}

/// Subscription to the raw firehose
pub struct FirehoseSubscription {
    /// Stream of received events; blocks until a publish or the sentinel
    pub receiver: Pin<Box<dyn Stream<Item = Result<FirehoseEvent, BacklogError>> + Send>>,
}

/// Per-publish overrides and queueing policy
#[derive(Debug, Clone)]
pub struct PublishOpts {
    /// Override of the per-channel backlog bound
    pub max_backlog_size: Option<u64>,
    /// Override of the backlog age bound
    pub max_backlog_age: Option<Duration>,
    /// Buffer the publish in memory when the store is temporarily read-only
    pub queue_in_memory: bool,
}

impl Default for PublishOpts {
    fn default() -> Self {
        Self {
            max_backlog_size: None,
            max_backlog_age: None,
            queue_in_memory: true,
        }
    }
}

/// Backlog backend trait
///
/// Implementations must make `publish` atomic with respect to id allocation
/// and backlog append: no successful publish may be silently dropped, and ids
/// are strictly increasing and never reused until `reset`.
#[async_trait]
pub trait BacklogBackend: Send + Sync {
    /// Append a payload to a channel
    ///
    /// Atomically increments the global and per-channel counters, appends to
    /// both backlogs, trims them, and notifies the firehose. Returns the
    /// allocated global id, or `None` when the store was read-only and the
    /// publish was buffered for the flusher.
    async fn publish(
        &self,
        channel: &str,
        payload: &str,
        opts: &PublishOpts,
    ) -> Result<Option<u64>, BacklogError>;

    /// Highest message id ever published to a channel, 0 when absent
    async fn last_id(&self, channel: &str) -> Result<u64, BacklogError>;

    /// Highest message ids for several channels, 0 for absent ones
    async fn last_ids(&self, channels: &[String]) -> Result<Vec<u64>, BacklogError>;

    /// All retained messages with `message_id > since_id`, in id order
    async fn backlog(&self, channel: &str, since_id: u64) -> Result<Vec<Message>, BacklogError>;

    /// All retained messages with `global_id > since_global_id`, in id order
    async fn global_backlog(&self, since_global_id: u64) -> Result<Vec<Message>, BacklogError>;

    /// Fetch a single retained message, `None` when trimmed or never published
    async fn get_message(
        &self,
        channel: &str,
        message_id: u64,
    ) -> Result<Option<Message>, BacklogError>;

    /// Open the raw firehose
    async fn global_subscribe(&self) -> Result<FirehoseSubscription, BacklogError>;

    /// Wake up the firehose by publishing the unsubscribe sentinel
    async fn global_unsubscribe(&self) -> Result<(), BacklogError>;

    /// Drop all state; counters restart from 1
    async fn reset(&self) -> Result<(), BacklogError>;

    /// Drop all retained messages but keep the id counters
    async fn expire_all_backlogs(&self) -> Result<(), BacklogError>;

    /// Re-validate connections after a process fork
    async fn after_fork(&self) -> Result<(), BacklogError>;

    /// Backend name for debugging/logging
    fn backend_name(&self) -> &'static str;
}
