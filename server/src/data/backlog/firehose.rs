//! Ordered delivery over the raw firehose
//!
//! Backends notify in transport order, which may lag, drop or duplicate
//! around reconnects. [`Firehose`] wraps any backend and yields messages in
//! strict `global_id` order:
//!
//! 1. consecutive id: yield and advance
//! 2. gap: replay the global backlog with bounded retries and a short random
//!    backoff; if the missing id never appears, yield whatever newer messages
//!    are retained, in id order
//! 3. id at or below the high-water mark: drop
//!
//! When resuming from a historical id the retained backlog is drained first
//! and the delivered ids are kept in a guard set; a notification whose id is
//! in the set is suppressed once, and the set is cleared as soon as a fresh
//! id arrives.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use rand::Rng;

use super::backend::{BacklogBackend, FirehoseEvent};
use super::error::BacklogError;
use super::message::Message;
use crate::core::constants::{GAP_RETRY_COUNT, GAP_RETRY_MAX_BACKOFF_MS};

pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message, BacklogError>> + Send>>;

/// Ordered-recovery view of a backend's firehose
#[derive(Clone)]
pub struct Firehose {
    backend: Arc<dyn BacklogBackend>,
}

impl Firehose {
    pub fn new(backend: Arc<dyn BacklogBackend>) -> Self {
        Self { backend }
    }

    /// Subscribe to every message after `last_id`, in `global_id` order
    ///
    /// The raw subscription is opened before this returns, so nothing
    /// published afterwards is missed. The stream ends when the unsubscribe
    /// sentinel is observed. Transport errors other than lag are surfaced
    /// once and end the stream; the caller decides whether to resubscribe
    /// from its high-water mark.
    pub async fn global_subscribe(
        &self,
        last_id: Option<u64>,
    ) -> Result<MessageStream, BacklogError> {
        let backend = Arc::clone(&self.backend);
        let mut sub = backend.global_subscribe().await?;

        let stream = async_stream::stream! {
            let mut highest = last_id.unwrap_or(0);
            let mut guard: HashSet<u64> = HashSet::new();

            // Resuming from a historical id: drain the retained backlog first
            // and remember what was delivered so the notifications that raced
            // with the drain are suppressed.
            if last_id.is_some() {
                let missed = match backend.global_backlog(highest).await {
                    Ok(missed) => missed,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                for msg in missed {
                    if msg.global_id > highest {
                        highest = msg.global_id;
                        guard.insert(msg.global_id);
                        yield Ok(msg);
                    }
                }
            }

            while let Some(event) = sub.receiver.next().await {
                let msg = match event {
                    Ok(FirehoseEvent::Message(msg)) => msg,
                    Ok(FirehoseEvent::Unsubscribe) => break,
                    Err(BacklogError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "firehose subscription lagged");
                        continue;
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                if !guard.is_empty() {
                    if guard.remove(&msg.global_id) {
                        continue;
                    }
                    // First fresh id ends the startup window
                    guard.clear();
                }

                if msg.global_id <= highest {
                    continue;
                }

                if msg.global_id == highest + 1 {
                    highest = msg.global_id;
                    yield Ok(msg);
                    continue;
                }

                // Gap: replay the retained global backlog until contiguous or
                // out of retries.
                let target = msg.global_id;
                let mut attempt: u32 = 0;
                loop {
                    let missed = match backend.global_backlog(highest).await {
                        Ok(missed) => missed,
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    };

                    for m in &missed {
                        if m.global_id == highest + 1 {
                            highest = m.global_id;
                            yield Ok(m.clone());
                        }
                    }
                    if highest >= target {
                        break;
                    }

                    attempt += 1;
                    if attempt > GAP_RETRY_COUNT {
                        tracing::warn!(
                            highest,
                            target,
                            "giving up on contiguous replay, skipping missing ids"
                        );
                        for m in missed {
                            if m.global_id > highest {
                                highest = m.global_id;
                                yield Ok(m);
                            }
                        }
                        if msg.global_id > highest {
                            highest = msg.global_id;
                            yield Ok(msg.clone());
                        }
                        break;
                    }

                    let backoff = rand::thread_rng().gen_range(0..=GAP_RETRY_MAX_BACKOFF_MS);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        };

        Ok(Box::pin(stream))
    }

    /// Convenience filter: messages on one channel, after `last_id`
    ///
    /// When `last_id` is given the retained channel backlog is drained first;
    /// the per-channel id cursor dedups anything the drain raced with.
    pub async fn subscribe(
        &self,
        channel: &str,
        last_id: Option<u64>,
    ) -> Result<MessageStream, BacklogError> {
        let backend = Arc::clone(&self.backend);
        let channel = channel.to_string();
        let mut global = self.global_subscribe(None).await?;

        let stream = async_stream::stream! {
            let mut last_message_id = 0u64;

            if let Some(since) = last_id {
                let missed = match backend.backlog(&channel, since).await {
                    Ok(missed) => missed,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                for msg in missed {
                    last_message_id = msg.message_id;
                    yield Ok(msg);
                }
            }

            while let Some(item) = global.next().await {
                match item {
                    Ok(msg) if msg.channel == channel => {
                        if msg.message_id > last_message_id {
                            last_message_id = msg.message_id;
                            yield Ok(msg);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
