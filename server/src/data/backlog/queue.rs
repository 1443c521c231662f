//! Bounded in-memory publish queue
//!
//! Shared by the Redis and PostgreSQL backends: while the store is
//! temporarily read-only, publishes are buffered here (drop-oldest on
//! overflow, logged at WARN — the only tolerated data loss besides backlog
//! trimming) and a single flusher drains the queue once the store accepts
//! writes again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::backend::PublishOpts;
use crate::core::constants::IN_MEMORY_QUEUE_LIMIT;

#[derive(Clone)]
pub(super) struct QueuedPublish {
    pub channel: String,
    pub payload: String,
    pub opts: PublishOpts,
}

pub(super) struct PublishQueue {
    entries: Mutex<VecDeque<QueuedPublish>>,
    flusher_running: AtomicBool,
}

impl PublishQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            flusher_running: AtomicBool::new(false),
        }
    }

    pub fn enqueue(&self, channel: &str, payload: &str, opts: &PublishOpts) {
        let mut entries = self.entries.lock();
        while entries.len() >= IN_MEMORY_QUEUE_LIMIT {
            entries.pop_front();
            tracing::warn!(channel, "in-memory publish queue full, dropping oldest entry");
        }
        entries.push_back(QueuedPublish {
            channel: channel.to_string(),
            payload: payload.to_string(),
            opts: opts.clone(),
        });
    }

    /// Clone of the oldest entry, left in place until [`Self::pop_front`]
    pub fn front(&self) -> Option<QueuedPublish> {
        self.entries.lock().front().cloned()
    }

    pub fn pop_front(&self) {
        self.entries.lock().pop_front();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Claim the single flusher slot; false when one is already running
    pub fn try_start_flusher(&self) -> bool {
        self.flusher_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Release the flusher slot; true when an enqueue raced the release and
    /// the caller reclaimed the slot, so it must keep draining
    pub fn finish_flusher(&self) -> bool {
        self.flusher_running.store(false, Ordering::SeqCst);
        self.len() > 0 && self.try_start_flusher()
    }
}
