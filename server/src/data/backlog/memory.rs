//! In-memory backlog backend
//!
//! Reference implementation for development, tests and single-process
//! deployments. All state lives behind one mutex; the firehose is a tokio
//! broadcast channel notified while the lock is held so notification order
//! matches id order.
//!
//! Age expiry is per channel: every publish pushes the channel's expiry
//! forward, and a 1 s sweeper drops the retained messages of channels that
//! have gone quiet for longer than the age bound. Counters survive both the
//! sweeper and `expire_all_backlogs`; only `reset` restarts them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::backend::{BacklogBackend, FirehoseEvent, FirehoseSubscription, PublishOpts};
use super::error::BacklogError;
use super::message::Message;
use crate::core::config::BacklogConfig;
use crate::core::constants::{FIREHOSE_CHANNEL_CAPACITY, MEMORY_SWEEP_INTERVAL_MS};

struct ChannelBacklog {
    last_id: u64,
    messages: VecDeque<Message>,
    expires_at: Option<Instant>,
}

impl ChannelBacklog {
    fn new() -> Self {
        Self {
            last_id: 0,
            messages: VecDeque::new(),
            expires_at: None,
        }
    }
}

struct GlobalEntry {
    added_at: Instant,
    message: Message,
}

struct Inner {
    channels: HashMap<String, ChannelBacklog>,
    global: VecDeque<GlobalEntry>,
    global_id: u64,
}

struct SharedState {
    inner: Mutex<Inner>,
    firehose: broadcast::Sender<FirehoseEvent>,
}

/// In-memory backlog backend
pub struct MemoryBacklogBackend {
    state: Arc<SharedState>,
    config: BacklogConfig,
}

impl MemoryBacklogBackend {
    /// Create a new backend and start its TTL sweeper
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: &BacklogConfig) -> Self {
        let state = Arc::new(SharedState {
            inner: Mutex::new(Inner {
                channels: HashMap::new(),
                global: VecDeque::new(),
                global_id: 0,
            }),
            firehose: broadcast::channel(FIREHOSE_CHANNEL_CAPACITY).0,
        });

        Self::spawn_sweeper(&state, config.max_backlog_age());

        Self {
            state,
            config: config.clone(),
        }
    }

    /// Sweeper holds only a weak reference so dropping the backend stops it
    fn spawn_sweeper(state: &Arc<SharedState>, max_age: Duration) {
        let weak = Arc::downgrade(state);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(MEMORY_SWEEP_INTERVAL_MS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(state) = weak.upgrade() else { break };
                sweep(&state, max_age, Instant::now());
            }
        });
    }
}

/// Drop expired channel contents and aged global entries; counters survive
fn sweep(state: &SharedState, max_age: Duration, now: Instant) {
    let mut inner = state.inner.lock();
    for backlog in inner.channels.values_mut() {
        if let Some(expires_at) = backlog.expires_at
            && expires_at <= now
        {
            backlog.messages.clear();
            backlog.expires_at = None;
        }
    }
    while let Some(front) = inner.global.front() {
        if front.added_at + max_age <= now {
            inner.global.pop_front();
        } else {
            break;
        }
    }
}

#[async_trait]
impl BacklogBackend for MemoryBacklogBackend {
    async fn publish(
        &self,
        channel: &str,
        payload: &str,
        opts: &PublishOpts,
    ) -> Result<Option<u64>, BacklogError> {
        let max_size = opts
            .max_backlog_size
            .unwrap_or(self.config.max_backlog_size);
        let max_age = opts
            .max_backlog_age
            .unwrap_or_else(|| self.config.max_backlog_age());
        let now = Instant::now();

        let mut inner = self.state.inner.lock();
        inner.global_id += 1;
        let global_id = inner.global_id;

        let backlog = inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(ChannelBacklog::new);
        backlog.last_id += 1;
        let message = Message::new(global_id, backlog.last_id, channel, payload);

        backlog.messages.push_back(message.clone());
        backlog.expires_at = Some(now + max_age);
        if global_id.is_multiple_of(self.config.clear_every.max(1)) {
            while backlog.messages.len() as u64 > max_size {
                backlog.messages.pop_front();
            }
        }

        inner.global.push_back(GlobalEntry {
            added_at: now,
            message: message.clone(),
        });
        if global_id.is_multiple_of(self.config.clear_every.max(1)) {
            while inner.global.len() as u64 > self.config.max_global_backlog_size {
                inner.global.pop_front();
            }
        }

        // Notify under the lock so firehose order matches id order
        let _ = self.state.firehose.send(FirehoseEvent::Message(message));
        Ok(Some(global_id))
    }

    async fn last_id(&self, channel: &str) -> Result<u64, BacklogError> {
        let inner = self.state.inner.lock();
        Ok(inner.channels.get(channel).map_or(0, |b| b.last_id))
    }

    async fn last_ids(&self, channels: &[String]) -> Result<Vec<u64>, BacklogError> {
        let inner = self.state.inner.lock();
        Ok(channels
            .iter()
            .map(|c| inner.channels.get(c).map_or(0, |b| b.last_id))
            .collect())
    }

    async fn backlog(&self, channel: &str, since_id: u64) -> Result<Vec<Message>, BacklogError> {
        let inner = self.state.inner.lock();
        Ok(inner.channels.get(channel).map_or_else(Vec::new, |b| {
            b.messages
                .iter()
                .filter(|m| m.message_id > since_id)
                .cloned()
                .collect()
        }))
    }

    async fn global_backlog(&self, since_global_id: u64) -> Result<Vec<Message>, BacklogError> {
        let inner = self.state.inner.lock();
        Ok(inner
            .global
            .iter()
            .filter(|e| e.message.global_id > since_global_id)
            .map(|e| e.message.clone())
            .collect())
    }

    async fn get_message(
        &self,
        channel: &str,
        message_id: u64,
    ) -> Result<Option<Message>, BacklogError> {
        let inner = self.state.inner.lock();
        Ok(inner.channels.get(channel).and_then(|b| {
            b.messages
                .iter()
                .find(|m| m.message_id == message_id)
                .cloned()
        }))
    }

    async fn global_subscribe(&self) -> Result<FirehoseSubscription, BacklogError> {
        let mut receiver = self.state.firehose.subscribe();

        let stream = stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) => yield Ok(event),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        yield Err(BacklogError::Lagged(n));
                    }
                }
            }
        };

        Ok(FirehoseSubscription {
            receiver: Box::pin(stream),
        })
    }

    async fn global_unsubscribe(&self) -> Result<(), BacklogError> {
        let _ = self.state.firehose.send(FirehoseEvent::Unsubscribe);
        Ok(())
    }

    async fn reset(&self) -> Result<(), BacklogError> {
        let mut inner = self.state.inner.lock();
        inner.channels.clear();
        inner.global.clear();
        inner.global_id = 0;
        Ok(())
    }

    async fn expire_all_backlogs(&self) -> Result<(), BacklogError> {
        let mut inner = self.state.inner.lock();
        for backlog in inner.channels.values_mut() {
            backlog.messages.clear();
        }
        inner.global.clear();
        Ok(())
    }

    async fn after_fork(&self) -> Result<(), BacklogError> {
        // No sockets to reopen; the sweeper keeps running
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn test_config() -> BacklogConfig {
        BacklogConfig::default()
    }

    async fn publish(backend: &MemoryBacklogBackend, channel: &str, payload: &str) -> u64 {
        backend
            .publish(channel, payload, &PublishOpts::default())
            .await
            .unwrap()
            .expect("memory publish is never queued")
    }

    #[tokio::test]
    async fn test_ids_start_at_one_and_increase() {
        let backend = MemoryBacklogBackend::new(&test_config());

        assert_eq!(publish(&backend, "/a", "1").await, 1);
        assert_eq!(publish(&backend, "/b", "2").await, 2);
        assert_eq!(publish(&backend, "/a", "3").await, 3);

        assert_eq!(backend.last_id("/a").await.unwrap(), 2);
        assert_eq!(backend.last_id("/b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_last_id_absent_channel_is_zero() {
        let backend = MemoryBacklogBackend::new(&test_config());
        assert_eq!(backend.last_id("/nope").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_last_ids_mixed() {
        let backend = MemoryBacklogBackend::new(&test_config());
        publish(&backend, "/a", "x").await;
        publish(&backend, "/a", "y").await;

        let ids = backend
            .last_ids(&["/a".to_string(), "/missing".to_string()])
            .await
            .unwrap();
        assert_eq!(ids, vec![2, 0]);
    }

    #[tokio::test]
    async fn test_backlog_since() {
        let backend = MemoryBacklogBackend::new(&test_config());
        publish(&backend, "/foo", "a").await;
        publish(&backend, "/foo", "b").await;
        publish(&backend, "/foo", "c").await;

        let backlog = backend.backlog("/foo", 1).await.unwrap();
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].message_id, 2);
        assert_eq!(backlog[0].payload, "b");
        assert_eq!(backlog[1].message_id, 3);

        assert!(backend.backlog("/foo", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_global_backlog_ordered() {
        let backend = MemoryBacklogBackend::new(&test_config());
        publish(&backend, "/a", "1").await;
        publish(&backend, "/b", "2").await;
        publish(&backend, "/a", "3").await;

        let global = backend.global_backlog(0).await.unwrap();
        let ids: Vec<u64> = global.iter().map(|m| m.global_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let tail = backend.global_backlog(2).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].channel, "/a");
    }

    #[tokio::test]
    async fn test_channel_backlog_trimmed_to_bound() {
        let mut config = test_config();
        config.max_backlog_size = 3;
        let backend = MemoryBacklogBackend::new(&config);

        for i in 0..10 {
            publish(&backend, "/t", &i.to_string()).await;
        }

        let backlog = backend.backlog("/t", 0).await.unwrap();
        assert_eq!(backlog.len(), 3);
        let ids: Vec<u64> = backlog.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn test_publish_opts_override_backlog_bound() {
        let backend = MemoryBacklogBackend::new(&test_config());
        let opts = PublishOpts {
            max_backlog_size: Some(1),
            ..Default::default()
        };
        backend.publish("/t", "a", &opts).await.unwrap();
        backend.publish("/t", "b", &opts).await.unwrap();

        let backlog = backend.backlog("/t", 0).await.unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].payload, "b");
    }

    #[tokio::test]
    async fn test_global_backlog_trimmed_to_bound() {
        let mut config = test_config();
        config.max_global_backlog_size = 2;
        let backend = MemoryBacklogBackend::new(&config);

        for i in 0..5 {
            publish(&backend, "/t", &i.to_string()).await;
        }

        let global = backend.global_backlog(0).await.unwrap();
        let ids: Vec<u64> = global.iter().map(|m| m.global_id).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_get_message() {
        let backend = MemoryBacklogBackend::new(&test_config());
        publish(&backend, "/t", "a").await;
        publish(&backend, "/t", "b").await;

        let msg = backend.get_message("/t", 2).await.unwrap().unwrap();
        assert_eq!(msg.payload, "b");
        assert!(backend.get_message("/t", 9).await.unwrap().is_none());
        assert!(backend.get_message("/other", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_restarts_counters() {
        let backend = MemoryBacklogBackend::new(&test_config());
        publish(&backend, "/t", "a").await;
        publish(&backend, "/t", "b").await;

        backend.reset().await.unwrap();

        assert_eq!(backend.last_id("/t").await.unwrap(), 0);
        assert_eq!(publish(&backend, "/t", "c").await, 1);
        assert_eq!(backend.last_id("/t").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expire_all_backlogs_keeps_counters() {
        let backend = MemoryBacklogBackend::new(&test_config());
        publish(&backend, "/t", "a").await;
        publish(&backend, "/t", "b").await;

        backend.expire_all_backlogs().await.unwrap();

        assert!(backend.backlog("/t", 0).await.unwrap().is_empty());
        assert!(backend.global_backlog(0).await.unwrap().is_empty());
        assert_eq!(backend.last_id("/t").await.unwrap(), 2);
        assert_eq!(publish(&backend, "/t", "c").await, 3);
    }

    #[tokio::test]
    async fn test_sweep_expires_quiet_channels() {
        let backend = MemoryBacklogBackend::new(&test_config());
        publish(&backend, "/t", "a").await;

        let future = Instant::now() + Duration::from_secs(8 * 24 * 60 * 60);
        sweep(&backend.state, backend.config.max_backlog_age(), future);

        assert!(backend.backlog("/t", 0).await.unwrap().is_empty());
        assert!(backend.global_backlog(0).await.unwrap().is_empty());
        // The counter survives so ids are never reused
        assert_eq!(backend.last_id("/t").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_channels() {
        let backend = MemoryBacklogBackend::new(&test_config());
        publish(&backend, "/t", "a").await;

        sweep(
            &backend.state,
            backend.config.max_backlog_age(),
            Instant::now(),
        );

        assert_eq!(backend.backlog("/t", 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_firehose_delivers_in_publish_order() {
        let backend = MemoryBacklogBackend::new(&test_config());
        let mut sub = backend.global_subscribe().await.unwrap();

        publish(&backend, "/a", "1").await;
        publish(&backend, "/b", "2").await;

        for expected in 1..=2u64 {
            match sub.receiver.next().await.unwrap().unwrap() {
                FirehoseEvent::Message(msg) => assert_eq!(msg.global_id, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_global_unsubscribe_wakes_subscriber() {
        let backend = MemoryBacklogBackend::new(&test_config());
        let mut sub = backend.global_subscribe().await.unwrap();

        backend.global_unsubscribe().await.unwrap();

        match sub.receiver.next().await.unwrap().unwrap() {
            FirehoseEvent::Unsubscribe => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_backend_name() {
        let backend = MemoryBacklogBackend::new(&test_config());
        assert_eq!(backend.backend_name(), "memory");
    }
}
