//! Message bus facade
//!
//! [`MessageBus`] ties the pieces together: multi-tenant channel name
//! encoding, publish validation, the subscription registry, the subscriber
//! task, the connection manager for parked long-polls, the job timer and the
//! keepalive watchdog. One instance is built at startup and shared; there is
//! no process-wide singleton.

pub mod chunked;
pub mod client;
pub mod connections;
pub mod error;
pub mod hooks;
mod subscriber;
pub mod timer;

pub use client::{PollClient, PollClientArgs};
pub use connections::ConnectionManager;
pub use error::BusError;
pub use hooks::{BusHooks, PollRequest};
pub use timer::{CancelHandle, Timer};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::core::config::BusConfig;
use crate::core::constants::{
    GLOBAL_CHANNEL_PREFIX, KEEPALIVE_CHANNEL, KEEPALIVE_EXIT_GRACE_SECS, KEEPALIVE_MIN_INTERVAL_SECS,
    KEEPALIVE_USER_ID, SITE_SEPARATOR, STATUS_CHANNEL,
};
use crate::core::shutdown::ShutdownService;
use crate::data::backlog::{BacklogBackend, Message, MessagePayload, PublishOpts};

/// A decoded message as seen by subscribers and HTTP consumers
///
/// Only `global_id`, `message_id`, `channel` and `data` are serialized to
/// consumers; targets and the site stay server-side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusMessage {
    pub global_id: i64,
    pub message_id: i64,
    pub channel: String,
    #[serde(skip)]
    pub site_id: Option<String>,
    pub data: Value,
    #[serde(skip)]
    pub user_ids: Option<Vec<i64>>,
    #[serde(skip)]
    pub group_ids: Option<Vec<i64>>,
    #[serde(skip)]
    pub client_ids: Option<Vec<String>>,
}

impl BusMessage {
    /// Synthetic consolidated status message (`{channel: last_id}` map)
    pub fn status(map: Map<String, Value>) -> Self {
        Self {
            global_id: -1,
            message_id: -1,
            channel: STATUS_CHANNEL.to_string(),
            site_id: None,
            data: Value::Object(map),
            user_ids: None,
            group_ids: None,
            client_ids: None,
        }
    }
}

/// Targeting and retention options for one publish
#[derive(Debug, Clone)]
pub struct PublishArgs {
    pub user_ids: Option<Vec<i64>>,
    pub group_ids: Option<Vec<i64>>,
    pub client_ids: Option<Vec<String>>,
    pub site_id: Option<String>,
    pub max_backlog_size: Option<u64>,
    pub max_backlog_age: Option<Duration>,
    pub queue_in_memory: bool,
}

impl Default for PublishArgs {
    fn default() -> Self {
        Self {
            user_ids: None,
            group_ids: None,
            client_ids: None,
            site_id: None,
            max_backlog_size: None,
            max_backlog_age: None,
            queue_in_memory: true,
        }
    }
}

pub(crate) type Handler = Arc<dyn Fn(&BusMessage) + Send + Sync>;

/// Handle returned by [`MessageBus::subscribe`], used to unsubscribe
pub struct SubscriptionHandle {
    id: u64,
    site_id: Option<String>,
    channel: Option<String>,
}

pub(crate) struct Registry {
    next_id: u64,
    /// site → channel (None = every channel) → handlers
    pub(crate) entries: HashMap<Option<String>, HashMap<Option<String>, Vec<(u64, Handler)>>>,
}

struct BusState {
    enabled: bool,
    destroyed: bool,
    subscriber: Option<JoinHandle<()>>,
    keepalive: Vec<CancelHandle>,
}

pub(crate) struct BusInner {
    pub(crate) config: BusConfig,
    pub(crate) backend: Arc<dyn BacklogBackend>,
    pub(crate) hooks: BusHooks,
    pub(crate) connections: Arc<ConnectionManager>,
    pub(crate) timer: Timer,
    state: Mutex<BusState>,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) last_activity: Mutex<Instant>,
}

impl BusInner {
    pub(crate) fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    pub(crate) fn decode_message(&self, raw: &Message) -> Result<BusMessage, BusError> {
        let payload = MessagePayload::decode(&raw.payload)?;
        let (channel, site_id) = decode_channel_name(&raw.channel);
        Ok(BusMessage {
            global_id: raw.global_id as i64,
            message_id: raw.message_id as i64,
            channel,
            site_id,
            data: payload.data,
            user_ids: payload.user_ids,
            group_ids: payload.group_ids,
            client_ids: payload.client_ids,
        })
    }
}

/// Channels outside `/global/` are stored as `channel + SEP + site_id`
fn encode_channel_name(channel: &str, site_id: Option<&str>) -> Result<String, BusError> {
    if channel.contains(SITE_SEPARATOR) {
        return Err(BusError::InvalidMessage(format!(
            "channel may not contain the site separator: {channel}"
        )));
    }
    if channel.starts_with(GLOBAL_CHANNEL_PREFIX) {
        return Ok(channel.to_string());
    }
    match site_id {
        Some(site_id) => Ok(format!("{channel}{SITE_SEPARATOR}{site_id}")),
        None => Ok(channel.to_string()),
    }
}

fn decode_channel_name(stored: &str) -> (String, Option<String>) {
    match stored.split_once(SITE_SEPARATOR) {
        Some((channel, site_id)) => (channel.to_string(), Some(site_id.to_string())),
        None => (stored.to_string(), None),
    }
}

/// The bus: publish, read, subscribe, lifecycle
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(config: BusConfig, backend: Arc<dyn BacklogBackend>, hooks: BusHooks) -> Self {
        let connections = Arc::new(ConnectionManager::new(hooks.clone()));
        Self {
            inner: Arc::new(BusInner {
                config,
                backend,
                hooks,
                connections,
                timer: Timer::new(),
                state: Mutex::new(BusState {
                    enabled: true,
                    destroyed: false,
                    subscriber: None,
                    keepalive: Vec::new(),
                }),
                registry: Mutex::new(Registry {
                    next_id: 1,
                    entries: HashMap::new(),
                }),
                last_activity: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Start the subscriber task and, when configured, the keepalive jobs
    ///
    /// Returns once the firehose subscription is open, so a publish issued
    /// right after cannot be missed.
    pub async fn start(&self, shutdown: ShutdownService) {
        let ready_rx = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            if state.subscriber.is_none() {
                let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
                state.subscriber = Some(tokio::spawn(subscriber::run_subscriber(
                    Arc::clone(&self.inner),
                    ready_tx,
                )));
                Some(ready_rx)
            } else {
                None
            }
        };
        if let Some(ready_rx) = ready_rx {
            let _ = ready_rx.await;
        }
        self.start_keepalive(shutdown);
    }

    /// Heartbeat publish plus the watchdog that is the last-resort recovery
    /// from a silently dead backend socket
    fn start_keepalive(&self, shutdown: ShutdownService) {
        let interval = self.inner.config.keepalive_interval();
        if interval.as_secs() < KEEPALIVE_MIN_INTERVAL_SECS {
            return;
        }

        let bus = self.clone();
        let publish_handle = self.inner.timer.every(interval, move || {
            let bus = bus.clone();
            tokio::spawn(async move {
                let args = PublishArgs {
                    user_ids: Some(vec![KEEPALIVE_USER_ID]),
                    ..Default::default()
                };
                if let Err(e) = bus
                    .publish(KEEPALIVE_CHANNEL, Value::String("keepalive".into()), args)
                    .await
                {
                    tracing::warn!(error = %e, "keepalive publish failed");
                }
            });
            Ok(())
        });

        let inner = Arc::clone(&self.inner);
        let watchdog_handle = self.inner.timer.every(interval, move || {
            let idle = inner.last_activity.lock().elapsed();
            if idle > interval * 3 {
                tracing::error!(
                    idle_secs = idle.as_secs(),
                    "no message seen for 3 keepalive intervals, terminating process"
                );
                shutdown.trigger();
                tokio::spawn(async {
                    tokio::time::sleep(Duration::from_secs(KEEPALIVE_EXIT_GRACE_SECS)).await;
                    std::process::exit(1);
                });
            }
            Ok(())
        });

        let mut state = self.inner.state.lock();
        state.keepalive.push(publish_handle);
        state.keepalive.push(watchdog_handle);
    }

    /// Publish `data` on a channel
    ///
    /// Returns the global id, or `None` when the bus is switched off (silent
    /// success) or the backend buffered the publish while read-only.
    pub async fn publish(
        &self,
        channel: &str,
        data: Value,
        args: PublishArgs,
    ) -> Result<Option<u64>, BusError> {
        {
            let state = self.inner.state.lock();
            if state.destroyed {
                return Err(BusError::Destroyed);
            }
            if !state.enabled {
                return Ok(None);
            }
        }

        if channel.starts_with(GLOBAL_CHANNEL_PREFIX)
            && (args.user_ids.is_some() || args.group_ids.is_some())
        {
            return Err(BusError::InvalidMessage(
                "user/group restrictions are not allowed on global channels".into(),
            ));
        }
        for (name, empty) in [
            ("user_ids", args.user_ids.as_ref().is_some_and(Vec::is_empty)),
            ("group_ids", args.group_ids.as_ref().is_some_and(Vec::is_empty)),
            ("client_ids", args.client_ids.as_ref().is_some_and(Vec::is_empty)),
        ] {
            if empty {
                return Err(BusError::InvalidMessage(format!(
                    "{name} was specified but empty"
                )));
            }
        }

        let encoded_channel = encode_channel_name(channel, args.site_id.as_deref())?;
        let payload = MessagePayload {
            data,
            user_ids: args.user_ids,
            group_ids: args.group_ids,
            client_ids: args.client_ids,
        }
        .encode()?;

        let opts = PublishOpts {
            max_backlog_size: args.max_backlog_size,
            max_backlog_age: args.max_backlog_age,
            queue_in_memory: args.queue_in_memory,
        };

        Ok(self
            .inner
            .backend
            .publish(&encoded_channel, &payload, &opts)
            .await?)
    }

    pub async fn last_id(&self, channel: &str, site_id: Option<&str>) -> Result<u64, BusError> {
        let encoded = encode_channel_name(channel, site_id)?;
        Ok(self.inner.backend.last_id(&encoded).await?)
    }

    pub async fn last_ids(
        &self,
        channels: &[String],
        site_id: Option<&str>,
    ) -> Result<Vec<u64>, BusError> {
        let encoded: Vec<String> = channels
            .iter()
            .map(|c| encode_channel_name(c, site_id))
            .collect::<Result<_, _>>()?;
        Ok(self.inner.backend.last_ids(&encoded).await?)
    }

    pub async fn backlog(
        &self,
        channel: &str,
        since_id: u64,
        site_id: Option<&str>,
    ) -> Result<Vec<BusMessage>, BusError> {
        let encoded = encode_channel_name(channel, site_id)?;
        let raw = self.inner.backend.backlog(&encoded, since_id).await?;
        raw.iter().map(|m| self.inner.decode_message(m)).collect()
    }

    pub async fn global_backlog(&self, since_global_id: u64) -> Result<Vec<BusMessage>, BusError> {
        let raw = self.inner.backend.global_backlog(since_global_id).await?;
        raw.iter().map(|m| self.inner.decode_message(m)).collect()
    }

    pub async fn get_message(
        &self,
        channel: &str,
        message_id: u64,
        site_id: Option<&str>,
    ) -> Result<Option<BusMessage>, BusError> {
        let encoded = encode_channel_name(channel, site_id)?;
        let raw = self.inner.backend.get_message(&encoded, message_id).await?;
        raw.map(|m| self.inner.decode_message(&m)).transpose()
    }

    /// Register a handler for messages on a channel (`None` = every channel)
    /// of a site (`None` = catch-all across sites)
    pub fn subscribe(
        &self,
        channel: Option<&str>,
        site_id: Option<&str>,
        handler: impl Fn(&BusMessage) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let mut registry = self.inner.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;

        let site_key = site_id.map(str::to_string);
        let channel_key = channel.map(str::to_string);
        registry
            .entries
            .entry(site_key.clone())
            .or_default()
            .entry(channel_key.clone())
            .or_default()
            .push((id, Arc::new(handler)));

        SubscriptionHandle {
            id,
            site_id: site_key,
            channel: channel_key,
        }
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut registry = self.inner.registry.lock();
        if let Some(channels) = registry.entries.get_mut(&handle.site_id) {
            if let Some(entries) = channels.get_mut(&handle.channel) {
                entries.retain(|(id, _)| *id != handle.id);
                if entries.is_empty() {
                    channels.remove(&handle.channel);
                }
            }
            if channels.is_empty() {
                registry.entries.remove(&handle.site_id);
            }
        }
    }

    /// Re-enable publishing after [`Self::off`]
    pub fn on(&self) {
        self.inner.state.lock().enabled = true;
    }

    /// Disable publishing; publishes succeed silently without an id
    pub fn off(&self) {
        self.inner.state.lock().enabled = false;
    }

    /// Unblock the firehose, join the subscriber task and stop the timer
    pub async fn destroy(&self) {
        let subscriber = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            for handle in state.keepalive.drain(..) {
                handle.cancel();
            }
            state.subscriber.take()
        };

        if let Err(e) = self.inner.backend.global_unsubscribe().await {
            tracing::warn!(error = %e, "unsubscribe sentinel publish failed");
        }
        if let Some(subscriber) = subscriber {
            if tokio::time::timeout(Duration::from_secs(5), subscriber)
                .await
                .is_err()
            {
                tracing::warn!("subscriber task did not exit in time");
            }
        }
        self.inner.timer.stop();
        tracing::debug!("bus destroyed");
    }

    /// Drop all backend state; counters restart from 1
    pub async fn reset(&self) -> Result<(), BusError> {
        Ok(self.inner.backend.reset().await?)
    }

    /// Drop retained messages but keep the id counters
    pub async fn expire_all_backlogs(&self) -> Result<(), BusError> {
        Ok(self.inner.backend.expire_all_backlogs().await?)
    }

    /// Re-open backend connections and restart the subscriber task
    pub async fn after_fork(&self, shutdown: ShutdownService) -> Result<(), BusError> {
        self.inner.backend.after_fork().await?;

        let old = {
            let mut state = self.inner.state.lock();
            state.subscriber.take()
        };
        if let Some(old) = old {
            old.abort();
        }
        self.start(shutdown).await;
        Ok(())
    }

    pub fn register_client_message_filter(
        &self,
        prefix: impl Into<String>,
        filter: impl Fn(&BusMessage) -> bool + Send + Sync + 'static,
    ) {
        self.inner.hooks.register_message_filter(prefix, filter);
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn hooks(&self) -> &BusHooks {
        &self.inner.hooks
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.inner.connections
    }

    pub fn timer(&self) -> &Timer {
        &self.inner.timer
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.backend_name()
    }
}
