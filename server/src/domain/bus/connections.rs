//! Connection registry and fan-out
//!
//! Thread-safe registry of parked long-poll clients, indexed by
//! (site, channel, client id). All mutation happens under one mutex; fan-out
//! snapshots the subscriber set under the lock and writes outside it, so a
//! slow or dead client never blocks the others (writes are non-blocking
//! channel sends anyway).
//!
//! A reconnect from the same client id with an equal or higher `seq`
//! displaces the older connection; the older one wins only while its seq is
//! strictly greater. Ties, including the first-connect `seq = 0`, resolve by
//! arrival order under the lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use super::BusMessage;
use super::client::PollClient;
use super::hooks::BusHooks;
use crate::core::constants::GLOBAL_CHANNEL_PREFIX;

struct Inner {
    clients: HashMap<String, Arc<PollClient>>,
    /// site → channel → client ids; global channels index under `None`
    subscriptions: HashMap<Option<String>, HashMap<String, HashSet<String>>>,
}

/// Registry of parked clients with permission-checked fan-out
pub struct ConnectionManager {
    hooks: BusHooks,
    inner: Mutex<Inner>,
}

enum AddOutcome {
    Inserted,
    Replaced(Arc<PollClient>),
    RejectedBySeq,
}

impl ConnectionManager {
    pub fn new(hooks: BusHooks) -> Self {
        Self {
            hooks,
            inner: Mutex::new(Inner {
                clients: HashMap::new(),
                subscriptions: HashMap::new(),
            }),
        }
    }

    /// Register a parked client, displacing an older connection per `seq`
    pub fn add_client(&self, client: Arc<PollClient>) {
        let outcome = {
            let mut inner = self.inner.lock();
            match inner.clients.get(&client.client_id) {
                Some(existing) if existing.seq > client.seq => AddOutcome::RejectedBySeq,
                Some(_) => {
                    let old = inner.clients.remove(&client.client_id).unwrap();
                    deindex(&mut inner, &old);
                    index(&mut inner, &client);
                    inner
                        .clients
                        .insert(client.client_id.clone(), Arc::clone(&client));
                    AddOutcome::Replaced(old)
                }
                None => {
                    index(&mut inner, &client);
                    inner
                        .clients
                        .insert(client.client_id.clone(), Arc::clone(&client));
                    AddOutcome::Inserted
                }
            }
        };

        // Closing happens outside the lock
        match outcome {
            AddOutcome::Inserted => {
                if let Some(on_connect) = &self.hooks.on_connect {
                    on_connect(client.site_id.as_deref());
                }
            }
            AddOutcome::Replaced(old) => {
                old.close();
                if let Some(on_connect) = &self.hooks.on_connect {
                    on_connect(client.site_id.as_deref());
                }
            }
            AddOutcome::RejectedBySeq => {
                tracing::debug!(
                    client_id = %client.client_id,
                    seq = client.seq,
                    "rejecting stale reconnect"
                );
                client.close();
            }
        }
    }

    /// Drop a client from the registry (a newer connection owning the same
    /// id is left untouched) and close it
    pub fn remove_client(&self, client: &Arc<PollClient>) {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.clients.get(&client.client_id) {
                Some(current) if Arc::ptr_eq(current, client) => {
                    inner.clients.remove(&client.client_id);
                    deindex(&mut inner, client);
                    true
                }
                _ => false,
            }
        };

        client.close();
        if removed && let Some(on_disconnect) = &self.hooks.on_disconnect {
            on_disconnect(client.site_id.as_deref());
        }
    }

    pub fn lookup_client(&self, client_id: &str) -> Option<Arc<PollClient>> {
        self.inner.lock().clients.get(client_id).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    /// Deliver a message to every permitted subscriber of its channel
    ///
    /// Returns how many clients the message was written to. Write failures
    /// are isolated: the failing client is removed, the rest still receive.
    pub fn notify_clients(&self, msg: &BusMessage) -> usize {
        let site_key = site_key(&msg.channel, msg.site_id.as_deref());

        let subscribers: Vec<Arc<PollClient>> = {
            let inner = self.inner.lock();
            inner
                .subscriptions
                .get(&site_key)
                .and_then(|channels| channels.get(&msg.channel))
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| inner.clients.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut delivered = 0;
        for client in subscribers {
            if !client.allowed(msg, &self.hooks) {
                continue;
            }
            client.deliver(msg);
            delivered += 1;
            if client.is_closed() {
                self.remove_client(&client);
            }
        }
        delivered
    }
}

fn site_key(channel: &str, site_id: Option<&str>) -> Option<String> {
    if channel.starts_with(GLOBAL_CHANNEL_PREFIX) {
        None
    } else {
        site_id.map(str::to_string)
    }
}

fn index(inner: &mut Inner, client: &Arc<PollClient>) {
    for channel in client.subscription_channels() {
        let key = site_key(&channel, client.site_id.as_deref());
        inner
            .subscriptions
            .entry(key)
            .or_default()
            .entry(channel)
            .or_default()
            .insert(client.client_id.clone());
    }
}

fn deindex(inner: &mut Inner, client: &Arc<PollClient>) {
    for channel in client.subscription_channels() {
        let key = site_key(&channel, client.site_id.as_deref());
        if let Some(channels) = inner.subscriptions.get_mut(&key) {
            if let Some(ids) = channels.get_mut(&channel) {
                ids.remove(&client.client_id);
                if ids.is_empty() {
                    channels.remove(&channel);
                }
            }
            if channels.is_empty() {
                inner.subscriptions.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bus::client::PollClientArgs;
    use bytes::Bytes;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn make_client(
        client_id: &str,
        seq: u64,
        site_id: Option<&str>,
        channels: &[&str],
    ) -> (Arc<PollClient>, mpsc::UnboundedReceiver<Bytes>) {
        let (client, rx) = PollClient::new(PollClientArgs {
            client_id: client_id.to_string(),
            user_id: Some(1),
            group_ids: Vec::new(),
            site_id: site_id.map(str::to_string),
            seq,
            use_chunked: false,
        });
        for channel in channels {
            client.subscribe(*channel, 0);
        }
        (client, rx)
    }

    fn make_message(channel: &str, site_id: Option<&str>) -> BusMessage {
        BusMessage {
            global_id: 1,
            message_id: 1,
            channel: channel.to_string(),
            site_id: site_id.map(str::to_string),
            data: json!("x"),
            user_ids: None,
            group_ids: None,
            client_ids: None,
        }
    }

    #[tokio::test]
    async fn test_add_and_lookup() {
        let manager = ConnectionManager::new(BusHooks::default());
        let (client, _rx) = make_client("c1", 0, None, &["/t"]);

        manager.add_client(Arc::clone(&client));
        assert_eq!(manager.client_count(), 1);
        assert!(manager.lookup_client("c1").is_some());
        assert!(manager.lookup_client("c2").is_none());
    }

    #[tokio::test]
    async fn test_higher_seq_displaces_older() {
        let manager = ConnectionManager::new(BusHooks::default());
        let (old, _rx1) = make_client("c1", 1, None, &["/t"]);
        let (new, _rx2) = make_client("c1", 2, None, &["/t"]);

        manager.add_client(Arc::clone(&old));
        manager.add_client(Arc::clone(&new));

        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert!(Arc::ptr_eq(&manager.lookup_client("c1").unwrap(), &new));
        assert_eq!(manager.client_count(), 1);
    }

    #[tokio::test]
    async fn test_lower_seq_reconnect_rejected() {
        let manager = ConnectionManager::new(BusHooks::default());
        let (newer, _rx1) = make_client("c1", 2, None, &["/t"]);
        let (stale, _rx2) = make_client("c1", 1, None, &["/t"]);

        manager.add_client(Arc::clone(&newer));
        manager.add_client(Arc::clone(&stale));

        assert!(stale.is_closed());
        assert!(!newer.is_closed());
        assert!(Arc::ptr_eq(&manager.lookup_client("c1").unwrap(), &newer));
    }

    #[tokio::test]
    async fn test_equal_seq_later_arrival_wins() {
        let manager = ConnectionManager::new(BusHooks::default());
        let (first, _rx1) = make_client("c1", 0, None, &["/t"]);
        let (second, _rx2) = make_client("c1", 0, None, &["/t"]);

        manager.add_client(Arc::clone(&first));
        manager.add_client(Arc::clone(&second));

        assert!(first.is_closed());
        assert!(Arc::ptr_eq(&manager.lookup_client("c1").unwrap(), &second));
    }

    #[tokio::test]
    async fn test_notify_delivers_to_channel_subscribers() {
        let manager = ConnectionManager::new(BusHooks::default());
        let (subscribed, mut rx1) = make_client("c1", 0, None, &["/t"]);
        let (other, mut rx2) = make_client("c2", 0, None, &["/other"]);
        manager.add_client(subscribed);
        manager.add_client(other);

        let delivered = manager.notify_clients(&make_message("/t", None));
        assert_eq!(delivered, 1);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notify_isolated_by_site() {
        let manager = ConnectionManager::new(BusHooks::default());
        let (site_a, mut rx_a) = make_client("ca", 0, Some("a"), &["/t"]);
        let (site_b, mut rx_b) = make_client("cb", 0, Some("b"), &["/t"]);
        manager.add_client(site_a);
        manager.add_client(site_b);

        let delivered = manager.notify_clients(&make_message("/t", Some("a")));
        assert_eq!(delivered, 1);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_global_channel_reaches_all_sites() {
        let manager = ConnectionManager::new(BusHooks::default());
        let (site_a, mut rx_a) = make_client("ca", 0, Some("a"), &["/global/x"]);
        let (site_b, mut rx_b) = make_client("cb", 0, Some("b"), &["/global/x"]);
        manager.add_client(site_a);
        manager.add_client(site_b);

        let delivered = manager.notify_clients(&make_message("/global/x", None));
        assert_eq!(delivered, 2);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_notify_respects_permissions() {
        let manager = ConnectionManager::new(BusHooks::default());
        let (client, mut rx) = make_client("c1", 0, None, &["/t"]);
        manager.add_client(client);

        let mut msg = make_message("/t", None);
        msg.user_ids = Some(vec![999]);
        assert_eq!(manager.notify_clients(&msg), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_single_shot_client_removed_after_delivery() {
        let manager = ConnectionManager::new(BusHooks::default());
        let (client, mut rx) = make_client("c1", 0, None, &["/t"]);
        manager.add_client(Arc::clone(&client));

        manager.notify_clients(&make_message("/t", None));

        assert!(rx.recv().await.is_some());
        assert!(client.is_closed());
        assert_eq!(manager.client_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_client_leaves_newer_connection() {
        let manager = ConnectionManager::new(BusHooks::default());
        let (old, _rx1) = make_client("c1", 1, None, &["/t"]);
        let (new, _rx2) = make_client("c1", 2, None, &["/t"]);
        manager.add_client(Arc::clone(&old));
        manager.add_client(Arc::clone(&new));

        // Removing the displaced connection must not evict the newer one
        manager.remove_client(&old);
        assert!(Arc::ptr_eq(&manager.lookup_client("c1").unwrap(), &new));
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_hooks_fire() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let mut hooks = BusHooks::default();
        let c = Arc::clone(&connects);
        hooks.on_connect = Some(Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let d = Arc::clone(&disconnects);
        hooks.on_disconnect = Some(Arc::new(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        }));

        let manager = ConnectionManager::new(hooks);
        let (client, _rx) = make_client("c1", 0, None, &["/t"]);
        manager.add_client(Arc::clone(&client));
        manager.remove_client(&client);

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }
}
