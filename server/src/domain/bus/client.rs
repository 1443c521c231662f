//! Per-connection poll client
//!
//! One `PollClient` exists per incoming long-poll request. It records the
//! channel cursors from the request body, computes the immediate backlog,
//! evaluates per-message permissions and owns the response writer — an
//! unbounded byte channel drained by the HTTP response body, so a slow
//! socket never blocks the delivery path.
//!
//! Non-chunked clients are single-shot: the first delivery (or the cleanup
//! timer's empty payload) closes them. Chunked clients stay open and receive
//! each batch as an application frame until closed.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::chunked;
use super::error::BusError;
use super::hooks::BusHooks;
use super::timer::CancelHandle;
use super::{BusMessage, MessageBus};

struct WriterState {
    sender: Option<mpsc::UnboundedSender<Bytes>>,
    cleanup_timer: Option<CancelHandle>,
    frames_sent: usize,
    closed: bool,
}

pub struct PollClientArgs {
    pub client_id: String,
    pub user_id: Option<i64>,
    pub group_ids: Vec<i64>,
    pub site_id: Option<String>,
    pub seq: u64,
    pub use_chunked: bool,
}

/// The unit through which messages reach one HTTP connection
pub struct PollClient {
    pub client_id: String,
    pub user_id: Option<i64>,
    pub group_ids: Vec<i64>,
    pub site_id: Option<String>,
    pub seq: u64,
    pub connect_time: Instant,
    pub use_chunked: bool,
    subscriptions: Mutex<HashMap<String, i64>>,
    writer: Mutex<WriterState>,
}

impl PollClient {
    /// Build a client and the receiver its HTTP response drains
    pub fn new(args: PollClientArgs) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            client_id: args.client_id,
            user_id: args.user_id,
            group_ids: args.group_ids,
            site_id: args.site_id,
            seq: args.seq,
            connect_time: Instant::now(),
            use_chunked: args.use_chunked,
            subscriptions: Mutex::new(HashMap::new()),
            writer: Mutex::new(WriterState {
                sender: Some(tx),
                cleanup_timer: None,
                frames_sent: 0,
                closed: false,
            }),
        });
        (client, rx)
    }

    /// Record interest in a channel after the given id
    ///
    /// Sentinels: `-1` = from now on (status only), `n < -1` = last `|n|-1`
    /// messages, `n ≥ 0` = everything after id `n`.
    pub fn subscribe(&self, channel: impl Into<String>, last_seen_id: i64) {
        self.subscriptions.lock().insert(channel.into(), last_seen_id);
    }

    pub fn subscription_channels(&self) -> Vec<String> {
        self.subscriptions.lock().keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn cursor(&self, channel: &str) -> Option<i64> {
        self.subscriptions.lock().get(channel).copied()
    }

    fn set_cursor(&self, channel: &str, value: i64) {
        self.subscriptions.lock().insert(channel.to_string(), value);
    }

    /// Compute the immediate set to deliver, in subscription order
    ///
    /// Subscriptions with nothing to replay (from-now, ahead-of-bus after a
    /// backend reset, or everything filtered away by permissions) contribute
    /// to one consolidated status message so the consumer can bump its
    /// cursors without leaking filtered content.
    pub async fn backlog(&self, bus: &MessageBus) -> Result<Vec<BusMessage>, BusError> {
        let subscriptions: Vec<(String, i64)> = {
            let subs = self.subscriptions.lock();
            subs.iter().map(|(c, id)| (c.clone(), *id)).collect()
        };

        let mut out = Vec::new();
        let mut status: Map<String, Value> = Map::new();

        for (channel, mut last_seen) in subscriptions {
            let last_id = bus.last_id(&channel, self.site_id.as_deref()).await? as i64;

            if last_seen < -1 {
                // "last N" relative to the current head
                last_seen = (last_id + last_seen + 1).max(0);
            }

            if last_seen > last_id {
                // Client is ahead of the bus: the backend was reset
                self.set_cursor(&channel, -1);
                status.insert(channel, json!(last_id));
                continue;
            }

            if last_seen == -1 {
                self.set_cursor(&channel, last_id);
                status.insert(channel, json!(last_id));
                continue;
            }

            let messages = bus
                .backlog(&channel, last_seen as u64, self.site_id.as_deref())
                .await?;
            let had_any = !messages.is_empty();
            let permitted: Vec<BusMessage> = messages
                .into_iter()
                .filter(|m| self.allowed(m, bus.hooks()))
                .collect();

            self.set_cursor(&channel, last_id);

            if permitted.is_empty() && had_any {
                status.insert(channel, json!(last_id));
            } else {
                out.extend(permitted);
            }
        }

        if !status.is_empty() {
            out.push(BusMessage::status(status));
        }
        Ok(out)
    }

    /// Permission check: client targeting, then user/group targeting, then
    /// the registered prefix filters
    pub fn allowed(&self, msg: &BusMessage, hooks: &BusHooks) -> bool {
        let client_targeted = msg
            .client_ids
            .as_ref()
            .is_some_and(|ids| !ids.is_empty());

        if client_targeted {
            let ids = msg.client_ids.as_ref().unwrap();
            if !ids.iter().any(|id| id == &self.client_id) {
                return false;
            }
        } else {
            let user_ids = msg.user_ids.as_deref().unwrap_or(&[]);
            let group_ids = msg.group_ids.as_deref().unwrap_or(&[]);

            if !user_ids.is_empty() || !group_ids.is_empty() {
                let user_match = self.user_id.is_some_and(|uid| user_ids.contains(&uid));
                let group_match = self.group_ids.iter().any(|gid| group_ids.contains(gid));
                if !user_match && !group_match {
                    return false;
                }
            }
        }

        hooks.run_message_filters(msg)
    }

    /// Write a batch; single-shot clients close after it
    pub fn deliver_backlog(&self, messages: &[BusMessage]) {
        let json = serde_json::to_string(messages).unwrap_or_else(|_| "[]".to_string());
        if self.use_chunked {
            self.send_frame(&json);
        } else {
            self.send_bytes(Bytes::from(json));
            self.close();
        }
    }

    /// Write one live message to a parked connection
    pub fn deliver(&self, msg: &BusMessage) {
        self.deliver_backlog(std::slice::from_ref(msg));
    }

    /// Chunked connections send an initial empty batch to defeat buffering
    /// proxies while the poll is parked
    pub fn ensure_first_frame(&self) {
        if !self.use_chunked {
            return;
        }
        let needs_first = { self.writer.lock().frames_sent == 0 };
        if needs_first {
            self.send_frame("[]");
        }
    }

    pub fn set_cleanup_timer(&self, handle: CancelHandle) {
        self.writer.lock().cleanup_timer = Some(handle);
    }

    /// Idempotent: cancel the cleanup timer, flush the terminator, release
    /// the writer
    pub fn close(&self) {
        let mut writer = self.writer.lock();
        if writer.closed {
            return;
        }
        writer.closed = true;

        if let Some(timer) = writer.cleanup_timer.take() {
            timer.cancel();
        }

        if let Some(sender) = writer.sender.take() {
            if !self.use_chunked && writer.frames_sent == 0 {
                let _ = sender.send(Bytes::from_static(b"[]"));
            }
            // Dropping the sender ends the body stream; the HTTP layer emits
            // the terminating zero chunk for chunked responses.
        }
    }

    pub fn is_closed(&self) -> bool {
        let writer = self.writer.lock();
        writer.closed
            || writer
                .sender
                .as_ref()
                .is_none_or(|sender| sender.is_closed())
    }

    fn send_frame(&self, json: &str) {
        self.send_bytes(chunked::frame(json));
    }

    fn send_bytes(&self, bytes: Bytes) {
        let mut writer = self.writer.lock();
        if writer.closed {
            return;
        }
        match writer.sender.as_ref() {
            Some(sender) => {
                if sender.send(bytes).is_err() {
                    // Receiver gone: the socket dropped mid-delivery
                    writer.closed = true;
                    writer.sender = None;
                    if let Some(timer) = writer.cleanup_timer.take() {
                        timer.cancel();
                    }
                } else {
                    writer.frames_sent += 1;
                }
            }
            None => writer.closed = true,
        }
    }
}
