//! Subscriber task
//!
//! One long-lived task per bus drives the ordered firehose: every received
//! message is decoded, handed to the registered subscription handlers and
//! fanned out to parked clients. A backend error tears the stream down; the
//! task logs, sleeps briefly and resubscribes from its high-water mark, so a
//! flapping backend costs at most a short delivery delay.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;

use super::{BusInner, BusMessage, Handler};
use crate::core::constants::SUBSCRIBER_RETRY_DELAY_MS;
use crate::data::backlog::Firehose;

pub(super) async fn run_subscriber(
    inner: Arc<BusInner>,
    ready: tokio::sync::oneshot::Sender<()>,
) {
    let firehose = Firehose::new(Arc::clone(&inner.backend));
    let mut resume_from: Option<u64> = None;
    let mut ready = Some(ready);

    loop {
        if inner.is_destroyed() {
            break;
        }

        let mut stream = match firehose.global_subscribe(resume_from).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "firehose subscribe failed, retrying");
                tokio::time::sleep(Duration::from_millis(SUBSCRIBER_RETRY_DELAY_MS)).await;
                continue;
            }
        };

        // Publishers may rely on the subscription being open once start()
        // returns; signal it exactly once.
        if let Some(ready) = ready.take() {
            let _ = ready.send(());
        }

        while let Some(item) = stream.next().await {
            match item {
                Ok(raw) => {
                    *inner.last_activity.lock() = Instant::now();
                    resume_from = Some(raw.global_id);

                    match inner.decode_message(&raw) {
                        Ok(msg) => dispatch(&inner, &msg),
                        Err(e) => {
                            tracing::debug!(error = %e, "dropping undecodable message");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "firehose errored, resubscribing");
                    break;
                }
            }
        }

        if inner.is_destroyed() {
            break;
        }
        // The stream can also end on a foreign unsubscribe sentinel (another
        // process shutting down on a shared notify channel); just resubscribe.
        tokio::time::sleep(Duration::from_millis(SUBSCRIBER_RETRY_DELAY_MS)).await;
    }

    tracing::debug!("subscriber task exited");
}

fn dispatch(inner: &BusInner, msg: &BusMessage) {
    let handlers: Vec<Handler> = {
        let registry = inner.registry.lock();
        let mut out = Vec::new();

        let mut site_keys: Vec<Option<String>> = vec![None];
        if msg.site_id.is_some() {
            site_keys.push(msg.site_id.clone());
        }

        for site_key in &site_keys {
            if let Some(channels) = registry.entries.get(site_key) {
                for channel_key in [Some(msg.channel.clone()), None] {
                    if let Some(entries) = channels.get(&channel_key) {
                        out.extend(entries.iter().map(|(_, handler)| Arc::clone(handler)));
                    }
                }
            }
        }
        out
    };

    for handler in handlers {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(msg)));
        if result.is_err() {
            tracing::error!(
                channel = %msg.channel,
                "subscription handler panicked, continuing"
            );
        }
    }

    inner.connections.notify_clients(msg);
}
