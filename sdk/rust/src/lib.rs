//! # fanline
//!
//! Client SDK for the fanline message bus long-poll protocol. A
//! [`PollClient`] keeps a map of channel cursors, POSTs it to the server's
//! polling endpoint and dispatches returned messages to per-channel
//! callbacks, de-duplicating by message id. It understands both the plain
//! JSON-array response and the chunked streaming mode, where batches arrive
//! as frames separated by `\r\n|\r\n` (embedded separators escaped by
//! doubling the pipe).
//!
//! ```no_run
//! # async fn example() {
//! let client = fanline::PollClient::builder("http://localhost:4550").build();
//! client.subscribe("/announcements", -1, |msg| {
//!     println!("{}: {}", msg.channel, msg.data);
//! });
//! client.start();
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Frame separator between JSON batches in chunked mode
pub const CHUNK_SEPARATOR: &str = "\r\n|\r\n";

/// Escaped form of the separator inside a frame body
pub const ESCAPED_SEPARATOR: &str = "\r\n||\r\n";

/// Channel carrying consolidated `{channel: last_id}` cursor maps
const STATUS_CHANNEL: &str = "/__status";

/// Channel instructing the client to reset cursors unconditionally
const FLUSH_CHANNEL: &str = "/__flush";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// A message as delivered by the server
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BusMessage {
    pub global_id: i64,
    pub message_id: i64,
    pub channel: String,
    pub data: Value,
}

/// How the client consumes the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollMode {
    /// Hold each request open until data or the server timeout (default)
    #[default]
    LongPoll,
    /// Plain polling with `dlp=t`, waiting `poll_interval` between requests
    Poll,
}

type MessageCallback = Arc<dyn Fn(&BusMessage) + Send + Sync>;

struct ChannelState {
    last_id: i64,
    callback: MessageCallback,
}

pub struct PollClientBuilder {
    base_url: String,
    client_id: Option<String>,
    mode: PollMode,
    chunked: bool,
    poll_interval: Duration,
}

impl PollClientBuilder {
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn mode(mut self, mode: PollMode) -> Self {
        self.mode = mode;
        self
    }

    /// Disable chunked streaming (sends `Dont-Chunk: true`)
    pub fn dont_chunk(mut self) -> Self {
        self.chunked = false;
        self
    }

    /// Delay between polls in [`PollMode::Poll`] and after transport errors
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn build(self) -> PollClient {
        let (stop_tx, stop_rx) = watch::channel(false);
        PollClient {
            inner: Arc::new(ClientInner {
                http: reqwest::Client::new(),
                base_url: self.base_url.trim_end_matches('/').to_string(),
                client_id: self
                    .client_id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                mode: self.mode,
                chunked: self.chunked,
                poll_interval: self.poll_interval,
                seq: AtomicU64::new(0),
                channels: Mutex::new(HashMap::new()),
            }),
            stop_tx,
            stop_rx,
            task: Mutex::new(None),
        }
    }
}

struct ClientInner {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    mode: PollMode,
    chunked: bool,
    poll_interval: Duration,
    seq: AtomicU64,
    channels: Mutex<HashMap<String, ChannelState>>,
}

/// Polling consumer of a fanline server
pub struct PollClient {
    inner: Arc<ClientInner>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollClient {
    pub fn builder(base_url: impl Into<String>) -> PollClientBuilder {
        PollClientBuilder {
            base_url: base_url.into(),
            client_id: None,
            mode: PollMode::default(),
            chunked: true,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Subscribe a callback to a channel
    ///
    /// `last_id` sentinels match the server: `-1` = from now on, `n < -1` =
    /// last `|n|-1` messages, `n ≥ 0` = everything after id `n`.
    pub fn subscribe(
        &self,
        channel: impl Into<String>,
        last_id: i64,
        callback: impl Fn(&BusMessage) + Send + Sync + 'static,
    ) {
        self.inner.channels.lock().insert(
            channel.into(),
            ChannelState {
                last_id,
                callback: Arc::new(callback),
            },
        );
    }

    pub fn unsubscribe(&self, channel: &str) {
        self.inner.channels.lock().remove(channel);
    }

    /// Start the polling task (idempotent)
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let stop_rx = self.stop_rx.clone();
        *task = Some(tokio::spawn(run_loop(inner, stop_rx)));
    }

    /// Stop the polling task
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

async fn run_loop(inner: Arc<ClientInner>, mut stop_rx: watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            break;
        }

        let wait = match poll_once(&inner).await {
            // Long polls re-issue immediately; plain polls pace themselves
            Ok(()) => match inner.mode {
                PollMode::LongPoll => Duration::ZERO,
                PollMode::Poll => inner.poll_interval,
            },
            Err(e) => {
                tracing::warn!(error = %e, "poll failed, backing off");
                inner.poll_interval
            }
        };

        if !wait.is_zero() {
            tokio::select! {
                _ = stop_rx.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

async fn poll_once(inner: &ClientInner) -> Result<(), ClientError> {
    let body = build_body(inner);
    if body.len() == 1 {
        // Only __seq: nothing subscribed yet
        tokio::time::sleep(inner.poll_interval).await;
        return Ok(());
    }

    let mut url = format!("{}/message-bus/{}", inner.base_url, inner.client_id);
    if inner.mode == PollMode::Poll {
        url.push_str("?dlp=t");
    }

    let mut request = inner.http.post(url).json(&Value::Object(body));
    if !inner.chunked {
        request = request.header("Dont-Chunk", "true");
    }

    let response = request.send().await?.error_for_status()?;

    if inner.chunked {
        let mut reader = FrameReader::new();
        let mut stream = response.bytes_stream();
        while let Some(fragment) = stream.next().await {
            for frame in reader.push(&fragment?) {
                handle_batch(inner, &frame)?;
            }
        }
    } else {
        let text = response.text().await?;
        handle_batch(inner, &text)?;
    }

    Ok(())
}

fn build_body(inner: &ClientInner) -> Map<String, Value> {
    let mut body = Map::new();
    {
        let channels = inner.channels.lock();
        for (channel, state) in channels.iter() {
            body.insert(channel.clone(), json!(state.last_id));
        }
    }
    body.insert(
        "__seq".to_string(),
        json!(inner.seq.fetch_add(1, Ordering::SeqCst)),
    );
    body
}

fn handle_batch(inner: &ClientInner, json: &str) -> Result<(), ClientError> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Ok(());
    }
    let messages: Vec<BusMessage> = serde_json::from_str(trimmed)
        .map_err(|e| ClientError::Protocol(format!("bad batch: {e}")))?;
    for message in messages {
        process_message(inner, &message);
    }
    Ok(())
}

fn process_message(inner: &ClientInner, msg: &BusMessage) {
    match msg.channel.as_str() {
        // Cursor maps move the client without payload delivery; a flush may
        // also move cursors backwards after a server-side reset
        STATUS_CHANNEL | FLUSH_CHANNEL => {
            if let Value::Object(map) = &msg.data {
                let mut channels = inner.channels.lock();
                for (channel, value) in map {
                    if let (Some(state), Some(id)) = (channels.get_mut(channel), value.as_i64()) {
                        state.last_id = id;
                    }
                }
            }
        }
        _ => {
            let callback = {
                let mut channels = inner.channels.lock();
                match channels.get_mut(&msg.channel) {
                    Some(state) if msg.message_id > state.last_id => {
                        state.last_id = msg.message_id;
                        Some(Arc::clone(&state.callback))
                    }
                    // Duplicate (reconnect overlap) or unknown channel
                    _ => None,
                }
            };
            if let Some(callback) = callback {
                callback(msg);
            }
        }
    }
}

/// Incremental splitter for the chunked streaming mode
///
/// Buffers raw bytes so separators and multi-byte characters straddling
/// fragment boundaries are handled.
#[derive(Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(fragment);

        let separator = CHUNK_SEPARATOR.as_bytes();
        let mut frames = Vec::new();
        while let Some(idx) = find_subsequence(&self.buffer, separator) {
            let frame: Vec<u8> = self.buffer.drain(..idx + separator.len()).collect();
            let body = String::from_utf8_lossy(&frame[..idx]);
            frames.push(body.replace(ESCAPED_SEPARATOR, CHUNK_SEPARATOR));
        }
        frames
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> PollClient {
        PollClient::builder("http://localhost:4550/")
            .client_id("test-client")
            .build()
    }

    fn message(channel: &str, message_id: i64, data: Value) -> BusMessage {
        BusMessage {
            global_id: message_id,
            message_id,
            channel: channel.to_string(),
            data,
        }
    }

    #[test]
    fn test_builder_defaults() {
        let client = test_client();
        assert_eq!(client.client_id(), "test-client");
        assert_eq!(client.inner.base_url, "http://localhost:4550");
        assert!(client.inner.chunked);
        assert_eq!(client.inner.mode, PollMode::LongPoll);
    }

    #[test]
    fn test_generated_client_id_unique() {
        let a = PollClient::builder("http://x").build();
        let b = PollClient::builder("http://x").build();
        assert_ne!(a.client_id(), b.client_id());
    }

    #[test]
    fn test_body_contains_cursors_and_seq() {
        let client = test_client();
        client.subscribe("/a", 3, |_| {});
        client.subscribe("/b", -1, |_| {});

        let body = build_body(&client.inner);
        assert_eq!(body["/a"], json!(3));
        assert_eq!(body["/b"], json!(-1));
        assert_eq!(body["__seq"], json!(0));

        // seq is monotonic per request
        let body = build_body(&client.inner);
        assert_eq!(body["__seq"], json!(1));
    }

    #[test]
    fn test_dispatch_and_cursor_advance() {
        let client = test_client();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        client.subscribe("/t", 0, move |msg| {
            sink.lock().push(msg.data.clone());
        });

        process_message(&client.inner, &message("/t", 1, json!("a")));
        process_message(&client.inner, &message("/t", 2, json!("b")));
        // Duplicate delivery after a reconnect overlap
        process_message(&client.inner, &message("/t", 2, json!("b")));

        assert_eq!(*received.lock(), vec![json!("a"), json!("b")]);
        assert_eq!(client.inner.channels.lock()["/t"].last_id, 2);
    }

    #[test]
    fn test_unknown_channel_ignored() {
        let client = test_client();
        process_message(&client.inner, &message("/nobody", 1, json!("x")));
    }

    #[test]
    fn test_status_bumps_cursors() {
        let client = test_client();
        client.subscribe("/t", -1, |_| panic!("status must not dispatch"));

        process_message(
            &client.inner,
            &message(STATUS_CHANNEL, -1, json!({"/t": 7, "/other": 3})),
        );
        assert_eq!(client.inner.channels.lock()["/t"].last_id, 7);
    }

    #[test]
    fn test_flush_can_move_cursor_backwards() {
        let client = test_client();
        client.subscribe("/t", 1_000_000, |_| {});

        process_message(&client.inner, &message(FLUSH_CHANNEL, -1, json!({"/t": 1})));
        assert_eq!(client.inner.channels.lock()["/t"].last_id, 1);
    }

    #[test]
    fn test_handle_batch_parses_array() {
        let client = test_client();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        client.subscribe("/t", 0, move |_| *sink.lock() += 1);

        handle_batch(
            &client.inner,
            r#"[{"global_id":1,"message_id":1,"channel":"/t","data":"x"}]"#,
        )
        .unwrap();
        assert_eq!(*count.lock(), 1);

        assert!(handle_batch(&client.inner, "not json").is_err());
        handle_batch(&client.inner, "  ").unwrap();
    }

    #[test]
    fn test_frame_reader_single_frame() {
        let mut reader = FrameReader::new();
        let frames = reader.push(b"[1,2]\r\n|\r\n");
        assert_eq!(frames, vec!["[1,2]"]);
    }

    #[test]
    fn test_frame_reader_straddled_separator() {
        let mut reader = FrameReader::new();
        assert!(reader.push(b"[1]\r").is_empty());
        assert!(reader.push(b"\n|").is_empty());
        let frames = reader.push(b"\r\n[2]\r\n|\r\n");
        assert_eq!(frames, vec!["[1]", "[2]"]);
    }

    #[test]
    fn test_frame_reader_unescapes() {
        let mut reader = FrameReader::new();
        let frames = reader.push(b"a\r\n||\r\nb\r\n|\r\n");
        assert_eq!(frames, vec!["a\r\n|\r\nb"]);
    }

    #[test]
    fn test_frame_reader_multibyte_across_fragments() {
        let mut reader = FrameReader::new();
        let text = "héllo wörld";
        let wire = format!("{text}\r\n|\r\n");
        let bytes = wire.as_bytes();
        assert!(reader.push(&bytes[..3]).is_empty());
        let frames = reader.push(&bytes[3..]);
        assert_eq!(frames, vec![text]);
    }
}
