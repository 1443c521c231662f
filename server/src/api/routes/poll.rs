//! Long-poll endpoint
//!
//! `POST /message-bus/{client_id}` with a body mapping channel → last seen
//! id, form-urlencoded (`<channel>=<id>` pairs plus `__seq`) or JSON. The
//! immediate backlog is returned straight away; otherwise the connection is
//! parked with the ConnectionManager until a matching message arrives or the
//! long-poll interval elapses. With chunked encoding enabled, multiple
//! batches stream over one response as application frames; the query flag
//! `dlp=t` forces a plain poll and the `Dont-Chunk: true` header disables
//! framing.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use super::BusApiState;
use crate::api::types::ApiError;
use crate::core::constants::DIAGNOSTICS_PREFIX;
use crate::domain::bus::{BusHooks, MessageBus, PollClient, PollRequest};
use crate::domain::bus::client::PollClientArgs;

pub async fn poll(
    State(state): State<BusApiState>,
    Path(client_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_poll(state, client_id, uri, query, headers, body).await
}

pub async fn poll_with_rest(
    State(state): State<BusApiState>,
    Path((client_id, _rest)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_poll(state, client_id, uri, query, headers, body).await
}

async fn handle_poll(
    state: BusApiState,
    client_id: String,
    uri: Uri,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // The diagnostics UI is an external subsystem; nothing to dispatch here
    if client_id.is_empty() || uri.path().contains(DIAGNOSTICS_PREFIX) {
        return ApiError::not_found("NO_CLIENT", "no client id in path").into_response();
    }

    let bus = state.bus.clone();
    let hooks = bus.hooks().clone();
    let request = PollRequest {
        headers: headers.clone(),
        path: uri.path().to_string(),
        query: query.clone(),
    };

    // Identity lookups may fail; a configured error hook maps the failure
    let site_id = match run_lookup(&hooks, hooks.site_id_lookup.as_ref().map(|f| f(&request))) {
        Ok(v) => v.flatten(),
        Err(response) => return response,
    };
    let user_id = match run_lookup(&hooks, hooks.user_id_lookup.as_ref().map(|f| f(&request))) {
        Ok(v) => v.flatten(),
        Err(response) => return response,
    };
    let group_ids = match run_lookup(&hooks, hooks.group_ids_lookup.as_ref().map(|f| f(&request)))
    {
        Ok(v) => v.unwrap_or_default(),
        Err(response) => return response,
    };

    let (subscriptions, seq) = match parse_poll_body(&headers, &body) {
        Ok(parsed) => parsed,
        Err(e) => return e.into_response(),
    };

    let use_chunked = bus.config().chunked_encoding_enabled && !dont_chunk(&headers);

    let (client, rx) = PollClient::new(PollClientArgs {
        client_id,
        user_id,
        group_ids,
        site_id,
        seq,
        use_chunked,
    });

    for (channel, cursor) in subscriptions {
        let cursor = match cursor {
            Some(cursor) => cursor,
            // Absent/empty cursor means "from the current head"
            None => match bus.last_id(&channel, client.site_id.as_deref()).await {
                Ok(last_id) => last_id as i64,
                Err(e) => return ApiError::from(e).into_response(),
            },
        };
        client.subscribe(channel, cursor);
    }

    let backlog = match client.backlog(&bus).await {
        Ok(backlog) => backlog,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let extra_headers = hooks
        .extra_response_headers_lookup
        .as_ref()
        .map(|f| f(&request))
        .unwrap_or_default();

    let long_poll = bus.config().long_polling_enabled
        && query.get("dlp").map(String::as_str) != Some("t");

    if use_chunked {
        chunked_response(&state, &bus, client, rx, &backlog, long_poll, extra_headers)
    } else if !backlog.is_empty() {
        json_response(
            serde_json::to_string(&backlog).unwrap_or_else(|_| "[]".to_string()),
            extra_headers,
        )
    } else if long_poll {
        parked_response(&state, &bus, client, rx, extra_headers).await
    } else {
        json_response("[]".to_string(), extra_headers)
    }
}

/// Park a single-shot client; the body is whatever the writer produces first
/// (a live delivery or the cleanup timer's empty payload)
async fn parked_response(
    state: &BusApiState,
    bus: &MessageBus,
    client: Arc<PollClient>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Bytes>,
    extra_headers: Vec<(String, String)>,
) -> Response {
    let interval = bus.config().long_polling_interval();
    park_client(bus, &client, interval);

    let shutdown = state.shutdown.wait();
    let connections = Arc::clone(bus.connections());

    let body = tokio::select! {
        item = rx.recv() => item.unwrap_or_else(|| Bytes::from_static(b"[]")),
        _ = shutdown => {
            connections.remove_client(&client);
            Bytes::from_static(b"[]")
        }
        // Safety net over the cleanup timer
        _ = tokio::time::sleep(interval + Duration::from_secs(5)) => {
            connections.remove_client(&client);
            Bytes::from_static(b"[]")
        }
    };

    json_response(
        String::from_utf8(body.to_vec()).unwrap_or_else(|_| "[]".to_string()),
        extra_headers,
    )
}

/// Stream batches as application frames over one response
fn chunked_response(
    state: &BusApiState,
    bus: &MessageBus,
    client: Arc<PollClient>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Bytes>,
    backlog: &[crate::domain::bus::BusMessage],
    long_poll: bool,
    extra_headers: Vec<(String, String)>,
) -> Response {
    if backlog.is_empty() {
        // An early empty frame defeats buffering proxies
        client.ensure_first_frame();
    } else {
        client.deliver_backlog(backlog);
    }

    if long_poll {
        park_client(bus, &client, bus.config().long_polling_interval());
    } else {
        client.close();
    }

    let mut shutdown_rx = state.shutdown.subscribe();
    let connections = Arc::clone(bus.connections());
    let stream = async_stream::stream! {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        connections.remove_client(&client);
                        break;
                    }
                }
                item = rx.recv() => {
                    match item {
                        Some(bytes) => yield Ok::<Bytes, Infallible>(bytes),
                        None => break,
                    }
                }
            }
        }
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CACHE_CONTROL, "must-revalidate, private, max-age=0")
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header("X-Content-Type-Options", "nosniff");
    for (name, value) in extra_headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Register with the manager and arm the cleanup timer
fn park_client(bus: &MessageBus, client: &Arc<PollClient>, interval: Duration) {
    bus.connections().add_client(Arc::clone(client));

    let connections = Arc::clone(bus.connections());
    let timer_client = Arc::clone(client);
    let handle = bus.timer().queue(interval, move || {
        connections.remove_client(&timer_client);
        Ok(())
    });
    client.set_cleanup_timer(handle);
}

fn json_response(body: String, extra_headers: Vec<(String, String)>) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CACHE_CONTROL, "must-revalidate, private, max-age=0")
        .header(header::CONTENT_TYPE, "application/json; charset=utf-8");
    for (name, value) in extra_headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn dont_chunk(headers: &HeaderMap) -> bool {
    headers
        .get("Dont-Chunk")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "t")
}

/// Map a lookup failure through `on_middleware_error`; unmapped errors
/// surface as a plain 500
fn run_lookup<T>(
    hooks: &BusHooks,
    result: Option<anyhow::Result<T>>,
) -> Result<Option<T>, Response> {
    match result {
        None => Ok(None),
        Some(Ok(value)) => Ok(Some(value)),
        Some(Err(e)) => {
            if let Some(on_error) = &hooks.on_middleware_error
                && let Some((status, body)) = on_error(&e)
            {
                let status =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                return Err((status, body).into_response());
            }
            Err(ApiError::internal(e.to_string()).into_response())
        }
    }
}

/// Parse the subscription map and `__seq` from a form or JSON body
///
/// Cursor values: empty/null → `None` ("current head"); unparsable text
/// falls back to 0, matching permissive form handling.
fn parse_poll_body(
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(Vec<(String, Option<i64>)>, u64), ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let mut subscriptions = Vec::new();
    let mut seq = 0u64;

    if content_type.starts_with("application/json") {
        let map: serde_json::Map<String, Value> = serde_json::from_slice(body)
            .map_err(|e| ApiError::bad_request("INVALID_BODY", e.to_string()))?;
        for (key, value) in map {
            if key == "__seq" {
                seq = json_seq(&value);
            } else {
                subscriptions.push((key, json_cursor(&value)));
            }
        }
    } else {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(body)
            .map_err(|e| ApiError::bad_request("INVALID_BODY", e.to_string()))?;
        for (key, value) in pairs {
            if key == "__seq" {
                seq = value.trim().parse().unwrap_or(0);
            } else {
                subscriptions.push((key, text_cursor(&value)));
            }
        }
    }

    Ok((subscriptions, seq))
}

fn text_cursor(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.parse().unwrap_or(0))
    }
}

fn json_cursor(value: &Value) -> Option<i64> {
    match value {
        Value::Null => None,
        Value::Number(n) => Some(n.as_i64().unwrap_or(0)),
        Value::String(s) => text_cursor(s),
        _ => Some(0),
    }
}

fn json_seq(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}
