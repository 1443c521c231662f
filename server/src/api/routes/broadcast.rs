//! Broadcast publish endpoint
//!
//! `POST /message-bus/broadcast?channel=<c>&data=<d>` (parameters may also
//! come form-encoded in the body). Disabled unless `allow_broadcast` is on or
//! the configured admin lookup approves the caller.

use std::collections::HashMap;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;

use super::BusApiState;
use crate::api::types::ApiError;
use crate::domain::bus::{PollRequest, PublishArgs};

#[derive(Serialize)]
struct BroadcastResponse {
    global_id: Option<u64>,
}

pub async fn broadcast(
    State(state): State<BusApiState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let bus = &state.bus;

    let mut params = query.clone();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.starts_with("application/x-www-form-urlencoded") {
        match serde_urlencoded::from_bytes::<Vec<(String, String)>>(&body) {
            Ok(pairs) => params.extend(pairs),
            Err(e) => {
                return ApiError::bad_request("INVALID_BODY", e.to_string()).into_response();
            }
        }
    }

    let allowed = bus.config().allow_broadcast || {
        let hooks = bus.hooks();
        let request = PollRequest {
            headers: headers.clone(),
            path: "/message-bus/broadcast".to_string(),
            query,
        };
        hooks
            .is_admin_lookup
            .as_ref()
            .is_some_and(|f| f(&request).unwrap_or(false))
    };
    if !allowed {
        return ApiError::forbidden("BROADCAST_DISABLED", "broadcasting is not allowed")
            .into_response();
    }

    let Some(channel) = params.get("channel") else {
        return ApiError::bad_request("MISSING_CHANNEL", "channel parameter required")
            .into_response();
    };
    let Some(data) = params.get("data") else {
        return ApiError::bad_request("MISSING_DATA", "data parameter required").into_response();
    };

    match bus
        .publish(channel, Value::String(data.clone()), PublishArgs::default())
        .await
    {
        Ok(global_id) => Json(BroadcastResponse { global_id }).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}
