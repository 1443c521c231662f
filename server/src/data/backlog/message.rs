//! Message record and wire codec
//!
//! Backends store and notify messages in a single-line wire form:
//! `<global_id>|<message_id>|<channel>|<payload>`. Pipe characters inside the
//! channel name are escaped so the first three separators are unambiguous;
//! the payload is the trailing rest and may contain pipes freely.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::BacklogError;
use crate::core::constants::PIPE_ESCAPE;

/// Immutable message record as stored in a backlog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub global_id: u64,
    pub message_id: u64,
    pub channel: String,
    pub payload: String,
}

impl Message {
    pub fn new(
        global_id: u64,
        message_id: u64,
        channel: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            global_id,
            message_id,
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Encode into the wire form used by backlog stores and notifications
    pub fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.global_id,
            self.message_id,
            escape_channel(&self.channel),
            self.payload
        )
    }

    /// Decode the wire form; the payload keeps any embedded pipes
    pub fn decode(wire: &str) -> Result<Self, BacklogError> {
        let mut parts = wire.splitn(4, '|');
        let global_id = parts
            .next()
            .ok_or_else(|| malformed(wire))?
            .parse::<u64>()
            .map_err(|_| malformed(wire))?;
        let message_id = parts
            .next()
            .ok_or_else(|| malformed(wire))?
            .parse::<u64>()
            .map_err(|_| malformed(wire))?;
        let channel = unescape_channel(parts.next().ok_or_else(|| malformed(wire))?);
        let payload = parts.next().ok_or_else(|| malformed(wire))?.to_string();

        Ok(Self {
            global_id,
            message_id,
            channel,
            payload,
        })
    }
}

fn malformed(wire: &str) -> BacklogError {
    let head: String = wire.chars().take(64).collect();
    BacklogError::Encoding(format!("malformed wire message: {head:?}"))
}

fn escape_channel(channel: &str) -> String {
    channel.replace('|', PIPE_ESCAPE)
}

fn unescape_channel(channel: &str) -> String {
    channel.replace(PIPE_ESCAPE, "|")
}

/// Payload blob carried inside a [`Message`]
///
/// Produced by the bus on publish and decoded again on delivery; targets are
/// `None` when the message is unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_ids: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ids: Option<Vec<String>>,
}

impl MessagePayload {
    pub fn encode(&self) -> Result<String, BacklogError> {
        serde_json::to_string(self).map_err(|e| BacklogError::Encoding(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, BacklogError> {
        serde_json::from_str(raw).map_err(|e| BacklogError::Encoding(e.to_string()))
    }
}
