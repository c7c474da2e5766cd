//! JSON message envelope exchanged over the tunnel.

use crate::connection::epoch_millis;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminator carried in the envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Ping,
    Pong,
    Close,
    Response,
    Error,
    /// Anything else a client sends; logged and dropped.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Epoch milliseconds
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Seconds the client should wait before retrying
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl TunnelMessage {
    fn new(kind: MessageType) -> Self {
        Self {
            kind,
            request_id: None,
            payload: None,
            timestamp: epoch_millis(),
            error: None,
            retry_after: None,
        }
    }

    pub fn request(request_id: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id: Some(request_id.into()),
            payload: Some(payload),
            ..Self::new(MessageType::Request)
        }
    }

    pub fn response(request_id: Option<String>, payload: Value) -> Self {
        Self {
            request_id,
            payload: Some(payload),
            ..Self::new(MessageType::Response)
        }
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping)
    }

    /// Pong answering an application-level ping; echoes its request id.
    pub fn pong(request_id: Option<String>) -> Self {
        Self {
            request_id,
            ..Self::new(MessageType::Pong)
        }
    }

    pub fn close() -> Self {
        Self::new(MessageType::Close)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(MessageType::Error)
        }
    }

    pub fn rate_limited(retry_after: Option<u64>) -> Self {
        Self {
            retry_after,
            ..Self::error("Rate limit exceeded")
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
