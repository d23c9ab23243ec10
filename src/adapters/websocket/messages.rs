//! Client transport control frames and close codes.
//!
//! The first frame of every connection is a handshake; afterwards the
//! wire carries bridge envelopes plus JSON ping/pong heartbeats.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// Close codes of the client boundary.
pub const CLOSE_SERVER_SHUTDOWN: u16 = 1001;
pub const CLOSE_MAX_CLIENTS: u16 = 1013;
pub const CLOSE_HANDSHAKE_TIMEOUT: u16 = 4000;
pub const CLOSE_NOT_HANDSHAKE: u16 = 4001;
pub const CLOSE_INVALID_HANDSHAKE: u16 = 4002;
pub const CLOSE_AUTH_FAILED: u16 = 4003;
pub const CLOSE_IDLE_TIMEOUT: u16 = 4004;
pub const CLOSE_SERVER_DISCONNECT: u16 = 4005;

/// First frame a client must send.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Server reply to the handshake.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub server_version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeResponse {
    pub fn success(session_id: String, namespace: String) -> Self {
        Self {
            kind: "handshake_response",
            success: true,
            session_id: Some(session_id),
            namespace: Some(namespace),
            server_version: env!("CARGO_PKG_VERSION"),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            kind: "handshake_response",
            success: false,
            session_id: None,
            namespace: None,
            server_version: env!("CARGO_PKG_VERSION"),
            error: Some(error.into()),
        }
    }
}

/// Heartbeat frames exchanged at the JSON level.
#[derive(Debug, Clone, Serialize)]
pub struct PingFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: i64,
}

impl PingFrame {
    pub fn at(timestamp: i64) -> Self {
        Self {
            kind: "ping",
            timestamp,
        }
    }
}

/// The category of an inbound text frame, determined by its `type` tag.
#[derive(Debug)]
pub enum InboundKind {
    Handshake(HandshakeRequest),
    Ping,
    Pong,
    /// Anything else: a bridge envelope for the codec.
    Envelope,
    /// Not JSON, or JSON without a usable `type` tag.
    Malformed,
}

/// Classifies a frame without fully decoding envelopes.
pub fn classify(text: &str) -> InboundKind {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return InboundKind::Malformed;
    };
    match value.get("type").and_then(Value::as_str) {
        Some("handshake") => match serde_json::from_value(value) {
            Ok(request) => InboundKind::Handshake(request),
            Err(_) => InboundKind::Malformed,
        },
        Some("ping") => InboundKind::Ping,
        Some("pong") => InboundKind::Pong,
        Some(_) => InboundKind::Envelope,
        None => InboundKind::Malformed,
    }
}
