//! The bridge message envelope.
//!
//! Every frame exchanged with clients and translated from the upstream
//! wire is one of these. The envelope carries routing metadata; the
//! payload is discriminated by the `type` tag.

use serde::{Deserialize, Serialize};

use crate::domain::foundation::{
    validate_path, Clock, MessageId, Namespace, Timestamp, ValidationError,
};

use super::payload::{
    AckPayload, CommandPayload, EventPayload, MessagePayload, StatePayload, SubscribePayload,
};

/// Minimum and maximum command time-to-live in milliseconds.
pub const TTL_MIN_MS: u64 = 1;
pub const TTL_MAX_MS: u64 = 300_000;

/// Bounds on subscribe/unsubscribe pattern lists.
pub const MAX_PATTERNS: usize = 100;

/// Bounds on command action and event names.
pub const MAX_NAME_LEN: usize = 64;

/// Discriminant of a message, mirroring the wire `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Command,
    Event,
    State,
    Ack,
    Error,
    Subscribe,
    Unsubscribe,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Event => "event",
            MessageKind::State => "state",
            MessageKind::Ack => "ack",
            MessageKind::Error => "error",
            MessageKind::Subscribe => "subscribe",
            MessageKind::Unsubscribe => "unsubscribe",
        }
    }
}

/// The unit of exchange between clients, router, and adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeMessage {
    pub id: MessageId,
    #[serde(flatten)]
    pub payload: MessagePayload,
    pub source: Namespace,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Namespace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub timestamp: Timestamp,
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl BridgeMessage {
    /// Builds an envelope stamped with a fresh id, the clock's current
    /// time, and the caller-supplied sequence number.
    pub fn new(
        source: Namespace,
        payload: MessagePayload,
        clock: &dyn Clock,
        sequence: u64,
    ) -> Self {
        Self {
            id: MessageId::generate(clock),
            payload,
            source,
            target: None,
            path: None,
            timestamp: clock.now(),
            sequence,
            correlation_id: None,
            ttl: None,
            idempotency_key: None,
        }
    }

    pub fn with_target(mut self, target: Namespace) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn kind(&self) -> MessageKind {
        match &self.payload {
            MessagePayload::Command(_) => MessageKind::Command,
            MessagePayload::Event(_) => MessageKind::Event,
            MessagePayload::State(_) => MessageKind::State,
            MessagePayload::Ack(_) => MessageKind::Ack,
            MessagePayload::Error(_) => MessageKind::Error,
            MessagePayload::Subscribe(_) => MessageKind::Subscribe,
            MessagePayload::Unsubscribe(_) => MessageKind::Unsubscribe,
        }
    }

    pub fn as_command(&self) -> Option<&CommandPayload> {
        match &self.payload {
            MessagePayload::Command(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&EventPayload> {
        match &self.payload {
            MessagePayload::Event(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_state(&self) -> Option<&StatePayload> {
        match &self.payload {
            MessagePayload::State(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_ack(&self) -> Option<&AckPayload> {
        match &self.payload {
            MessagePayload::Ack(p) => Some(p),
            _ => None,
        }
    }

    /// Applies every size, range, and regex constraint of the envelope
    /// contract. Returns the first violation with its field path.
    pub fn validate(&self) -> Result<(), ValidationError> {
        Namespace::parse_field("source", self.source.as_str())?;
        if let Some(target) = &self.target {
            Namespace::parse_field("target", target.as_str())?;
        }
        if let Some(path) = &self.path {
            validate_path("path", path)?;
        }
        if let Some(ttl) = self.ttl {
            if !(TTL_MIN_MS..=TTL_MAX_MS).contains(&ttl) {
                return Err(ValidationError::out_of_range(
                    "ttl",
                    TTL_MIN_MS as i64,
                    TTL_MAX_MS as i64,
                    ttl as i64,
                ));
            }
        }

        match &self.payload {
            MessagePayload::Command(cmd) => {
                if self.target.is_none() {
                    return Err(ValidationError::missing("target"));
                }
                if self.idempotency_key.as_deref().unwrap_or("").is_empty() {
                    return Err(ValidationError::missing("idempotencyKey"));
                }
                validate_name("payload.action", &cmd.action)?;
            }
            MessagePayload::Event(event) => {
                if self.path.is_none() {
                    return Err(ValidationError::missing("path"));
                }
                validate_name("payload.event", &event.event)?;
            }
            MessagePayload::State(_) => {
                if self.path.is_none() {
                    return Err(ValidationError::missing("path"));
                }
            }
            MessagePayload::Ack(_) => {
                if self.target.is_none() {
                    return Err(ValidationError::missing("target"));
                }
            }
            MessagePayload::Error(err) => {
                if err.code.is_empty() {
                    return Err(ValidationError::missing("payload.code"));
                }
            }
            MessagePayload::Subscribe(sub) => {
                validate_patterns(&sub.patterns)?;
            }
            MessagePayload::Unsubscribe(unsub) => {
                validate_patterns(&unsub.patterns)?;
            }
        }

        Ok(())
    }
}

fn validate_name(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::missing(field));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(ValidationError::too_long(field, MAX_NAME_LEN));
    }
    Ok(())
}

fn validate_patterns(patterns: &[String]) -> Result<(), ValidationError> {
    if patterns.is_empty() {
        return Err(ValidationError::missing("payload.patterns"));
    }
    if patterns.len() > MAX_PATTERNS {
        return Err(ValidationError::out_of_range(
            "payload.patterns",
            1,
            MAX_PATTERNS as i64,
            patterns.len() as i64,
        ));
    }
    for (i, pattern) in patterns.iter().enumerate() {
        crate::domain::foundation::pattern_to_regex(pattern)
            .map_err(|_| {
                ValidationError::invalid_format(
                    format!("payload.patterns[{i}]"),
                    "invalid subscription pattern",
                )
            })
            .map(|_| ())?;
    }
    Ok(())
}
