//! Message envelope, typed payloads, and the JSON wire codec.

mod codec;
mod envelope;
mod payload;

pub use codec::{decode, encode};
pub use envelope::{
    BridgeMessage, MessageKind, MAX_NAME_LEN, MAX_PATTERNS, TTL_MAX_MS, TTL_MIN_MS,
};
pub use payload::{
    AckPayload, AckStatus, CommandPayload, ErrorPayload, EventPayload, MessagePayload,
    StatePayload, SubscribePayload, UnsubscribePayload,
};

pub use crate::domain::foundation::MessageId;
