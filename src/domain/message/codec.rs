//! JSON wire codec for bridge messages.
//!
//! Decoding is strict: malformed JSON, a `type` tag that disagrees with
//! the payload shape, and every constraint violation map to
//! `INVALID_MESSAGE`. Encode∘decode is identity over valid messages.

use crate::domain::foundation::{BridgeError, ErrorCode};

use super::envelope::BridgeMessage;

/// Decodes and validates one wire frame.
pub fn decode(text: &str) -> Result<BridgeMessage, BridgeError> {
    let message: BridgeMessage = serde_json::from_str(text).map_err(|e| {
        BridgeError::new(ErrorCode::InvalidMessage, format!("malformed message: {e}"))
    })?;
    message.validate()?;
    Ok(message)
}

/// Encodes a message for the wire.
pub fn encode(message: &BridgeMessage) -> Result<String, BridgeError> {
    serde_json::to_string(message).map_err(|e| {
        BridgeError::new(
            ErrorCode::InternalError,
            format!("message serialization failed: {e}"),
        )
    })
}
