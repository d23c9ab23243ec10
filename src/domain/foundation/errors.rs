//! Error types shared across the hub core.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use thiserror::Error;

/// Errors that occur while validating wire input.
///
/// Each variant names the offending field so senders can see exactly
/// which part of their message was rejected.
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Field '{field}' is required for this message type")]
    MissingField { field: String },

    #[error("Field '{field}' must be between {min} and {max}, got {actual}")]
    OutOfRange {
        field: String,
        min: i64,
        max: i64,
        actual: i64,
    },

    #[error("Field '{field}' has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    #[error("Field '{field}' exceeds maximum length {max}")]
    TooLong { field: String, max: usize },
}

impl ValidationError {
    pub fn missing(field: impl Into<String>) -> Self {
        ValidationError::MissingField {
            field: field.into(),
        }
    }

    pub fn out_of_range(field: impl Into<String>, min: i64, max: i64, actual: i64) -> Self {
        ValidationError::OutOfRange {
            field: field.into(),
            min,
            max,
            actual,
        }
    }

    pub fn invalid_format(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::InvalidFormat {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn too_long(field: impl Into<String>, max: usize) -> Self {
        ValidationError::TooLong {
            field: field.into(),
            max,
        }
    }

    /// The path of the field the error anchors to.
    pub fn field(&self) -> &str {
        match self {
            ValidationError::MissingField { field }
            | ValidationError::OutOfRange { field, .. }
            | ValidationError::InvalidFormat { field, .. }
            | ValidationError::TooLong { field, .. } => field,
        }
    }
}

/// Stable error codes carried on `error` messages and `failed` acks.
///
/// The string literals are part of the wire contract; message text is
/// human-oriented and may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidMessage,
    UnknownTarget,
    Timeout,
    RateLimited,
    Unauthorized,
    Forbidden,
    AdapterError,
    StateConflict,
    SubscriptionFailed,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::UnknownTarget => "UNKNOWN_TARGET",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::AdapterError => "ADAPTER_ERROR",
            ErrorCode::StateConflict => "STATE_CONFLICT",
            ErrorCode::SubscriptionFailed => "SUBSCRIPTION_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Standard hub error with code, message, and optional details.
#[derive(Debug, Clone)]
pub struct BridgeError {
    pub code: ErrorCode,
    pub message: String,
    pub details: HashMap<String, String>,
}

impl BridgeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: HashMap::new(),
        }
    }

    /// Creates an `INVALID_MESSAGE` error from a validation failure,
    /// preserving the offending field path as a detail.
    pub fn invalid_message(err: &ValidationError) -> Self {
        Self::new(ErrorCode::InvalidMessage, err.to_string())
            .with_detail("field", err.field().to_string())
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for BridgeError {}

impl From<ValidationError> for BridgeError {
    fn from(err: ValidationError) -> Self {
        BridgeError::invalid_message(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_renders_stable_literals() {
        assert_eq!(ErrorCode::InvalidMessage.to_string(), "INVALID_MESSAGE");
        assert_eq!(ErrorCode::StateConflict.to_string(), "STATE_CONFLICT");
        assert_eq!(ErrorCode::UnknownTarget.to_string(), "UNKNOWN_TARGET");
        assert_eq!(
            ErrorCode::SubscriptionFailed.to_string(),
            "SUBSCRIPTION_FAILED"
        );
    }

    #[test]
    fn bridge_error_displays_code_and_message() {
        let err = BridgeError::new(ErrorCode::Timeout, "command timed out");
        assert_eq!(format!("{}", err), "[TIMEOUT] command timed out");
    }

    #[test]
    fn validation_error_converts_with_field_detail() {
        let v = ValidationError::too_long("source", 128);
        let err: BridgeError = v.into();
        assert_eq!(err.code, ErrorCode::InvalidMessage);
        assert_eq!(err.details.get("field"), Some(&"source".to_string()));
    }

    #[test]
    fn out_of_range_names_the_bounds() {
        let err = ValidationError::out_of_range("ttl", 1, 300_000, 0);
        assert_eq!(
            format!("{}", err),
            "Field 'ttl' must be between 1 and 300000, got 0"
        );
    }
}
