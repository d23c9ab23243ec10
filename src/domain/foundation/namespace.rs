//! Namespace value object.
//!
//! A namespace is a dotted lowercase identifier designating a logical
//! participant: `companion.satellite`, `hub.core`, `app.<client>`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use super::ValidationError;

/// Maximum namespace length in characters.
pub const MAX_NAMESPACE_LEN: usize = 128;

/// Maximum sanitized client-name length.
const MAX_CLIENT_NAME_LEN: usize = 32;

/// The namespace the router uses for its own emissions.
pub const HUB_CORE: &str = "hub.core";

fn namespace_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Interior underscores admitted so sanitized client names remain
    // addressable (`app.my_client`).
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*)*$").expect("valid regex"))
}

/// Validated dotted namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    /// Validates and wraps a namespace string.
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        Self::validate_str("namespace", &value)?;
        Ok(Self(value))
    }

    /// Validates a namespace found at a specific envelope field.
    pub fn parse_field(field: &str, value: &str) -> Result<Self, ValidationError> {
        Self::validate_str(field, value)?;
        Ok(Self(value.to_string()))
    }

    fn validate_str(field: &str, value: &str) -> Result<(), ValidationError> {
        if value.len() > MAX_NAMESPACE_LEN {
            return Err(ValidationError::too_long(field, MAX_NAMESPACE_LEN));
        }
        if !namespace_regex().is_match(value) {
            return Err(ValidationError::invalid_format(
                field,
                "expected dotted lowercase identifier",
            ));
        }
        Ok(())
    }

    /// The router's own identity.
    pub fn hub_core() -> Self {
        Self(HUB_CORE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Successive dot-trimmed prefixes, longest first, excluding self.
    ///
    /// `companion.satellite.dev` yields `companion.satellite`, `companion`.
    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        let s = self.0.as_str();
        s.char_indices()
            .rev()
            .filter(|(_, c)| *c == '.')
            .map(move |(i, _)| &s[..i])
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Namespace {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Derives the `app.<name>` namespace for an accepted client.
///
/// Lowercases, replaces each character outside `[a-z0-9]` with `_`,
/// trims leading and trailing underscores, truncates to 32 characters,
/// and substitutes `client` when nothing survives.
pub fn client_namespace(name: &str) -> Namespace {
    let mut sanitized: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '_' })
        .collect();
    sanitized.truncate(MAX_CLIENT_NAME_LEN);
    let trimmed = sanitized.trim_matches('_');
    let name = if trimmed.is_empty() { "client" } else { trimmed };
    Namespace(format!("app.{name}"))
}
