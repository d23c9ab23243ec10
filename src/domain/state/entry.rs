//! State entries and mutation deltas.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::foundation::{Namespace, Timestamp};

/// One owner-scoped, versioned entry in the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEntry {
    pub path: String,
    pub value: Value,
    pub owner: Namespace,
    /// Monotonic per-path version, starting at 1. Bumps on every
    /// mutation including stale flips and the final deletion delta.
    pub version: u64,
    pub stale: bool,
    pub updated_at: Timestamp,
}

impl StateEntry {
    /// Whether this entry describes a deletion (terminal null value).
    pub fn is_deletion(&self) -> bool {
        self.value.is_null()
    }
}

/// A record of one mutation, delivered to every store listener in the
/// order the triggering writes occurred.
#[derive(Debug, Clone, PartialEq)]
pub struct StateDelta {
    pub path: String,
    pub entry: StateEntry,
    /// `None` on creation.
    pub previous_version: Option<u64>,
}
