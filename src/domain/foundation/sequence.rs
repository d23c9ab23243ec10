//! Per-source monotonic sequence counters.
//!
//! Every emitting identity (each client session, the satellite adapter,
//! the router's own `hub.core`) owns an independent counter. Counters
//! begin at zero, never decrease, and are unaffected by wall-clock
//! jumps.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::Namespace;

/// Registry of per-source sequence counters.
#[derive(Debug, Default)]
pub struct SequenceRegistry {
    counters: Mutex<HashMap<Namespace, u64>>,
}

impl SequenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next sequence number for `source` and advances the
    /// counter. The first call for a source returns 0.
    pub fn next(&self, source: &Namespace) -> u64 {
        let mut counters = self.counters.lock();
        let counter = counters.entry(source.clone()).or_insert(0);
        let current = *counter;
        *counter += 1;
        current
    }

    /// Current counter value without advancing (0 for unseen sources).
    pub fn peek(&self, source: &Namespace) -> u64 {
        self.counters.lock().get(source).copied().unwrap_or(0)
    }

    /// Drops a source's counter, e.g. when its session ends.
    pub fn forget(&self, source: &Namespace) {
        self.counters.lock().remove(source);
    }
}
