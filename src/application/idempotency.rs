//! Idempotency cache for command retries.
//!
//! A command's `idempotencyKey` collapses retries within its TTL into a
//! single execution and a single terminal ack. Records move through two
//! distinct lifecycles: an in-flight marker while the handler runs, and
//! a terminal result once the ack arrives. A background sweep removes
//! records older than twice the TTL.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::domain::foundation::{SharedClock, Timestamp};
use crate::domain::message::AckPayload;

/// Default record TTL in milliseconds.
pub const DEFAULT_IDEMPOTENCY_TTL_MS: i64 = 60_000;

/// Sweep cadence for expired records.
pub const SWEEP_INTERVAL_MS: u64 = 10_000;

/// What a key lookup can find.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyState {
    /// The command is being executed; suppress re-dispatch.
    InFlight,
    /// The command finished; replay this terminal ack.
    Terminal(AckPayload),
}

/// Outcome of attempting to begin execution under a key.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// No live record; an in-flight marker was inserted.
    Started,
    /// A handler is already running for this key.
    AlreadyInFlight,
    /// The command already finished within TTL.
    Replay(AckPayload),
}

struct Record {
    state: IdempotencyState,
    inserted_at: Timestamp,
}

/// TTL-bounded cache of command outcomes keyed by idempotency key.
pub struct IdempotencyCache {
    records: Mutex<HashMap<String, Record>>,
    ttl_ms: i64,
    clock: SharedClock,
}

impl IdempotencyCache {
    pub fn new(clock: SharedClock, ttl_ms: i64) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl_ms,
            clock,
        }
    }

    /// Atomically checks the key and, when no live record exists, inserts
    /// an in-flight marker. This check-then-mark runs under one lock so
    /// concurrent retries cannot both start the handler.
    pub fn begin(&self, key: &str) -> BeginOutcome {
        let now = self.clock.now();
        let mut records = self.records.lock();

        if let Some(record) = records.get(key) {
            let age = now.as_millis() - record.inserted_at.as_millis();
            if age <= self.ttl_ms {
                return match &record.state {
                    IdempotencyState::InFlight => BeginOutcome::AlreadyInFlight,
                    IdempotencyState::Terminal(ack) => BeginOutcome::Replay(ack.clone()),
                };
            }
        }

        records.insert(
            key.to_string(),
            Record {
                state: IdempotencyState::InFlight,
                inserted_at: now,
            },
        );
        BeginOutcome::Started
    }

    /// Records the terminal ack for a key, replacing its in-flight marker.
    pub fn complete(&self, key: &str, ack: AckPayload) {
        let mut records = self.records.lock();
        records.insert(
            key.to_string(),
            Record {
                state: IdempotencyState::Terminal(ack),
                inserted_at: self.clock.now(),
            },
        );
    }

    /// Drops an in-flight marker after a failed handler so the caller may
    /// retry. Terminal records are left alone.
    pub fn abandon(&self, key: &str) {
        let mut records = self.records.lock();
        if let Some(record) = records.get(key) {
            if matches!(record.state, IdempotencyState::InFlight) {
                records.remove(key);
            }
        }
    }

    pub fn lookup(&self, key: &str) -> Option<IdempotencyState> {
        let now = self.clock.now();
        let records = self.records.lock();
        records.get(key).and_then(|record| {
            let age = now.as_millis() - record.inserted_at.as_millis();
            (age <= self.ttl_ms).then(|| record.state.clone())
        })
    }

    /// Removes records older than twice the TTL. Returns the count swept.
    pub fn sweep(&self) -> usize {
        let cutoff = self.clock.now().as_millis() - 2 * self.ttl_ms;
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| record.inserted_at.as_millis() >= cutoff);
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}
