//! The canonical owner-scoped, versioned key-value store.
//!
//! Single write-mutable structure the core exposes. Every mutation bumps
//! the global version atomically with the per-entry version, and every
//! delta reaches every registered listener in write order. Listeners run
//! under the store lock and must therefore be cheap and must not call
//! back into the store; the router's listener only enqueues.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

use crate::domain::foundation::{
    BridgeError, CompiledPattern, ErrorCode, Namespace, SharedClock,
};

use super::entry::{StateDelta, StateEntry};

/// Listener invoked for every delta.
pub type StateListener = Arc<dyn Fn(&StateDelta) + Send + Sync>;

/// Handle for removing a previously registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Inner {
    /// BTreeMap so snapshots and pattern queries enumerate in a stable
    /// path order.
    entries: BTreeMap<String, StateEntry>,
    global_version: u64,
    listeners: Vec<(ListenerId, StateListener)>,
    next_listener_id: u64,
}

/// Owner-scoped versioned map with delta notifications.
pub struct StateStore {
    inner: RwLock<Inner>,
    clock: SharedClock,
}

impl StateStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: BTreeMap::new(),
                global_version: 0,
                listeners: Vec::new(),
                next_listener_id: 0,
            }),
            clock,
        }
    }

    pub fn get(&self, path: &str) -> Option<StateEntry> {
        self.inner.read().entries.get(path).cloned()
    }

    pub fn has(&self, path: &str) -> bool {
        self.inner.read().entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Global monotonic counter, incremented on every mutation.
    pub fn global_version(&self) -> u64 {
        self.inner.read().global_version
    }

    pub fn add_listener(&self, listener: StateListener) -> ListenerId {
        let mut inner = self.inner.write();
        let id = ListenerId(inner.next_listener_id);
        inner.next_listener_id += 1;
        inner.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.inner.write().listeners.retain(|(lid, _)| *lid != id);
    }

    /// Applies the write rule: create-or-owner-match, else
    /// `STATE_CONFLICT` and the store is unchanged.
    ///
    /// Returns the delta if anything changed; a structurally equal value
    /// from the owner of a fresh entry is suppressed with no version
    /// bump and no notification.
    pub fn set(
        &self,
        path: &str,
        value: Value,
        owner: &Namespace,
    ) -> Result<Option<StateDelta>, BridgeError> {
        let mut inner = self.inner.write();

        let (entry, previous_version) = match inner.entries.get(path) {
            Some(existing) => {
                if existing.owner != *owner {
                    return Err(BridgeError::new(
                        ErrorCode::StateConflict,
                        format!("path '{path}' is owned by '{}'", existing.owner),
                    )
                    .with_detail("path", path)
                    .with_detail("owner", existing.owner.as_str()));
                }
                if existing.value == value && !existing.stale {
                    return Ok(None);
                }
                let entry = StateEntry {
                    path: path.to_string(),
                    value,
                    owner: owner.clone(),
                    version: existing.version + 1,
                    stale: false,
                    updated_at: self.clock.now(),
                };
                (entry, Some(existing.version))
            }
            None => {
                let entry = StateEntry {
                    path: path.to_string(),
                    value,
                    owner: owner.clone(),
                    version: 1,
                    stale: false,
                    updated_at: self.clock.now(),
                };
                (entry, None)
            }
        };

        inner.entries.insert(path.to_string(), entry.clone());
        inner.global_version += 1;

        let delta = StateDelta {
            path: path.to_string(),
            entry,
            previous_version,
        };
        Self::notify(&inner, &delta);
        Ok(Some(delta))
    }

    /// Sequential individual `set` calls with per-update results.
    pub fn set_bulk(
        &self,
        updates: Vec<(String, Value)>,
        owner: &Namespace,
    ) -> Vec<Result<Option<StateDelta>, BridgeError>> {
        updates
            .into_iter()
            .map(|(path, value)| self.set(&path, value, owner))
            .collect()
    }

    /// Owner-checked deletion. Emits a final delta with a null value and
    /// an incremented version, then removes the entry.
    pub fn delete(
        &self,
        path: &str,
        owner: &Namespace,
    ) -> Result<Option<StateDelta>, BridgeError> {
        let mut inner = self.inner.write();

        let existing = match inner.entries.get(path) {
            Some(e) => e.clone(),
            None => return Ok(None),
        };
        if existing.owner != *owner {
            return Err(BridgeError::new(
                ErrorCode::StateConflict,
                format!("path '{path}' is owned by '{}'", existing.owner),
            )
            .with_detail("path", path));
        }

        let delta = Self::remove_entry(&mut inner, &existing, self.clock.now());
        Ok(Some(delta))
    }

    /// Flags every entry owned by `owner` stale. Idempotent: only flips
    /// that change anything bump versions and notify.
    pub fn mark_owner_stale(&self, owner: &Namespace) -> usize {
        self.flip_stale(owner, true)
    }

    /// Clears the stale flag on every entry owned by `owner`.
    pub fn clear_owner_stale(&self, owner: &Namespace) -> usize {
        self.flip_stale(owner, false)
    }

    fn flip_stale(&self, owner: &Namespace, stale: bool) -> usize {
        let mut inner = self.inner.write();
        let now = self.clock.now();

        let paths: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.owner == *owner && e.stale != stale)
            .map(|e| e.path.clone())
            .collect();

        for path in &paths {
            let entry = inner.entries.get_mut(path).expect("path just enumerated");
            let previous_version = entry.version;
            entry.stale = stale;
            entry.version += 1;
            entry.updated_at = now;
            let delta = StateDelta {
                path: path.clone(),
                entry: entry.clone(),
                previous_version: Some(previous_version),
            };
            inner.global_version += 1;
            Self::notify(&inner, &delta);
        }
        paths.len()
    }

    /// Emits one deletion delta per entry owned by `owner`, then removes
    /// them.
    pub fn delete_by_owner(&self, owner: &Namespace) -> usize {
        let mut inner = self.inner.write();
        let now = self.clock.now();

        let doomed: Vec<StateEntry> = inner
            .entries
            .values()
            .filter(|e| e.owner == *owner)
            .cloned()
            .collect();
        for entry in &doomed {
            Self::remove_entry(&mut inner, entry, now);
        }
        doomed.len()
    }

    /// Emits deletion deltas for every entry, then empties the store.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.write();
        let now = self.clock.now();

        let doomed: Vec<StateEntry> = inner.entries.values().cloned().collect();
        for entry in &doomed {
            Self::remove_entry(&mut inner, entry, now);
        }
        doomed.len()
    }

    pub fn matching_paths(&self, pattern: &CompiledPattern) -> Vec<String> {
        self.inner
            .read()
            .entries
            .keys()
            .filter(|path| pattern.matches(path))
            .cloned()
            .collect()
    }

    pub fn matching_entries(&self, pattern: &CompiledPattern) -> Vec<StateEntry> {
        self.snapshot_for_pattern(pattern)
    }

    /// Point-in-time set of entries matching a pattern, in enumeration
    /// (path) order.
    pub fn snapshot_for_pattern(&self, pattern: &CompiledPattern) -> Vec<StateEntry> {
        self.inner
            .read()
            .entries
            .values()
            .filter(|e| pattern.matches(&e.path))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<StateEntry> {
        self.inner.read().entries.values().cloned().collect()
    }

    fn remove_entry(
        inner: &mut Inner,
        existing: &StateEntry,
        now: crate::domain::foundation::Timestamp,
    ) -> StateDelta {
        let tombstone = StateEntry {
            path: existing.path.clone(),
            value: Value::Null,
            owner: existing.owner.clone(),
            version: existing.version + 1,
            stale: existing.stale,
            updated_at: now,
        };
        inner.entries.remove(&existing.path);
        inner.global_version += 1;
        let delta = StateDelta {
            path: existing.path.clone(),
            entry: tombstone,
            previous_version: Some(existing.version),
        };
        Self::notify(inner, &delta);
        delta
    }

    fn notify(inner: &Inner, delta: &StateDelta) {
        for (id, listener) in &inner.listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener(delta)));
            if result.is_err() {
                warn!(listener = ?id, path = %delta.path, "state listener panicked");
            }
        }
    }
}
