//! Pattern-keyed subscription registry.
//!
//! Indexed two ways: by subscription id and by client id, so client
//! disconnects can drop every subscription in one sweep. Patterns
//! compile once, at subscription time.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::domain::foundation::{
    BridgeError, CompiledPattern, ErrorCode, SessionId, SharedClock, SubscriptionId, Timestamp,
};

/// What a subscription wants delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionFilter {
    State,
    Events,
    #[default]
    All,
}

/// The two message categories subscriptions discriminate between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    State,
    Event,
}

impl SubscriptionFilter {
    pub fn admits(&self, kind: DeliveryKind) -> bool {
        match (self, kind) {
            (SubscriptionFilter::All, _) => true,
            (SubscriptionFilter::State, DeliveryKind::State) => true,
            (SubscriptionFilter::Events, DeliveryKind::Event) => true,
            _ => false,
        }
    }
}

/// One client's interest in a set of path patterns.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub client_id: SessionId,
    pub patterns: Vec<String>,
    compiled: Vec<CompiledPattern>,
    pub filter: SubscriptionFilter,
    pub snapshot: bool,
    pub snapshot_sent: bool,
    pub created_at: Timestamp,
}

impl Subscription {
    /// First pattern (in insertion order) matching the path, if any.
    pub fn first_match(&self, path: &str) -> Option<&str> {
        self.compiled
            .iter()
            .find(|p| p.matches(path))
            .map(|p| p.raw())
    }

    pub fn matches(&self, path: &str) -> bool {
        self.first_match(path).is_some()
    }

    /// The matchers compiled at subscription time, in pattern order.
    pub fn compiled(&self) -> &[CompiledPattern] {
        &self.compiled
    }

    /// Whether state deltas must still be held back pending the initial
    /// snapshot stream.
    pub fn awaiting_snapshot(&self) -> bool {
        self.snapshot && !self.snapshot_sent
    }
}

/// A subscription paired with the pattern that matched a lookup.
#[derive(Debug, Clone)]
pub struct SubscriptionMatch {
    pub subscription: Subscription,
    pub pattern: String,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<SubscriptionId, Subscription>,
    by_client: HashMap<SessionId, HashSet<SubscriptionId>>,
    /// Creation order, so lookups iterate deterministically.
    order: Vec<SubscriptionId>,
}

/// Registry of all live subscriptions.
pub struct SubscriptionManager {
    inner: RwLock<Inner>,
    clock: SharedClock,
}

impl SubscriptionManager {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock,
        }
    }

    /// Compiles the patterns and registers a subscription.
    pub fn subscribe(
        &self,
        client_id: SessionId,
        patterns: Vec<String>,
        filter: SubscriptionFilter,
        snapshot: bool,
    ) -> Result<SubscriptionId, BridgeError> {
        if patterns.is_empty() {
            return Err(BridgeError::new(
                ErrorCode::SubscriptionFailed,
                "subscription requires at least one pattern",
            ));
        }
        let compiled: Vec<CompiledPattern> = patterns
            .iter()
            .map(|p| {
                CompiledPattern::compile(p).map_err(|e| {
                    BridgeError::new(
                        ErrorCode::SubscriptionFailed,
                        format!("pattern '{p}' rejected: {e}"),
                    )
                })
            })
            .collect::<Result<_, _>>()?;

        let subscription = Subscription {
            id: SubscriptionId::new(),
            client_id,
            patterns,
            compiled,
            filter,
            snapshot,
            snapshot_sent: false,
            created_at: self.clock.now(),
        };

        let id = subscription.id;
        let mut inner = self.inner.write();
        inner.by_client.entry(client_id).or_default().insert(id);
        inner.order.push(id);
        inner.by_id.insert(id, subscription);
        Ok(id)
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Subscription> {
        self.inner.read().by_id.get(&id).cloned()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.write();
        Self::remove(&mut inner, id)
    }

    /// Removes every subscription of `client_id` holding any of the given
    /// exact pattern strings. Returns the number removed.
    pub fn unsubscribe_patterns(&self, client_id: SessionId, patterns: &[String]) -> usize {
        let mut inner = self.inner.write();
        let doomed: Vec<SubscriptionId> = inner
            .by_client
            .get(&client_id)
            .map(|ids| {
                ids.iter()
                    .filter(|id| {
                        inner.by_id.get(*id).is_some_and(|sub| {
                            sub.patterns.iter().any(|p| patterns.contains(p))
                        })
                    })
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        for id in &doomed {
            Self::remove(&mut inner, *id);
        }
        doomed.len()
    }

    /// Removes all subscriptions of a client. Returns the number removed.
    pub fn unsubscribe_client(&self, client_id: SessionId) -> usize {
        let mut inner = self.inner.write();
        let doomed: Vec<SubscriptionId> = inner
            .by_client
            .get(&client_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        for id in &doomed {
            Self::remove(&mut inner, *id);
        }
        doomed.len()
    }

    /// Every subscription whose filter admits `kind` and whose patterns
    /// match `path`; each appears at most once, paired with the first
    /// pattern that matched.
    pub fn matching(&self, path: &str, kind: DeliveryKind) -> Vec<SubscriptionMatch> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id))
            .filter(|sub| sub.filter.admits(kind))
            .filter_map(|sub| {
                sub.first_match(path).map(|pattern| SubscriptionMatch {
                    subscription: sub.clone(),
                    pattern: pattern.to_string(),
                })
            })
            .collect()
    }

    /// Flags a subscription's initial snapshot as delivered.
    pub fn mark_snapshot_sent(&self, id: SubscriptionId) {
        if let Some(sub) = self.inner.write().by_id.get_mut(&id) {
            sub.snapshot_sent = true;
        }
    }

    pub fn count(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn client_subscription_count(&self, client_id: SessionId) -> usize {
        self.inner
            .read()
            .by_client
            .get(&client_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    fn remove(inner: &mut Inner, id: SubscriptionId) -> bool {
        let Some(sub) = inner.by_id.remove(&id) else {
            return false;
        };
        inner.order.retain(|sid| *sid != id);
        if let Some(ids) = inner.by_client.get_mut(&sub.client_id) {
            ids.remove(&id);
            if ids.is_empty() {
                inner.by_client.remove(&sub.client_id);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::foundation::test_support::FixedClock;

    fn manager() -> SubscriptionManager {
        SubscriptionManager::new(FixedClock::at(0))
    }

    fn patterns(ps: &[&str]) -> Vec<String> {
        ps.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn subscribe_and_match_by_path() {
        let manager = manager();
        let client = SessionId::new();
        manager
            .subscribe(
                client,
                patterns(&["companion.variables.**"]),
                SubscriptionFilter::All,
                true,
            )
            .unwrap();

        let matches = manager.matching("companion.variables.tally", DeliveryKind::State);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].pattern, "companion.variables.**");
        assert_eq!(matches[0].subscription.client_id, client);

        assert!(manager.matching("other.path", DeliveryKind::State).is_empty());
    }

    #[test]
    fn filter_discriminates_state_from_events() {
        let manager = manager();
        let client = SessionId::new();
        manager
            .subscribe(client, patterns(&["a.**"]), SubscriptionFilter::State, false)
            .unwrap();
        manager
            .subscribe(client, patterns(&["a.**"]), SubscriptionFilter::Events, false)
            .unwrap();
        manager
            .subscribe(client, patterns(&["a.**"]), SubscriptionFilter::All, false)
            .unwrap();

        assert_eq!(manager.matching("a.b", DeliveryKind::State).len(), 2);
        assert_eq!(manager.matching("a.b", DeliveryKind::Event).len(), 2);
    }

    #[test]
    fn each_subscription_appears_once_with_first_matching_pattern() {
        let manager = manager();
        let client = SessionId::new();
        manager
            .subscribe(
                client,
                patterns(&["a.*", "a.**", "**"]),
                SubscriptionFilter::All,
                false,
            )
            .unwrap();

        let matches = manager.matching("a.b", DeliveryKind::State);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].pattern, "a.*");
    }

    #[test]
    fn empty_pattern_list_fails() {
        let manager = manager();
        let err = manager
            .subscribe(SessionId::new(), vec![], SubscriptionFilter::All, false)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SubscriptionFailed);
    }

    #[test]
    fn unsubscribe_by_id() {
        let manager = manager();
        let id = manager
            .subscribe(
                SessionId::new(),
                patterns(&["a.**"]),
                SubscriptionFilter::All,
                false,
            )
            .unwrap();

        assert!(manager.unsubscribe(id));
        assert!(!manager.unsubscribe(id));
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn unsubscribe_patterns_matches_exact_strings() {
        let manager = manager();
        let client = SessionId::new();
        manager
            .subscribe(client, patterns(&["a.**", "b.**"]), SubscriptionFilter::All, false)
            .unwrap();
        manager
            .subscribe(client, patterns(&["c.**"]), SubscriptionFilter::All, false)
            .unwrap();

        // "a.*" is not an exact match for "a.**".
        assert_eq!(manager.unsubscribe_patterns(client, &patterns(&["a.*"])), 0);
        assert_eq!(manager.unsubscribe_patterns(client, &patterns(&["a.**"])), 1);
        assert_eq!(manager.count(), 1);
    }

    #[test]
    fn unsubscribe_client_sweeps_everything() {
        let manager = manager();
        let client = SessionId::new();
        let other = SessionId::new();
        for p in ["a.**", "b.**", "c.**"] {
            manager
                .subscribe(client, patterns(&[p]), SubscriptionFilter::All, false)
                .unwrap();
        }
        manager
            .subscribe(other, patterns(&["d.**"]), SubscriptionFilter::All, false)
            .unwrap();

        assert_eq!(manager.unsubscribe_client(client), 3);
        assert_eq!(manager.count(), 1);
        assert_eq!(manager.client_subscription_count(client), 0);
        assert_eq!(manager.client_subscription_count(other), 1);
    }

    #[test]
    fn snapshot_flag_gates_until_marked() {
        let manager = manager();
        let id = manager
            .subscribe(
                SessionId::new(),
                patterns(&["a.**"]),
                SubscriptionFilter::All,
                true,
            )
            .unwrap();

        assert!(manager.get(id).unwrap().awaiting_snapshot());
        manager.mark_snapshot_sent(id);
        assert!(!manager.get(id).unwrap().awaiting_snapshot());

        // A no-snapshot subscription never waits.
        let id2 = manager
            .subscribe(
                SessionId::new(),
                patterns(&["a.**"]),
                SubscriptionFilter::All,
                false,
            )
            .unwrap();
        assert!(!manager.get(id2).unwrap().awaiting_snapshot());
    }

    #[test]
    fn matching_iterates_in_creation_order() {
        let manager = manager();
        let first = manager
            .subscribe(SessionId::new(), patterns(&["a.**"]), SubscriptionFilter::All, false)
            .unwrap();
        let second = manager
            .subscribe(SessionId::new(), patterns(&["a.**"]), SubscriptionFilter::All, false)
            .unwrap();

        let matches = manager.matching("a.b", DeliveryKind::State);
        assert_eq!(matches[0].subscription.id, first);
        assert_eq!(matches[1].subscription.id, second);
    }
}
