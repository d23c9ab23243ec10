//! The message router.
//!
//! Owns the state store, the subscription manager, the target table, the
//! idempotency cache, and the pending-command map. All delta fan-out and
//! snapshot streaming serialize through one ordered dispatch queue so
//! subscribers observe snapshots and deltas in a consistent order.
//!
//! No core lock is held across a target handler invocation; handlers may
//! re-enter `route()` freely.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::foundation::{
    BridgeError, ErrorCode, MessageId, Namespace, SequenceRegistry, SessionId, SharedClock,
};
use crate::domain::message::{
    AckPayload, AckStatus, BridgeMessage, ErrorPayload, EventPayload, MessagePayload,
    StatePayload,
};
use crate::domain::state::{StateDelta, StateStore};
use crate::domain::subscription::{DeliveryKind, SubscriptionManager};
use crate::ports::RouteTarget;
use crate::telemetry;

use super::idempotency::{BeginOutcome, IdempotencyCache, SWEEP_INTERVAL_MS};
use super::pending::PendingCommands;

/// Router tunables.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub idempotency_enabled: bool,
    pub idempotency_ttl_ms: i64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            idempotency_enabled: true,
            idempotency_ttl_ms: super::idempotency::DEFAULT_IDEMPOTENCY_TTL_MS,
        }
    }
}

/// Work items processed in order by the dispatch worker.
enum FanoutJob {
    Delta(StateDelta),
    Snapshot {
        subscription_id: crate::domain::foundation::SubscriptionId,
    },
}

#[derive(Default)]
struct TargetTable {
    by_namespace: HashMap<Namespace, Arc<dyn RouteTarget>>,
    by_id: HashMap<SessionId, Arc<dyn RouteTarget>>,
}

/// Outcome of dispatching a command.
enum CommandOutcome {
    /// Handler invoked; terminal ack arrives on the receiver.
    Dispatched(oneshot::Receiver<AckPayload>),
    /// Idempotent replay of a finished command.
    Replayed(AckPayload),
    /// Duplicate of an in-flight command; suppressed.
    Suppressed,
    /// Routing failed; an error reply was already emitted.
    Rejected,
}

/// Central hub: target dispatch, idempotency, ack correlation, fan-out.
pub struct MessageRouter {
    store: Arc<StateStore>,
    subscriptions: Arc<SubscriptionManager>,
    sequences: Arc<SequenceRegistry>,
    clock: SharedClock,
    config: RouterConfig,
    targets: RwLock<TargetTable>,
    idempotency: IdempotencyCache,
    pending: PendingCommands,
    fanout_tx: mpsc::UnboundedSender<FanoutJob>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
    identity: Namespace,
}

impl MessageRouter {
    /// Builds the router, installs its store listener, and starts the
    /// dispatch worker and the idempotency sweeper.
    pub fn new(
        store: Arc<StateStore>,
        subscriptions: Arc<SubscriptionManager>,
        sequences: Arc<SequenceRegistry>,
        clock: SharedClock,
        config: RouterConfig,
    ) -> Arc<Self> {
        let (fanout_tx, fanout_rx) = mpsc::unbounded_channel();

        let router = Arc::new(Self {
            idempotency: IdempotencyCache::new(clock.clone(), config.idempotency_ttl_ms),
            pending: PendingCommands::new(),
            store: store.clone(),
            subscriptions,
            sequences,
            clock,
            config,
            targets: RwLock::new(TargetTable::default()),
            fanout_tx: fanout_tx.clone(),
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            identity: Namespace::hub_core(),
        });

        // The store listener only enqueues; the worker owns delivery.
        store.add_listener(Arc::new(move |delta: &StateDelta| {
            let _ = fanout_tx.send(FanoutJob::Delta(delta.clone()));
        }));

        let worker = tokio::spawn(Self::run_dispatch(Arc::downgrade(&router), fanout_rx));
        let sweeper = tokio::spawn(Self::run_sweeper(Arc::downgrade(&router)));
        router.tasks.lock().extend([worker, sweeper]);

        router
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn sequences(&self) -> &Arc<SequenceRegistry> {
        &self.sequences
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Registers a target. Fails if its namespace is already bound; a
    /// duplicate registration is a programmer error surfaced at once.
    pub fn register_target(&self, target: Arc<dyn RouteTarget>) -> Result<(), BridgeError> {
        let mut table = self.targets.write();
        if table.by_namespace.contains_key(target.namespace()) {
            return Err(BridgeError::new(
                ErrorCode::InternalError,
                format!("namespace '{}' already has a target", target.namespace()),
            ));
        }
        table
            .by_namespace
            .insert(target.namespace().clone(), target.clone());
        table.by_id.insert(target.id(), target);
        Ok(())
    }

    /// Removes a target, rejects its pending commands, and drops its
    /// subscriptions.
    pub async fn unregister_target(self: &Arc<Self>, namespace: &Namespace) {
        let removed = {
            let mut table = self.targets.write();
            let removed = table.by_namespace.remove(namespace);
            if let Some(target) = &removed {
                table.by_id.remove(&target.id());
            }
            removed
        };
        let Some(target) = removed else {
            return;
        };

        for pending in self.pending.take_for_target(namespace) {
            let ack = AckPayload {
                status: AckStatus::Failed,
                command_id: pending.message.id,
                result: None,
                error: Some(json!({
                    "code": ErrorCode::AdapterError.as_str(),
                    "message": "target unregistered",
                })),
            };
            self.finish_command(&pending.message, ack.clone()).await;
            pending.resolve(ack);
        }

        let dropped = self.subscriptions.unsubscribe_client(target.id());
        telemetry::SUBSCRIPTIONS.set(self.subscriptions.count() as f64);
        debug!(namespace = %namespace, dropped_subscriptions = dropped, "target unregistered");
    }

    /// Routes one validated message by its type tag.
    pub async fn route(self: &Arc<Self>, message: BridgeMessage) -> Result<(), BridgeError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BridgeError::new(ErrorCode::InternalError, "router shutdown"));
        }
        if let Err(violation) = message.validate() {
            let err = BridgeError::invalid_message(&violation);
            self.send_error(&message.source, &err, Some(message.id)).await;
            return Ok(());
        }

        telemetry::MESSAGES_ROUTED
            .with_label_values(&[message.kind().as_str()])
            .inc();

        match &message.payload {
            MessagePayload::Command(_) => {
                self.dispatch_command(message).await;
            }
            MessagePayload::Event(_) => self.route_event(message).await,
            MessagePayload::State(_) => self.route_state(message).await,
            MessagePayload::Ack(_) => self.route_ack(message).await,
            MessagePayload::Error(_) => self.route_error(message).await,
            MessagePayload::Subscribe(_) => self.route_subscribe(message).await,
            MessagePayload::Unsubscribe(_) => self.route_unsubscribe(message).await,
        }
        Ok(())
    }

    /// Routes a command and awaits its terminal ack.
    ///
    /// Convenience for in-process callers; `route()` is fire-and-forget.
    pub async fn send_command(
        self: &Arc<Self>,
        message: BridgeMessage,
    ) -> Result<AckPayload, BridgeError> {
        message.validate().map_err(|v| BridgeError::invalid_message(&v))?;
        match self.dispatch_command(message).await {
            CommandOutcome::Replayed(ack) => Ok(ack),
            CommandOutcome::Suppressed => Err(BridgeError::new(
                ErrorCode::AdapterError,
                "command already in flight",
            )),
            CommandOutcome::Rejected => Err(BridgeError::new(
                ErrorCode::UnknownTarget,
                "command was not dispatched",
            )),
            CommandOutcome::Dispatched(rx) => rx.await.map_err(|_| {
                BridgeError::new(ErrorCode::InternalError, "command resolver dropped")
            }),
        }
    }

    async fn dispatch_command(self: &Arc<Self>, message: BridgeMessage) -> CommandOutcome {
        // Validation guarantees both fields for commands.
        let key = message.idempotency_key.clone().unwrap_or_default();
        let target_ns = match message.target.clone() {
            Some(ns) => ns,
            None => return CommandOutcome::Rejected,
        };

        if self.config.idempotency_enabled {
            match self.idempotency.begin(&key) {
                BeginOutcome::Replay(ack) => {
                    telemetry::IDEMPOTENT_HITS.inc();
                    self.send_ack(&message.source, ack.clone()).await;
                    return CommandOutcome::Replayed(ack);
                }
                BeginOutcome::AlreadyInFlight => {
                    telemetry::IDEMPOTENT_HITS.inc();
                    return CommandOutcome::Suppressed;
                }
                BeginOutcome::Started => {}
            }
        }

        let Some(target) = self.find_target(&target_ns) else {
            if self.config.idempotency_enabled {
                self.idempotency.abandon(&key);
            }
            let err = BridgeError::new(
                ErrorCode::UnknownTarget,
                format!("no target registered for '{target_ns}'"),
            );
            self.send_error(&message.source, &err, Some(message.id)).await;
            return CommandOutcome::Rejected;
        };

        // The received ack precedes the terminal ack.
        self.send_ack(
            &message.source,
            AckPayload {
                status: AckStatus::Received,
                command_id: message.id,
                result: None,
                error: None,
            },
        )
        .await;

        let timeout = message.ttl.map(|ttl| {
            let weak = Arc::downgrade(self);
            let command_id = message.id;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ttl)).await;
                if let Some(router) = weak.upgrade() {
                    router.expire_command(command_id).await;
                }
            })
        });
        let rx = self.pending.register(message.clone(), self.clock.now(), timeout);

        if let Err(err) = target.handle(message.clone()).await {
            if self.config.idempotency_enabled {
                self.idempotency.abandon(&key);
            }
            if let Some(pending) = self.pending.take(&message.id) {
                pending.resolve(AckPayload {
                    status: AckStatus::Failed,
                    command_id: message.id,
                    result: None,
                    error: Some(json!({
                        "code": ErrorCode::AdapterError.as_str(),
                        "message": err.message,
                    })),
                });
            }
            let reply = BridgeError::new(ErrorCode::AdapterError, err.message.clone());
            self.send_error(&message.source, &reply, Some(message.id)).await;
            return CommandOutcome::Rejected;
        }

        CommandOutcome::Dispatched(rx)
    }

    async fn route_event(self: &Arc<Self>, message: BridgeMessage) {
        let Some(path) = message.path.clone() else {
            return;
        };
        let matches = self.subscriptions.matching(&path, DeliveryKind::Event);
        let mut seen: HashSet<SessionId> = HashSet::new();

        for m in matches {
            if !seen.insert(m.subscription.client_id) {
                continue;
            }
            let Some(target) = self.target_by_id(&m.subscription.client_id) else {
                continue;
            };
            // No self-delivery.
            if *target.namespace() == message.source {
                continue;
            }
            if let Err(err) = target.handle(message.clone()).await {
                warn!(
                    target = %target.namespace(),
                    path = %path,
                    error = %err,
                    "event delivery failed"
                );
            }
        }
    }

    async fn route_state(self: &Arc<Self>, message: BridgeMessage) {
        let Some(path) = message.path.clone() else {
            return;
        };
        let Some(payload) = message.as_state().cloned() else {
            return;
        };

        match self.store.set(&path, payload.value, &message.source) {
            Ok(_) => {
                telemetry::STATE_ENTRIES.set(self.store.len() as f64);
            }
            Err(err) => {
                self.send_error(&message.source, &err, Some(message.id)).await;
            }
        }
    }

    async fn route_ack(self: &Arc<Self>, message: BridgeMessage) {
        let Some(ack) = message.as_ack().cloned() else {
            return;
        };

        if ack.status.is_terminal() {
            if let Some(pending) = self.pending.take(&ack.command_id) {
                if self.config.idempotency_enabled {
                    if let Some(key) = &pending.message.idempotency_key {
                        self.idempotency.complete(key, ack.clone());
                    }
                }
                pending.resolve(ack.clone());
            }
        }

        // Forward once, to the original command source.
        if let Some(target_ns) = message.target.clone() {
            self.deliver(&target_ns, message).await;
        }
    }

    async fn route_error(self: &Arc<Self>, message: BridgeMessage) {
        if let Some(target_ns) = message.target.clone() {
            self.deliver(&target_ns, message).await;
        }
    }

    async fn route_subscribe(self: &Arc<Self>, message: BridgeMessage) {
        let MessagePayload::Subscribe(payload) = &message.payload else {
            return;
        };

        let Some(client) = self.find_target_exact(&message.source) else {
            let err = BridgeError::new(
                ErrorCode::SubscriptionFailed,
                format!("no registered client for '{}'", message.source),
            );
            self.send_error(&message.source, &err, Some(message.id)).await;
            return;
        };

        let snapshot = payload.snapshot.unwrap_or(true);
        let result = self.subscriptions.subscribe(
            client.id(),
            payload.patterns.clone(),
            payload.filter.unwrap_or_default(),
            snapshot,
        );

        match result {
            Ok(subscription_id) => {
                telemetry::SUBSCRIPTIONS.set(self.subscriptions.count() as f64);
                self.send_ack(
                    &message.source,
                    AckPayload {
                        status: AckStatus::Completed,
                        command_id: message.id,
                        result: Some(json!({ "subscriptionId": subscription_id })),
                        error: None,
                    },
                )
                .await;
                if snapshot {
                    let _ = self.fanout_tx.send(FanoutJob::Snapshot { subscription_id });
                }
            }
            Err(err) => {
                self.send_error(&message.source, &err, Some(message.id)).await;
            }
        }
    }

    async fn route_unsubscribe(self: &Arc<Self>, message: BridgeMessage) {
        let MessagePayload::Unsubscribe(payload) = &message.payload else {
            return;
        };

        let removed = self
            .find_target_exact(&message.source)
            .map(|client| {
                self.subscriptions
                    .unsubscribe_patterns(client.id(), &payload.patterns)
            })
            .unwrap_or(0);
        telemetry::SUBSCRIPTIONS.set(self.subscriptions.count() as f64);

        self.send_ack(
            &message.source,
            AckPayload {
                status: AckStatus::Completed,
                command_id: message.id,
                result: Some(json!({ "removedCount": removed })),
                error: None,
            },
        )
        .await;
    }

    /// Cancels sweeps and the dispatch worker, rejects all pending
    /// commands, and clears caches. Subscriptions survive; targets own
    /// their lifecycle.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for pending in self.pending.take_all() {
            pending.resolve(AckPayload {
                status: AckStatus::Failed,
                command_id: MessageId::from_uuid(uuid::Uuid::nil()),
                result: None,
                error: Some(json!({
                    "code": ErrorCode::InternalError.as_str(),
                    "message": "router shutdown",
                })),
            });
        }
        self.idempotency.clear();
    }

    // ─── Internals ───────────────────────────────────────────────────

    async fn run_dispatch(weak: Weak<Self>, mut rx: mpsc::UnboundedReceiver<FanoutJob>) {
        while let Some(job) = rx.recv().await {
            let Some(router) = weak.upgrade() else {
                break;
            };
            match job {
                FanoutJob::Delta(delta) => router.fan_out_delta(delta).await,
                FanoutJob::Snapshot { subscription_id } => {
                    router.stream_snapshot(subscription_id).await
                }
            }
        }
    }

    async fn run_sweeper(weak: Weak<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(SWEEP_INTERVAL_MS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(router) = weak.upgrade() else {
                break;
            };
            let swept = router.idempotency.sweep();
            if swept > 0 {
                debug!(swept, "idempotency records expired");
            }
        }
    }

    async fn fan_out_delta(self: &Arc<Self>, delta: StateDelta) {
        let matches = self.subscriptions.matching(&delta.path, DeliveryKind::State);
        let mut seen: HashSet<SessionId> = HashSet::new();

        for m in matches {
            // Snapshot-pending subscriptions see the entry in their
            // snapshot instead.
            if m.subscription.awaiting_snapshot() {
                continue;
            }
            if !seen.insert(m.subscription.client_id) {
                continue;
            }
            let Some(target) = self.target_by_id(&m.subscription.client_id) else {
                continue;
            };
            // The owner never hears its own write echoed back.
            if *target.namespace() == delta.entry.owner {
                continue;
            }
            let message = self.state_message_from(&delta.path, &delta.entry);
            if let Err(err) = target.handle(message).await {
                warn!(
                    target = %target.namespace(),
                    path = %delta.path,
                    error = %err,
                    "state delta delivery failed"
                );
            }
        }
    }

    async fn stream_snapshot(
        self: &Arc<Self>,
        subscription_id: crate::domain::foundation::SubscriptionId,
    ) {
        let Some(subscription) = self.subscriptions.get(subscription_id) else {
            return;
        };
        let Some(target) = self.target_by_id(&subscription.client_id) else {
            return;
        };

        for pattern in subscription.compiled() {
            for entry in self.store.snapshot_for_pattern(pattern) {
                let message = self.state_message_from(&entry.path, &entry);
                if let Err(err) = target.handle(message).await {
                    warn!(
                        subscription = %subscription_id,
                        error = %err,
                        "snapshot delivery failed"
                    );
                }
            }
        }

        let complete = self
            .outgoing(MessagePayload::Event(EventPayload {
                event: "snapshot_complete".to_string(),
                data: Some(json!({ "subscriptionId": subscription_id })),
            }))
            .with_path("hub.subscriptions")
            .with_target(target.namespace().clone());
        if let Err(err) = target.handle(complete).await {
            warn!(subscription = %subscription_id, error = %err, "snapshot_complete delivery failed");
        }

        self.subscriptions.mark_snapshot_sent(subscription_id);
    }

    async fn expire_command(self: &Arc<Self>, command_id: MessageId) {
        let Some(pending) = self.pending.take(&command_id) else {
            return;
        };
        let ack = AckPayload {
            status: AckStatus::Timeout,
            command_id,
            result: None,
            error: Some(json!({
                "code": ErrorCode::Timeout.as_str(),
                "message": "command timed out",
            })),
        };
        self.finish_command(&pending.message, ack.clone()).await;
        pending.resolve(ack);
    }

    /// Caches the terminal result and forwards the ack to the command's
    /// original source.
    async fn finish_command(self: &Arc<Self>, command: &BridgeMessage, ack: AckPayload) {
        if self.config.idempotency_enabled {
            if let Some(key) = &command.idempotency_key {
                self.idempotency.complete(key, ack.clone());
            }
        }
        self.send_ack(&command.source, ack).await;
    }

    fn state_message_from(&self, path: &str, entry: &crate::domain::state::StateEntry) -> BridgeMessage {
        self.outgoing(MessagePayload::State(StatePayload {
            value: entry.value.clone(),
            stale: Some(entry.stale),
            owner: Some(entry.owner.as_str().to_string()),
            version: Some(entry.version),
        }))
        .with_path(path)
    }

    /// Builds a hub-originated envelope with the router's own sequence.
    fn outgoing(&self, payload: MessagePayload) -> BridgeMessage {
        let sequence = self.sequences.next(&self.identity);
        BridgeMessage::new(self.identity.clone(), payload, self.clock.as_ref(), sequence)
    }

    async fn send_ack(self: &Arc<Self>, to: &Namespace, ack: AckPayload) {
        let message = self
            .outgoing(MessagePayload::Ack(ack))
            .with_target(to.clone());
        self.deliver(to, message).await;
    }

    async fn send_error(
        self: &Arc<Self>,
        to: &Namespace,
        err: &BridgeError,
        related: Option<MessageId>,
    ) {
        telemetry::ROUTER_ERRORS
            .with_label_values(&[err.code.as_str()])
            .inc();
        let message = self
            .outgoing(MessagePayload::Error(ErrorPayload {
                code: err.code.as_str().to_string(),
                message: err.message.clone(),
                details: (!err.details.is_empty()).then(|| json!(err.details)),
                related_message_id: related,
            }))
            .with_target(to.clone());
        self.deliver(to, message).await;
    }

    async fn deliver(self: &Arc<Self>, to: &Namespace, message: BridgeMessage) {
        let Some(target) = self.find_target(to) else {
            debug!(target = %to, kind = message.kind().as_str(), "no target for delivery");
            return;
        };
        if let Err(err) = target.handle(message).await {
            warn!(target = %to, error = %err, "delivery failed");
        }
    }

    /// Exact match, then successive dot-trimmed prefixes.
    fn find_target(&self, namespace: &Namespace) -> Option<Arc<dyn RouteTarget>> {
        let table = self.targets.read();
        if let Some(target) = table.by_namespace.get(namespace) {
            return Some(target.clone());
        }
        for prefix in namespace.prefixes() {
            if let Ok(ns) = Namespace::new(prefix) {
                if let Some(target) = table.by_namespace.get(&ns) {
                    return Some(target.clone());
                }
            }
        }
        None
    }

    fn find_target_exact(&self, namespace: &Namespace) -> Option<Arc<dyn RouteTarget>> {
        self.targets.read().by_namespace.get(namespace).cloned()
    }

    fn target_by_id(&self, id: &SessionId) -> Option<Arc<dyn RouteTarget>> {
        self.targets.read().by_id.get(id).cloned()
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::foundation::{SystemClock, SubscriptionId};
    use crate::domain::message::CommandPayload;
    use crate::domain::subscription::SubscriptionFilter;
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Target that records everything it receives.
    struct RecordingTarget {
        id: SessionId,
        namespace: Namespace,
        received: Mutex<Vec<BridgeMessage>>,
        fail: AtomicBool,
    }

    impl RecordingTarget {
        fn new(namespace: &str) -> Arc<Self> {
            Arc::new(Self {
                id: SessionId::new(),
                namespace: Namespace::new(namespace).unwrap(),
                received: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }

        fn messages(&self) -> Vec<BridgeMessage> {
            self.received.lock().clone()
        }

        fn kinds(&self) -> Vec<&'static str> {
            self.messages().iter().map(|m| m.kind().as_str()).collect()
        }
    }

    #[async_trait]
    impl RouteTarget for RecordingTarget {
        fn id(&self) -> SessionId {
            self.id
        }

        fn namespace(&self) -> &Namespace {
            &self.namespace
        }

        async fn handle(&self, message: BridgeMessage) -> Result<(), BridgeError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(BridgeError::new(ErrorCode::AdapterError, "handler exploded"));
            }
            self.received.lock().push(message);
            Ok(())
        }
    }

    fn router() -> Arc<MessageRouter> {
        let clock = SystemClock::shared();
        MessageRouter::new(
            Arc::new(StateStore::new(clock.clone())),
            Arc::new(SubscriptionManager::new(clock.clone())),
            Arc::new(SequenceRegistry::new()),
            clock,
            RouterConfig::default(),
        )
    }

    fn ns(s: &str) -> Namespace {
        Namespace::new(s).unwrap()
    }

    fn command_from(source: &str, target: &str, key: &str) -> BridgeMessage {
        BridgeMessage::new(
            ns(source),
            MessagePayload::Command(CommandPayload {
                action: "press".to_string(),
                params: Some(json!({"keyIndex": 5})),
            }),
            &SystemClock,
            0,
        )
        .with_target(ns(target))
        .with_idempotency_key(key)
    }

    fn state_from(source: &str, path: &str, value: serde_json::Value) -> BridgeMessage {
        BridgeMessage::new(
            ns(source),
            MessagePayload::State(StatePayload {
                value,
                stale: None,
                owner: None,
                version: None,
            }),
            &SystemClock,
            0,
        )
        .with_path(path)
    }

    async fn settle() {
        // Let the dispatch worker drain its queue.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn command_resolves_target_by_prefix() {
        let router = router();
        let companion = RecordingTarget::new("companion");
        let client = RecordingTarget::new("app.panel");
        router.register_target(companion.clone()).unwrap();
        router.register_target(client.clone()).unwrap();

        router
            .route(command_from("app.panel", "companion.satellite", "k1"))
            .await
            .unwrap();

        let received = companion.messages();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind().as_str(), "command");
        // The source got its received ack.
        assert_eq!(client.kinds(), vec!["ack"]);
        assert_eq!(
            client.messages()[0].as_ack().unwrap().status,
            AckStatus::Received
        );
    }

    #[tokio::test]
    async fn unknown_target_yields_error_to_source() {
        let router = router();
        let client = RecordingTarget::new("app.panel");
        router.register_target(client.clone()).unwrap();

        router
            .route(command_from("app.panel", "nowhere", "k1"))
            .await
            .unwrap();

        let received = client.messages();
        assert_eq!(received.len(), 1);
        match &received[0].payload {
            MessagePayload::Error(e) => assert_eq!(e.code, "UNKNOWN_TARGET"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_failure_becomes_adapter_error() {
        let router = router();
        let companion = RecordingTarget::new("companion");
        companion.fail.store(true, Ordering::SeqCst);
        let client = RecordingTarget::new("app.panel");
        router.register_target(companion.clone()).unwrap();
        router.register_target(client.clone()).unwrap();

        router
            .route(command_from("app.panel", "companion", "k1"))
            .await
            .unwrap();

        let kinds = client.kinds();
        assert_eq!(kinds, vec!["ack", "error"]);
        match &client.messages()[1].payload {
            MessagePayload::Error(e) => assert_eq!(e.code, "ADAPTER_ERROR"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_command_is_collapsed_and_replayed() {
        let router = router();
        let companion = RecordingTarget::new("companion");
        let client = RecordingTarget::new("app.panel");
        router.register_target(companion.clone()).unwrap();
        router.register_target(client.clone()).unwrap();

        let first = command_from("app.panel", "companion", "K1");
        let command_id = first.id;
        router.route(first).await.unwrap();
        assert_eq!(companion.messages().len(), 1);

        // In-flight duplicate is suppressed outright.
        router
            .route(command_from("app.panel", "companion", "K1"))
            .await
            .unwrap();
        assert_eq!(companion.messages().len(), 1);

        // Terminal ack arrives from the adapter.
        let ack = BridgeMessage::new(
            ns("companion"),
            MessagePayload::Ack(AckPayload {
                status: AckStatus::Completed,
                command_id,
                result: Some(json!({"ok": true})),
                error: None,
            }),
            &SystemClock,
            0,
        )
        .with_target(ns("app.panel"));
        router.route(ack).await.unwrap();

        // Retry now replays the cached completed ack; no new dispatch.
        router
            .route(command_from("app.panel", "companion", "K1"))
            .await
            .unwrap();
        assert_eq!(companion.messages().len(), 1);

        let completed: Vec<_> = client
            .messages()
            .iter()
            .filter_map(|m| m.as_ack().cloned())
            .filter(|a| a.status == AckStatus::Completed)
            .collect();
        // One from the adapter's ack, one replayed for the retry.
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].command_id, command_id);
        assert_eq!(completed[0].result, completed[1].result);
    }

    #[tokio::test]
    async fn terminal_ack_resolves_send_command_waiter() {
        let router = router();
        let companion = RecordingTarget::new("companion");
        let client = RecordingTarget::new("app.panel");
        router.register_target(companion.clone()).unwrap();
        router.register_target(client.clone()).unwrap();

        let command = command_from("app.panel", "companion", "kw");
        let command_id = command.id;

        let waiter = {
            let router = router.clone();
            tokio::spawn(async move { router.send_command(command).await })
        };
        settle().await;

        let ack = BridgeMessage::new(
            ns("companion"),
            MessagePayload::Ack(AckPayload {
                status: AckStatus::Completed,
                command_id,
                result: None,
                error: None,
            }),
            &SystemClock,
            1,
        )
        .with_target(ns("app.panel"));
        router.route(ack).await.unwrap();

        let resolved = waiter.await.unwrap().unwrap();
        assert_eq!(resolved.status, AckStatus::Completed);
        assert_eq!(resolved.command_id, command_id);
    }

    #[tokio::test]
    async fn ttl_expiry_emits_timeout_ack() {
        let router = router();
        let companion = RecordingTarget::new("companion");
        let client = RecordingTarget::new("app.panel");
        router.register_target(companion.clone()).unwrap();
        router.register_target(client.clone()).unwrap();

        let command = command_from("app.panel", "companion", "kt").with_ttl(30);
        router.route(command).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        let timeouts: Vec<_> = client
            .messages()
            .iter()
            .filter_map(|m| m.as_ack().cloned())
            .filter(|a| a.status == AckStatus::Timeout)
            .collect();
        assert_eq!(timeouts.len(), 1);
        assert!(router.pending.is_empty());
    }

    #[tokio::test]
    async fn state_conflict_error_returns_to_writer() {
        let router = router();
        let a = RecordingTarget::new("app.a");
        let b = RecordingTarget::new("app.b");
        router.register_target(a.clone()).unwrap();
        router.register_target(b.clone()).unwrap();

        router.route(state_from("app.a", "x.y", json!(1))).await.unwrap();
        router.route(state_from("app.b", "x.y", json!(2))).await.unwrap();

        let received = b.messages();
        assert_eq!(received.len(), 1);
        match &received[0].payload {
            MessagePayload::Error(e) => assert_eq!(e.code, "STATE_CONFLICT"),
            other => panic!("expected error, got {other:?}"),
        }

        let entry = router.store().get("x.y").unwrap();
        assert_eq!(entry.value, json!(1));
        assert_eq!(entry.owner, ns("app.a"));
        assert_eq!(entry.version, 1);
    }

    #[tokio::test]
    async fn event_fan_out_skips_the_emitting_namespace() {
        let router = router();
        let emitter = RecordingTarget::new("app.emitter");
        let listener = RecordingTarget::new("app.listener");
        router.register_target(emitter.clone()).unwrap();
        router.register_target(listener.clone()).unwrap();

        router
            .subscriptions()
            .subscribe(
                emitter.id(),
                vec!["news.**".to_string()],
                SubscriptionFilter::All,
                false,
            )
            .unwrap();
        router
            .subscriptions()
            .subscribe(
                listener.id(),
                vec!["news.**".to_string()],
                SubscriptionFilter::All,
                false,
            )
            .unwrap();

        let event = BridgeMessage::new(
            ns("app.emitter"),
            MessagePayload::Event(EventPayload {
                event: "published".to_string(),
                data: None,
            }),
            &SystemClock,
            0,
        )
        .with_path("news.flash");
        router.route(event).await.unwrap();

        assert_eq!(listener.messages().len(), 1);
        assert!(emitter.messages().is_empty());
    }

    #[tokio::test]
    async fn delta_fan_out_suppresses_owner_self_delivery() {
        let router = router();
        let owner = RecordingTarget::new("app.x");
        let other = RecordingTarget::new("app.y");
        router.register_target(owner.clone()).unwrap();
        router.register_target(other.clone()).unwrap();

        for target in [&owner, &other] {
            router
                .subscriptions()
                .subscribe(
                    target.id(),
                    vec!["app.x.**".to_string()],
                    SubscriptionFilter::State,
                    false,
                )
                .unwrap();
        }

        router
            .route(state_from("app.x", "app.x.foo", json!(1)))
            .await
            .unwrap();
        settle().await;

        assert!(owner.messages().is_empty());
        let received = other.messages();
        assert_eq!(received.len(), 1);
        let state = received[0].as_state().unwrap();
        assert_eq!(state.value, json!(1));
        assert_eq!(state.owner.as_deref(), Some("app.x"));
    }

    #[tokio::test]
    async fn subscribe_streams_snapshot_then_completion_then_deltas() {
        let router = router();
        let publisher = RecordingTarget::new("companion.satellite");
        let client = RecordingTarget::new("app.panel");
        router.register_target(publisher.clone()).unwrap();
        router.register_target(client.clone()).unwrap();

        router
            .route(state_from(
                "companion.satellite",
                "companion.variables.tally",
                json!("cam1"),
            ))
            .await
            .unwrap();
        settle().await;

        let subscribe = BridgeMessage::new(
            ns("app.panel"),
            MessagePayload::Subscribe(crate::domain::message::SubscribePayload {
                patterns: vec!["companion.variables.**".to_string()],
                filter: None,
                snapshot: Some(true),
            }),
            &SystemClock,
            0,
        );
        router.route(subscribe).await.unwrap();
        settle().await;

        // Live delta after the snapshot.
        router
            .route(state_from(
                "companion.satellite",
                "companion.variables.tally",
                json!("cam2"),
            ))
            .await
            .unwrap();
        settle().await;

        let kinds = client.kinds();
        assert_eq!(kinds, vec!["ack", "state", "event", "state"]);

        let messages = client.messages();
        let snapshot_state = messages[1].as_state().unwrap();
        assert_eq!(snapshot_state.value, json!("cam1"));
        assert_eq!(snapshot_state.version, Some(1));

        let complete = messages[2].as_event().unwrap();
        assert_eq!(complete.event, "snapshot_complete");
        assert_eq!(messages[2].path.as_deref(), Some("hub.subscriptions"));

        let live = messages[3].as_state().unwrap();
        assert_eq!(live.value, json!("cam2"));
        assert_eq!(live.version, Some(2));
    }

    #[tokio::test]
    async fn unsubscribe_acks_removed_count() {
        let router = router();
        let client = RecordingTarget::new("app.panel");
        router.register_target(client.clone()).unwrap();

        let subscribe = BridgeMessage::new(
            ns("app.panel"),
            MessagePayload::Subscribe(crate::domain::message::SubscribePayload {
                patterns: vec!["a.**".to_string()],
                filter: None,
                snapshot: Some(false),
            }),
            &SystemClock,
            0,
        );
        router.route(subscribe).await.unwrap();

        let unsubscribe = BridgeMessage::new(
            ns("app.panel"),
            MessagePayload::Unsubscribe(crate::domain::message::UnsubscribePayload {
                patterns: vec!["a.**".to_string()],
            }),
            &SystemClock,
            1,
        );
        router.route(unsubscribe).await.unwrap();

        let acks: Vec<_> = client
            .messages()
            .iter()
            .filter_map(|m| m.as_ack().cloned())
            .collect();
        assert_eq!(acks.len(), 2);
        assert_eq!(
            acks[1].result.as_ref().unwrap()["removedCount"],
            json!(1)
        );
        assert_eq!(router.subscriptions().count(), 0);
    }

    #[tokio::test]
    async fn duplicate_namespace_registration_fails() {
        let router = router();
        router
            .register_target(RecordingTarget::new("companion"))
            .unwrap();
        let err = router
            .register_target(RecordingTarget::new("companion"))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError);
    }

    #[tokio::test]
    async fn unregister_rejects_pending_and_drops_subscriptions() {
        let router = router();
        let companion = RecordingTarget::new("companion");
        let client = RecordingTarget::new("app.panel");
        router.register_target(companion.clone()).unwrap();
        router.register_target(client.clone()).unwrap();

        router
            .subscriptions()
            .subscribe(
                companion.id(),
                vec!["app.**".to_string()],
                SubscriptionFilter::All,
                false,
            )
            .unwrap();

        router
            .route(command_from("app.panel", "companion", "ku"))
            .await
            .unwrap();
        assert_eq!(router.pending.len(), 1);

        router.unregister_target(&ns("companion")).await;

        assert!(router.pending.is_empty());
        assert_eq!(router.subscriptions().count(), 0);

        let failed: Vec<_> = client
            .messages()
            .iter()
            .filter_map(|m| m.as_ack().cloned())
            .filter(|a| a.status == AckStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(
            failed[0].error.as_ref().unwrap()["message"],
            json!("target unregistered")
        );
    }

    #[tokio::test]
    async fn invalid_message_is_bounced_with_error() {
        let router = router();
        let client = RecordingTarget::new("app.panel");
        router.register_target(client.clone()).unwrap();

        // 101 patterns exceeds the bound.
        let subscribe = BridgeMessage::new(
            ns("app.panel"),
            MessagePayload::Subscribe(crate::domain::message::SubscribePayload {
                patterns: (0..101).map(|i| format!("p{i}.**")).collect(),
                filter: None,
                snapshot: None,
            }),
            &SystemClock,
            0,
        );
        router.route(subscribe).await.unwrap();

        let received = client.messages();
        assert_eq!(received.len(), 1);
        match &received[0].payload {
            MessagePayload::Error(e) => assert_eq!(e.code, "INVALID_MESSAGE"),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(router.subscriptions().count(), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_waiters_and_refuses_new_work() {
        let router = router();
        let companion = RecordingTarget::new("companion");
        let client = RecordingTarget::new("app.panel");
        router.register_target(companion.clone()).unwrap();
        router.register_target(client.clone()).unwrap();

        let command = command_from("app.panel", "companion", "ks");
        let waiter = {
            let router = router.clone();
            tokio::spawn(async move { router.send_command(command).await })
        };
        settle().await;

        router.shutdown().await;

        let resolved = waiter.await.unwrap().unwrap();
        assert_eq!(resolved.status, AckStatus::Failed);

        let err = router
            .route(command_from("app.panel", "companion", "ks2"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError);
    }

    #[tokio::test]
    async fn snapshot_for_missing_subscription_is_ignored() {
        let router = router();
        let _ = router.fanout_tx.send(FanoutJob::Snapshot {
            subscription_id: SubscriptionId::new(),
        });
        settle().await;
    }
}
