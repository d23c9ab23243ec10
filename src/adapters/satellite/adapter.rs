//! Bridge↔wire translation for the Companion Satellite upstream.
//!
//! The adapter registers as the router target for `companion`, translates
//! routed commands into wire frames, and publishes everything the
//! upstream reports into the state store under the
//! `companion.satellite` owner namespace.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::MessageRouter;
use crate::config::CompanionConfig;
use crate::domain::foundation::{BridgeError, ErrorCode, Namespace, SessionId};
use crate::domain::message::{AckPayload, AckStatus, BridgeMessage, MessagePayload, StatePayload};
use crate::ports::{HealthChecker, HealthState, RouteTarget};
use crate::telemetry;

use super::connection::{self, ConnectionEvent, ConnectionState};
use super::protocol::{safe_variable_name, Capabilities, InboundFrame, KeyState, OutboundFrame};

/// The namespace commands are addressed to.
pub const TARGET_NAMESPACE: &str = "companion";

/// The owner namespace of every state path the adapter publishes.
pub const OWNER_NAMESPACE: &str = "companion.satellite";

/// Keys per page for `{page, bank}` addressing.
const KEYS_PER_PAGE: u64 = 8;

/// Upstream adapter: connection lifecycle, command translation, state
/// publishing, and local caches.
pub struct SatelliteAdapter {
    id: SessionId,
    namespace: Namespace,
    owner: Namespace,
    config: CompanionConfig,
    router: Arc<MessageRouter>,
    capabilities: Mutex<Capabilities>,
    connection_state: Mutex<ConnectionState>,
    latency: Mutex<Option<Duration>>,
    variables: Mutex<HashMap<String, String>>,
    keys: Mutex<HashMap<String, KeyState>>,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SatelliteAdapter {
    pub fn new(config: CompanionConfig, router: Arc<MessageRouter>) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            id: SessionId::new(),
            namespace: Namespace::new(TARGET_NAMESPACE).expect("static namespace"),
            owner: Namespace::new(OWNER_NAMESPACE).expect("static namespace"),
            config,
            router,
            capabilities: Mutex::new(Capabilities::default()),
            connection_state: Mutex::new(ConnectionState::Disconnected),
            latency: Mutex::new(None),
            variables: Mutex::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the connection task and the event pump.
    pub fn start(self: &Arc<Self>) {
        let Some(outbound_rx) = self.outbound_rx.lock().take() else {
            warn!("satellite adapter already started");
            return;
        };
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let connection = connection::spawn(
            self.config.clone(),
            event_tx,
            outbound_rx,
            self.shutdown_tx.subscribe(),
        );
        let pump = tokio::spawn(Self::run_events(self.clone(), event_rx));
        self.tasks.lock().extend([connection, pump]);
    }

    /// Disconnects, stops both tasks, and flags owned state stale.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        // Give the connection a moment to send its close frame.
        tokio::time::sleep(Duration::from_millis(50)).await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.connection_state.lock() = ConnectionState::Disconnected;
        self.router.store().mark_owner_stale(&self.owner);
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.lock()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.lock().clone()
    }

    pub fn heartbeat_latency(&self) -> Option<Duration> {
        *self.latency.lock()
    }

    async fn run_events(adapter: Arc<Self>, mut event_rx: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = event_rx.recv().await {
            adapter.handle_event(event).await;
        }
    }

    async fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(state) => {
                *self.connection_state.lock() = state;
                telemetry::set_upstream_state(state.as_str());
                self.publish_state("companion.connection.state", json!(state.as_str()))
                    .await;
            }
            ConnectionEvent::Connected => {
                self.publish_state(
                    "companion.connection.lastConnected",
                    json!(self.router.clock().now_millis()),
                )
                .await;
                let capabilities = self.capabilities.lock().clone();
                self.publish_state(
                    "companion.capabilities",
                    serde_json::to_value(capabilities).unwrap_or(Value::Null),
                )
                .await;
            }
            ConnectionEvent::Disconnected { reason } => {
                self.publish_state("companion.connection.lastError", json!(reason))
                    .await;
                let flagged = self.router.store().mark_owner_stale(&self.owner);
                debug!(flagged, "flagged owned state stale after disconnect");
            }
            ConnectionEvent::Frame(frame) => self.handle_frame(frame).await,
            ConnectionEvent::Latency(rtt) => {
                telemetry::UPSTREAM_LATENCY.observe(rtt.as_secs_f64());
                *self.latency.lock() = Some(rtt);
            }
            ConnectionEvent::GaveUp => {
                warn!("upstream reconnection abandoned");
            }
        }
    }

    async fn handle_frame(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::AddDevice {
                device_id,
                capabilities,
            } => {
                let detected = {
                    let mut caps = self.capabilities.lock();
                    *caps = Capabilities::default();
                    for token in &capabilities {
                        caps.apply_token(token);
                    }
                    caps.clone()
                };
                info!(device = %device_id, ?detected, "upstream device announced");
                self.publish_state(
                    "companion.capabilities",
                    serde_json::to_value(detected).unwrap_or(Value::Null),
                )
                .await;
            }
            InboundFrame::KeyState {
                device_id,
                key_index,
                state,
            } => {
                self.keys
                    .lock()
                    .insert(format!("{device_id}:{key_index}"), state.clone());
                self.publish_state(
                    &format!("companion.device.{device_id}.key.{key_index}"),
                    serde_json::to_value(state).unwrap_or(Value::Null),
                )
                .await;
            }
            InboundFrame::VariablesUpdate { variables } => {
                for (name, value) in variables {
                    self.variables.lock().insert(name.clone(), value.clone());
                    let path = format!("companion.variables.{}", safe_variable_name(&name));
                    self.publish_state(&path, json!(value)).await;
                }
            }
            InboundFrame::Brightness { device_id, level } => {
                self.publish_state(
                    &format!("companion.device.{device_id}.brightness"),
                    json!(level),
                )
                .await;
            }
            InboundFrame::Error { message } => {
                warn!(message = %message, "upstream reported an error");
                self.publish_state("companion.connection.lastError", json!(message))
                    .await;
            }
            InboundFrame::Pong => {}
        }
    }

    /// Writes one owned path through the router.
    async fn publish_state(&self, path: &str, value: Value) {
        let sequence = self.router.sequences().next(&self.owner);
        let message = BridgeMessage::new(
            self.owner.clone(),
            MessagePayload::State(StatePayload {
                value,
                stale: None,
                owner: None,
                version: None,
            }),
            self.router.clock().as_ref(),
            sequence,
        )
        .with_path(path);

        if let Err(err) = self.router.route(message).await {
            warn!(path, error = %err, "state publish failed");
        }
    }

    async fn handle_command(&self, message: &BridgeMessage) {
        let Some(command) = message.as_command() else {
            return;
        };
        let params = command.params.clone().unwrap_or_else(|| json!({}));

        match command.action.as_str() {
            "press" => self.key_action(message, &params, true).await,
            "release" => self.key_action(message, &params, false).await,
            "rotate" => self.rotate(message, &params).await,
            "setVariable" => self.set_variable(message, &params).await,
            "getVariable" => self.get_variable(message, &params).await,
            "clearKeys" => self.clear_keys(message).await,
            other => {
                self.ack_failed(
                    message,
                    ErrorCode::AdapterError,
                    format!("unknown action '{other}'"),
                )
                .await;
            }
        }
    }

    async fn key_action(&self, message: &BridgeMessage, params: &Value, pressed: bool) {
        let Some(key_index) = resolve_key_index(params) else {
            self.ack_failed(
                message,
                ErrorCode::InvalidMessage,
                "missing keyIndex or page/bank",
            )
            .await;
            return;
        };
        let frame = OutboundFrame::KeyPress {
            device_id: self.config.device.device_id.clone(),
            key_index,
            pressed,
        };
        self.send_and_ack(message, frame).await;
    }

    async fn rotate(&self, message: &BridgeMessage, params: &Value) {
        if !self.capabilities.lock().rotation {
            self.ack_failed(
                message,
                ErrorCode::AdapterError,
                "upstream lacks ROTATION capability",
            )
            .await;
            return;
        }
        let key_index = resolve_key_index(params);
        let direction = params.get("direction").and_then(Value::as_str);
        let (Some(key_index), Some(direction)) = (key_index, direction) else {
            self.ack_failed(
                message,
                ErrorCode::InvalidMessage,
                "rotate requires keyIndex and direction",
            )
            .await;
            return;
        };
        let direction = match direction {
            "left" => -1,
            "right" => 1,
            _ => {
                self.ack_failed(
                    message,
                    ErrorCode::InvalidMessage,
                    "direction must be 'left' or 'right'",
                )
                .await;
                return;
            }
        };
        let frame = OutboundFrame::KeyRotate {
            device_id: self.config.device.device_id.clone(),
            key_index,
            direction,
        };
        self.send_and_ack(message, frame).await;
    }

    async fn set_variable(&self, message: &BridgeMessage, params: &Value) {
        if !self.capabilities.lock().variable_write {
            self.ack_failed(
                message,
                ErrorCode::AdapterError,
                "upstream lacks VARIABLE_WRITE capability",
            )
            .await;
            return;
        }
        let name = params.get("name").and_then(Value::as_str);
        let value = params.get("value");
        let (Some(name), Some(value)) = (name, value) else {
            self.ack_failed(
                message,
                ErrorCode::InvalidMessage,
                "setVariable requires name and value",
            )
            .await;
            return;
        };
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let frame = OutboundFrame::VariableValue {
            name: name.to_string(),
            value,
        };
        self.send_and_ack(message, frame).await;
    }

    /// Answered from the local cache; no wire round trip.
    async fn get_variable(&self, message: &BridgeMessage, params: &Value) {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            self.ack_failed(message, ErrorCode::InvalidMessage, "getVariable requires name")
                .await;
            return;
        };
        let value = self
            .variables
            .lock()
            .get(name)
            .map(|v| json!(v))
            .unwrap_or(Value::Null);
        self.ack(
            message,
            AckStatus::Completed,
            Some(json!({ "name": name, "value": value })),
            None,
        )
        .await;
    }

    async fn clear_keys(&self, message: &BridgeMessage) {
        self.keys.lock().clear();
        let frame = OutboundFrame::KeysClear {
            device_id: self.config.device.device_id.clone(),
        };
        self.send_and_ack(message, frame).await;
    }

    /// Fire-and-forget wire send; the completed ack reflects local
    /// acceptance, not remote application.
    async fn send_and_ack(&self, message: &BridgeMessage, frame: OutboundFrame) {
        match self.send_frame(frame) {
            Ok(()) => {
                self.ack(message, AckStatus::Completed, None, None).await;
            }
            Err(err) => {
                self.ack_failed(message, ErrorCode::AdapterError, err.message).await;
            }
        }
    }

    fn send_frame(&self, frame: OutboundFrame) -> Result<(), BridgeError> {
        if *self.connection_state.lock() != ConnectionState::Connected {
            return Err(BridgeError::new(
                ErrorCode::AdapterError,
                "upstream is not connected",
            ));
        }
        self.outbound_tx.send(frame.encode()).map_err(|_| {
            BridgeError::new(ErrorCode::AdapterError, "upstream connection task gone")
        })
    }

    async fn ack_failed(
        &self,
        message: &BridgeMessage,
        code: ErrorCode,
        reason: impl Into<String> + Send,
    ) {
        self.ack(
            message,
            AckStatus::Failed,
            None,
            Some(json!({ "code": code.as_str(), "message": reason.into() })),
        )
        .await;
    }

    async fn ack(
        &self,
        message: &BridgeMessage,
        status: AckStatus,
        result: Option<Value>,
        error: Option<Value>,
    ) {
        let sequence = self.router.sequences().next(&self.namespace);
        let ack = BridgeMessage::new(
            self.namespace.clone(),
            MessagePayload::Ack(AckPayload {
                status,
                command_id: message.id,
                result,
                error,
            }),
            self.router.clock().as_ref(),
            sequence,
        )
        .with_target(message.source.clone());

        if let Err(err) = self.router.route(ack).await {
            warn!(error = %err, "ack routing failed");
        }
    }

    #[cfg(test)]
    pub(crate) fn take_outbound_rx(&self) -> mpsc::UnboundedReceiver<String> {
        self.outbound_rx
            .lock()
            .take()
            .expect("outbound receiver already taken")
    }

    #[cfg(test)]
    pub(crate) fn force_connection_state(&self, state: ConnectionState) {
        *self.connection_state.lock() = state;
    }

    #[cfg(test)]
    pub(crate) fn force_capabilities(&self, capabilities: Capabilities) {
        *self.capabilities.lock() = capabilities;
    }

    #[cfg(test)]
    pub(crate) async fn feed_frame(&self, frame: InboundFrame) {
        self.handle_frame(frame).await;
    }
}

fn resolve_key_index(params: &Value) -> Option<u32> {
    if let Some(index) = params.get("keyIndex").and_then(Value::as_u64) {
        return u32::try_from(index).ok();
    }
    let page = params.get("page").and_then(Value::as_u64)?;
    let bank = params.get("bank").and_then(Value::as_u64)?;
    if page == 0 {
        return None;
    }
    u32::try_from((page - 1) * KEYS_PER_PAGE + bank).ok()
}

#[async_trait]
impl RouteTarget for SatelliteAdapter {
    fn id(&self) -> SessionId {
        self.id
    }

    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn handle(&self, message: BridgeMessage) -> Result<(), BridgeError> {
        match &message.payload {
            MessagePayload::Command(_) => {
                self.handle_command(&message).await;
                Ok(())
            }
            other => {
                debug!(kind = message.kind().as_str(), "satellite adapter ignoring {other:?}");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl HealthChecker for SatelliteAdapter {
    fn name(&self) -> &'static str {
        "companion_upstream"
    }

    async fn check(&self) -> HealthState {
        match self.connection_state() {
            ConnectionState::Connected => HealthState::Healthy,
            ConnectionState::Connecting | ConnectionState::Reconnecting => HealthState::Degraded,
            ConnectionState::Disconnected | ConnectionState::Error => HealthState::Unhealthy,
        }
    }
}
