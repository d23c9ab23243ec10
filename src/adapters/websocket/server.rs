//! Downstream WebSocket server for application clients.
//!
//! Handshake-first protocol: the first frame must be a handshake, after
//! which the socket carries bridge envelopes and JSON heartbeats. Each
//! accepted client registers as a router target under `app.<name>`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::application::MessageRouter;
use crate::config::ServerConfig;
use crate::domain::foundation::{
    client_namespace, BridgeError, ErrorCode, MessageId, Namespace, SessionId,
};
use crate::domain::message::{decode, encode, BridgeMessage, ErrorPayload, MessagePayload};
use crate::ports::RouteTarget;
use crate::telemetry;

use super::messages::{
    classify, HandshakeRequest, HandshakeResponse, InboundKind, PingFrame, CLOSE_AUTH_FAILED,
    CLOSE_HANDSHAKE_TIMEOUT, CLOSE_IDLE_TIMEOUT, CLOSE_INVALID_HANDSHAKE, CLOSE_MAX_CLIENTS,
    CLOSE_NOT_HANDSHAKE, CLOSE_SERVER_DISCONNECT, CLOSE_SERVER_SHUTDOWN,
};
use super::rate_limit::{FixedWindowLimiter, RateLimitResult};
use super::session::ClientSession;

/// How long a fresh socket may sit silent before its handshake.
const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// WebSocket server accepting application clients.
pub struct ClientServer {
    config: ServerConfig,
    router: Arc<MessageRouter>,
    limiter: FixedWindowLimiter,
    sessions: Mutex<HashMap<SessionId, mpsc::UnboundedSender<Message>>>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientServer {
    pub fn new(config: ServerConfig, router: Arc<MessageRouter>) -> Arc<Self> {
        let limiter = FixedWindowLimiter::new(
            config.rate_limit,
            config.rate_limit_window,
            router.clock().clone(),
        );
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            router,
            limiter,
            sessions: Mutex::new(HashMap::new()),
            shutdown_tx,
            accept_task: Mutex::new(None),
        })
    }

    /// Binds the listener and starts accepting. Returns the bound
    /// address (useful when the configured port is 0).
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, BridgeError> {
        let addr = self.config.socket_addr().map_err(|e| {
            BridgeError::new(ErrorCode::InternalError, format!("bad listen address: {e}"))
        })?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            BridgeError::new(ErrorCode::InternalError, format!("bind failed: {e}"))
        })?;
        let local = listener.local_addr().map_err(|e| {
            BridgeError::new(ErrorCode::InternalError, format!("local_addr failed: {e}"))
        })?;
        info!(addr = %local, "client transport listening");

        let server = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let server = server.clone();
                                tokio::spawn(async move {
                                    handle_connection(server, stream, peer).await;
                                });
                            }
                            Err(err) => warn!(error = %err, "accept failed"),
                        }
                    }
                }
            }
        });
        *self.accept_task.lock() = Some(task);
        Ok(local)
    }

    /// Stops accepting and closes every session with 1001.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let sessions: Vec<_> = self.sessions.lock().values().cloned().collect();
        for tx in sessions {
            let _ = tx.send(close_frame(CLOSE_SERVER_SHUTDOWN, "server shutdown"));
        }
        // Let writer tasks flush the close frames.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    pub fn client_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}

async fn handle_connection(server: Arc<ClientServer>, stream: TcpStream, peer: SocketAddr) {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(server.config.max_message_size);
    ws_config.max_frame_size = Some(server.config.max_message_size);
    let ws = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(err) => {
            debug!(peer = %peer, error = %err, "websocket handshake failed");
            return;
        }
    };
    debug!(peer = %peer, "client connected");

    let (mut sink, mut reader) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Writer task: everything outbound flows through one channel.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let is_close = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() {
                break;
            }
            if is_close {
                let _ = sink.flush().await;
                break;
            }
        }
    });

    if server.client_count() >= server.config.max_clients {
        let _ = tx.send(close_frame(CLOSE_MAX_CLIENTS, "maximum clients reached"));
        drop(tx);
        let _ = writer.await;
        return;
    }

    // First frame must be the handshake.
    let handshake = match await_handshake(&mut reader, &tx).await {
        Some(handshake) => handshake,
        None => {
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    if server.config.require_auth {
        let authorized = handshake
            .auth_token
            .as_deref()
            .map(|token| server.config.auth_tokens.iter().any(|t| t == token))
            .unwrap_or(false);
        if !authorized {
            let response = HandshakeResponse::failure("authentication failed");
            let _ = tx.send(Message::Text(
                serde_json::to_string(&response).unwrap_or_default(),
            ));
            let _ = tx.send(close_frame(CLOSE_AUTH_FAILED, "authentication failed"));
            drop(tx);
            let _ = writer.await;
            return;
        }
    }

    // Register under app.<name>, suffixing on namespace collision.
    let Some(session) = register_session(&server, &handshake, &tx) else {
        let response = HandshakeResponse::failure("namespace unavailable");
        let _ = tx.send(Message::Text(
            serde_json::to_string(&response).unwrap_or_default(),
        ));
        let _ = tx.send(close_frame(CLOSE_SERVER_DISCONNECT, "namespace unavailable"));
        drop(tx);
        let _ = writer.await;
        return;
    };
    let namespace = session.namespace().clone();
    let session_id = session.id();

    server.sessions.lock().insert(session_id, tx.clone());
    telemetry::CLIENTS_CONNECTED.set(server.client_count() as f64);

    let response = HandshakeResponse::success(session_id.to_string(), namespace.to_string());
    let _ = tx.send(Message::Text(
        serde_json::to_string(&response).unwrap_or_default(),
    ));
    info!(peer = %peer, namespace = %namespace, client = session.name(), "client registered");

    run_session(&server, &mut reader, &tx, &session).await;

    // Cleanup: pending commands reject, subscriptions drop.
    server.router.unregister_target(&namespace).await;
    server.router.sequences().forget(&namespace);
    server.limiter.forget(session_id);
    server.sessions.lock().remove(&session_id);
    telemetry::CLIENTS_CONNECTED.set(server.client_count() as f64);
    debug!(peer = %peer, namespace = %namespace, "client disconnected");

    // Dropping every sender lets the writer drain and exit.
    drop(session);
    drop(tx);
    let _ = writer.await;
}

async fn await_handshake(
    reader: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
    tx: &mpsc::UnboundedSender<Message>,
) -> Option<HandshakeRequest> {
    let first = tokio::time::timeout(Duration::from_millis(HANDSHAKE_TIMEOUT_MS), reader.next());
    let frame = match first.await {
        Err(_elapsed) => {
            let _ = tx.send(close_frame(CLOSE_HANDSHAKE_TIMEOUT, "handshake timeout"));
            return None;
        }
        Ok(None) | Ok(Some(Err(_))) => return None,
        Ok(Some(Ok(frame))) => frame,
    };
    let Message::Text(text) = frame else {
        let _ = tx.send(close_frame(CLOSE_NOT_HANDSHAKE, "expected handshake"));
        return None;
    };

    match classify(&text) {
        InboundKind::Handshake(request) => Some(request),
        InboundKind::Malformed => {
            let _ = tx.send(close_frame(CLOSE_INVALID_HANDSHAKE, "invalid handshake"));
            None
        }
        _ => {
            let _ = tx.send(close_frame(CLOSE_NOT_HANDSHAKE, "expected handshake"));
            None
        }
    }
}

fn register_session(
    server: &Arc<ClientServer>,
    handshake: &HandshakeRequest,
    tx: &mpsc::UnboundedSender<Message>,
) -> Option<Arc<ClientSession>> {
    let base = client_namespace(&handshake.name);
    let mut candidates = vec![base.as_str().to_string()];
    candidates.extend((2..10).map(|n| format!("{}_{n}", base.as_str())));

    for candidate in candidates {
        let Ok(namespace) = Namespace::new(candidate) else {
            continue;
        };
        let session = Arc::new(ClientSession::new(
            namespace,
            handshake.name.clone(),
            tx.clone(),
        ));
        if server.router.register_target(session.clone()).is_ok() {
            return Some(session);
        }
    }
    None
}

async fn run_session(
    server: &Arc<ClientServer>,
    reader: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
    tx: &mpsc::UnboundedSender<Message>,
    session: &Arc<ClientSession>,
) {
    let mut shutdown_rx = server.shutdown_tx.subscribe();
    let mut heartbeat =
        tokio::time::interval(Duration::from_millis(server.config.heartbeat_interval));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;

    let idle_check = (server.config.idle_timeout / 4).max(1_000);
    let mut idle_ticker = tokio::time::interval(Duration::from_millis(idle_check));
    idle_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    idle_ticker.tick().await;

    let mut last_activity = server.router.clock().now_millis();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = tx.send(close_frame(CLOSE_SERVER_SHUTDOWN, "server shutdown"));
                return;
            }
            _ = heartbeat.tick() => {
                let ping = PingFrame::at(server.router.clock().now_millis());
                let _ = tx.send(Message::Text(
                    serde_json::to_string(&ping).unwrap_or_default(),
                ));
            }
            _ = idle_ticker.tick() => {
                let idle_for = server.router.clock().now_millis() - last_activity;
                if idle_for > server.config.idle_timeout as i64 {
                    let _ = tx.send(close_frame(CLOSE_IDLE_TIMEOUT, "idle timeout"));
                    return;
                }
            }
            inbound = reader.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = server.router.clock().now_millis();
                        handle_text(server, tx, session, &text).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        last_activity = server.router.clock().now_millis();
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(namespace = %session.namespace(), "ignoring binary frame");
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(namespace = %session.namespace(), error = %err, "receive error");
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_text(
    server: &Arc<ClientServer>,
    tx: &mpsc::UnboundedSender<Message>,
    session: &Arc<ClientSession>,
    text: &str,
) {
    match classify(text) {
        InboundKind::Ping => {
            let _ = tx.send(Message::Text(r#"{"type":"pong"}"#.to_string()));
        }
        InboundKind::Pong => {}
        InboundKind::Handshake(_) => {
            debug!(namespace = %session.namespace(), "duplicate handshake ignored");
        }
        InboundKind::Malformed => {
            send_hub_error(
                server,
                session,
                ErrorCode::InvalidMessage,
                "malformed frame",
                None,
            );
        }
        InboundKind::Envelope => {
            match server.limiter.check(session.id()) {
                RateLimitResult::Denied { retry_after_ms } => {
                    telemetry::RATE_LIMITED.inc();
                    send_hub_error(
                        server,
                        session,
                        ErrorCode::RateLimited,
                        format!("rate limit exceeded; retry in {retry_after_ms} ms"),
                        None,
                    );
                    return;
                }
                RateLimitResult::Allowed { .. } => {}
            }

            match decode(text) {
                Ok(mut message) => {
                    // The hub, not the client, decides who it is.
                    if message.source != *session.namespace() {
                        message.source = session.namespace().clone();
                    }
                    if let Err(err) = server.router.route(message).await {
                        warn!(namespace = %session.namespace(), error = %err, "route failed");
                    }
                }
                Err(err) => {
                    let related = serde_json::from_str::<serde_json::Value>(text)
                        .ok()
                        .and_then(|v| v.get("id").cloned())
                        .and_then(|id| serde_json::from_value::<MessageId>(id).ok());
                    send_hub_error(server, session, err.code, err.message, related);
                }
            }
        }
    }
}

/// Sends a hub-originated error envelope directly to one client.
fn send_hub_error(
    server: &Arc<ClientServer>,
    session: &Arc<ClientSession>,
    code: ErrorCode,
    message_text: impl Into<String>,
    related: Option<MessageId>,
) {
    let hub = Namespace::hub_core();
    let sequence = server.router.sequences().next(&hub);
    let envelope = BridgeMessage::new(
        hub,
        MessagePayload::Error(ErrorPayload {
            code: code.as_str().to_string(),
            message: message_text.into(),
            details: None,
            related_message_id: related,
        }),
        server.router.clock().as_ref(),
        sequence,
    )
    .with_target(session.namespace().clone());

    match encode(&envelope) {
        Ok(text) => {
            let _ = session.send_frame(Message::Text(text));
        }
        Err(err) => warn!(error = %err, "error envelope encoding failed"),
    }
}
