//! Upstream WebSocket connection lifecycle.
//!
//! One task owns the connection: it dials with a timeout, announces the
//! device with `BEGIN`, pumps the heartbeat, forwards inbound frames to
//! the adapter, and reconnects with capped exponential backoff plus
//! jitter. The adapter observes the lifecycle through
//! [`ConnectionEvent`]s.

use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::CompanionConfig;

use super::protocol::{parse_line, InboundFrame, OutboundFrame};

/// Reconnect delay cap in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Upper bound (exclusive) of the uniform jitter added to each delay.
pub const JITTER_MS: u64 = 1_000;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

/// What the connection task reports to the adapter.
#[derive(Debug)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Connected,
    Disconnected { reason: String },
    Frame(InboundFrame),
    /// PING/PONG round trip measured by the heartbeat.
    Latency(Duration),
    /// Reconnect attempts exhausted; the task has stopped.
    GaveUp,
}

/// Exponential backoff without jitter: `min(base · 2^(attempt−1), cap)`.
pub fn backoff_delay_ms(attempt: u32, base_ms: u64) -> u64 {
    let shift = attempt.saturating_sub(1).min(16);
    base_ms.saturating_mul(1u64 << shift).min(MAX_BACKOFF_MS)
}

fn jittered_backoff_ms(attempt: u32, base_ms: u64) -> u64 {
    backoff_delay_ms(attempt, base_ms) + rand::thread_rng().gen_range(0..JITTER_MS)
}

/// Spawns the connection task.
pub fn spawn(
    config: CompanionConfig,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(connection_loop(config, event_tx, outbound_rx, shutdown_rx))
}

async fn connection_loop(
    config: CompanionConfig,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let url = config.url();
    let mut attempt: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let _ = event_tx.send(ConnectionEvent::StateChanged(ConnectionState::Connecting));
        let connect = tokio::time::timeout(
            Duration::from_millis(config.connection_timeout),
            connect_async(url.as_str()),
        );

        match connect.await {
            Ok(Ok((stream, _response))) => {
                attempt = 0;
                info!(url = %url, "upstream connected");
                let reason = run_connection(
                    stream,
                    &config,
                    &event_tx,
                    &mut outbound_rx,
                    &mut shutdown_rx,
                )
                .await;
                let _ =
                    event_tx.send(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
                let _ = event_tx.send(ConnectionEvent::Disconnected { reason });
            }
            Ok(Err(err)) => {
                warn!(url = %url, error = %err, "upstream connect failed");
                let _ = event_tx.send(ConnectionEvent::StateChanged(ConnectionState::Error));
                let _ = event_tx.send(ConnectionEvent::Disconnected {
                    reason: err.to_string(),
                });
            }
            Err(_elapsed) => {
                warn!(url = %url, "upstream connect timed out");
                let _ = event_tx.send(ConnectionEvent::StateChanged(ConnectionState::Error));
                let _ = event_tx.send(ConnectionEvent::Disconnected {
                    reason: "connection timeout".to_string(),
                });
            }
        }

        if *shutdown_rx.borrow() || !config.auto_reconnect {
            break;
        }

        attempt += 1;
        if config.max_reconnect_attempts != 0 && attempt > config.max_reconnect_attempts {
            warn!(attempts = attempt - 1, "upstream reconnection gave up");
            let _ = event_tx.send(ConnectionEvent::StateChanged(ConnectionState::Error));
            let _ = event_tx.send(ConnectionEvent::GaveUp);
            break;
        }

        let _ = event_tx.send(ConnectionEvent::StateChanged(ConnectionState::Reconnecting));
        crate::telemetry::UPSTREAM_RECONNECTS.inc();
        let delay = jittered_backoff_ms(attempt, config.reconnect_delay);
        debug!(attempt, delay_ms = delay, "scheduling upstream reconnect");

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            _ = shutdown_rx.changed() => break,
        }
    }
}

/// Runs one established connection to completion; returns the close
/// reason.
async fn run_connection(
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    config: &CompanionConfig,
    event_tx: &mpsc::UnboundedSender<ConnectionEvent>,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> String {
    let (mut write, mut read) = stream.split();

    let begin = OutboundFrame::Begin {
        device_id: config.device.device_id.clone(),
        product_name: config.device.product_name.clone(),
        keys_per_row: config.device.keys_per_row,
        keys_total: config.device.keys_total,
        bitmap_size: config.device.bitmap_size,
    };
    if let Err(err) = write.send(Message::Text(begin.encode())).await {
        return format!("BEGIN failed: {err}");
    }

    let _ = event_tx.send(ConnectionEvent::StateChanged(ConnectionState::Connected));
    let _ = event_tx.send(ConnectionEvent::Connected);

    let mut heartbeat = tokio::time::interval(Duration::from_millis(config.heartbeat_interval));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so the BEGIN settles.
    heartbeat.tick().await;
    let mut pending_pong: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return "shutdown".to_string();
            }
            _ = heartbeat.tick() => {
                pending_pong = Some(Instant::now());
                if let Err(err) = write.send(Message::Text(OutboundFrame::Ping.encode())).await {
                    return format!("heartbeat send failed: {err}");
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(line) => {
                        if let Err(err) = write.send(Message::Text(line)).await {
                            return format!("send failed: {err}");
                        }
                    }
                    None => return "adapter dropped".to_string(),
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        for line in text.lines().filter(|l| !l.trim().is_empty()) {
                            match parse_line(line) {
                                Ok(InboundFrame::Pong) => {
                                    if let Some(sent) = pending_pong.take() {
                                        let _ = event_tx.send(
                                            ConnectionEvent::Latency(sent.elapsed()),
                                        );
                                    }
                                }
                                Ok(frame) => {
                                    let _ = event_tx.send(ConnectionEvent::Frame(frame));
                                }
                                Err(err) => {
                                    debug!(line, error = %err, "unparseable upstream line");
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(f) => format!("{}: {}", u16::from(f.code), f.reason),
                            None => "closed".to_string(),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return format!("receive error: {err}"),
                    None => return "stream ended".to_string(),
                }
            }
        }
    }
}
