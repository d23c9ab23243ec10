//! Downstream client transport: WebSocket server, sessions, handshake
//! protocol, and per-client rate limiting.

mod messages;
mod rate_limit;
mod server;
mod session;

pub use messages::{
    classify, HandshakeRequest, HandshakeResponse, InboundKind, PingFrame, CLOSE_AUTH_FAILED,
    CLOSE_HANDSHAKE_TIMEOUT, CLOSE_IDLE_TIMEOUT, CLOSE_INVALID_HANDSHAKE, CLOSE_MAX_CLIENTS,
    CLOSE_NOT_HANDSHAKE, CLOSE_SERVER_DISCONNECT, CLOSE_SERVER_SHUTDOWN,
};
pub use rate_limit::{FixedWindowLimiter, RateLimitResult};
pub use server::ClientServer;
pub use session::ClientSession;
