//! Upstream Companion Satellite adapter: text-line protocol codec,
//! connection lifecycle, and bridge↔wire translation.

mod adapter;
mod connection;
mod protocol;

pub use adapter::{SatelliteAdapter, OWNER_NAMESPACE, TARGET_NAMESPACE};
pub use connection::{backoff_delay_ms, ConnectionEvent, ConnectionState, JITTER_MS, MAX_BACKOFF_MS};
pub use protocol::{
    decode_arg, encode_arg, parse_line, safe_variable_name, Capabilities, InboundFrame, KeyState,
    OutboundFrame, ProtocolError,
};
