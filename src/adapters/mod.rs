//! Adapters bridging the core to the outside world.

pub mod http;
pub mod satellite;
pub mod websocket;
