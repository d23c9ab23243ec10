//! satellite-bridge - state-first integration hub.
//!
//! Brokers telemetry and control between a Companion Satellite control
//! surface upstream and WebSocket application clients downstream,
//! around a canonical owner-scoped versioned state store.

pub mod adapters;
pub mod application;
pub mod cli;
pub mod config;
pub mod domain;
pub mod ports;
pub mod telemetry;
