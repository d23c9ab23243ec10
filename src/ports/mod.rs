//! Ports - interfaces between the core and its adapters.
//!
//! Following hexagonal architecture, ports define the contracts the
//! router exposes; adapters implement them.

mod health;
mod target;

pub use health::{HealthChecker, HealthState};
pub use target::RouteTarget;
