//! Core domain: foundation value objects, the message envelope, the
//! state store, and the subscription registry.

pub mod foundation;
pub mod message;
pub mod state;
pub mod subscription;
