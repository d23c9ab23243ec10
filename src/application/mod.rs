//! Application layer: the message router and its command bookkeeping.

mod idempotency;
mod pending;
mod router;

pub use idempotency::{
    BeginOutcome, IdempotencyCache, IdempotencyState, DEFAULT_IDEMPOTENCY_TTL_MS,
    SWEEP_INTERVAL_MS,
};
pub use pending::{PendingCommand, PendingCommands};
pub use router::{MessageRouter, RouterConfig};
