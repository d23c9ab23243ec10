//! Foundation value objects shared by every subsystem.

mod clock;
mod errors;
mod ids;
mod namespace;
mod path;
mod sequence;

pub use clock::{Clock, SharedClock, SystemClock, Timestamp};
pub use errors::{BridgeError, ErrorCode, ValidationError};
pub use ids::{MessageId, SessionId, SubscriptionId};
pub use namespace::{client_namespace, Namespace, HUB_CORE, MAX_NAMESPACE_LEN};
pub use path::{
    path_matches_pattern, pattern_to_regex, validate_path, CompiledPattern, MAX_PATH_LEN,
};
pub use sequence::SequenceRegistry;

#[cfg(test)]
pub use clock::test_support;
