//! RouteTarget port - the addressable handler seam of the router.
//!
//! Adapters (the satellite upstream, each client session) implement this
//! to receive the messages routed to their namespace. Handlers must be
//! re-entrant with respect to further `route()` calls made from within
//! them; the router never holds a core lock across an invocation.

use async_trait::async_trait;

use crate::domain::foundation::{BridgeError, Namespace, SessionId};
use crate::domain::message::BridgeMessage;

/// An addressable message handler registered with the router.
#[async_trait]
pub trait RouteTarget: Send + Sync {
    /// Stable identity; doubles as the subscription client id.
    fn id(&self) -> SessionId;

    /// The namespace this target answers for. At most one target per
    /// namespace may be registered.
    fn namespace(&self) -> &Namespace;

    /// Delivers one message. Errors are translated by the router into
    /// `ADAPTER_ERROR` replies to the message source.
    async fn handle(&self, message: BridgeMessage) -> Result<(), BridgeError>;
}
