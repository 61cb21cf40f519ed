//! Narrow `Transport` boundary (§6, Design Notes "Dynamic dispatch across
//! hosted/native builds"): the engine depends only on this trait for
//! ingress/egress, never on a concrete message bus.

use async_trait::async_trait;
use faas_common::{Invocation, InvocationResult};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Pulls the next well-formed `Invocation` from the ingress side of the
    /// message bus. Returns `None` when the transport has shut down.
    async fn accept_invocation(&self) -> Option<Invocation>;
    /// Pushes a completed `InvocationResult` to the egress/completion
    /// producer.
    async fn deliver_result(&self, result: InvocationResult);
}
