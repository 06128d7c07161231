use futures::future::BoxFuture;

use crate::error::Result;
use crate::protocol::MessageEnvelope;
use crate::types::{CapabilityContext, CapabilityResponse, Inputs};

/// Capability — a named, swappable unit of work.
pub trait Capability: Send + Sync + 'static {
    /// Capability name referenced by `Step::agent_capability_required`.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Execute with fully resolved inputs.
    ///
    /// A domain failure is reported as `Ok(CapabilityResponse::Failed { .. })`;
    /// `Err` is reserved for faults inside the handler itself.
    fn execute(
        &self,
        inputs: Inputs,
        ctx: CapabilityContext,
    ) -> BoxFuture<'_, Result<CapabilityResponse>>;
}

/// Handle to one peer on the message channel.
pub trait ChannelHandle: Send + Sync + 'static {
    /// Queue a message for delivery without waiting for the peer.
    fn send(&self, envelope: MessageEnvelope) -> Result<()>;

    /// Close the underlying connection. Best-effort; never fails.
    fn close(&self);
}
