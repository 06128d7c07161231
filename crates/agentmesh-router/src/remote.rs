use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use agentmesh_core::error::{MeshError, Result};
use agentmesh_core::traits::{Capability, ChannelHandle};
use agentmesh_core::types::{CapabilityContext, CapabilityResponse, Inputs};

use crate::connection::AgentConnection;
use crate::service::RouterService;

/// Capability served by a connected agent.
///
/// Each invocation sends a TASK_ASSIGN and waits for the agent's report.
/// The wait is bounded by `timeout` when one is set.
pub struct RemoteCapability<H = AgentConnection> {
    name: String,
    service: Arc<RouterService<H>>,
    timeout: Option<Duration>,
}

impl<H: ChannelHandle> RemoteCapability<H> {
    pub fn new(name: impl Into<String>, service: Arc<RouterService<H>>, timeout: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            service,
            timeout,
        }
    }
}

impl<H: ChannelHandle> Capability for RemoteCapability<H> {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Forwarded to a connected agent"
    }

    fn execute(&self, inputs: Inputs, ctx: CapabilityContext) -> BoxFuture<'_, Result<CapabilityResponse>> {
        Box::pin(async move {
            let rx = self.service.dispatch(&self.name, &ctx, inputs).await?;

            let received = match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, rx).await {
                    Ok(received) => received,
                    Err(_) => {
                        warn!(
                            workflow_id = %ctx.workflow_id,
                            step_id = %ctx.step_id,
                            capability = %self.name,
                            "Remote step timed out"
                        );
                        self.service.abandon(&ctx).await;
                        return Err(MeshError::CapabilityTimeout {
                            capability: self.name.clone(),
                            timeout_secs: limit.as_secs(),
                        });
                    }
                },
                None => rx.await,
            };

            received.map_err(|_| {
                MeshError::Dispatch(format!("step {} was dropped before it completed", ctx.step_id))
            })
        })
    }
}
