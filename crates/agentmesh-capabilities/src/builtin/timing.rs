use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use agentmesh_core::error::{MeshError, Result};
use agentmesh_core::traits::Capability;
use agentmesh_core::types::{CapabilityContext, CapabilityResponse, Inputs};

/// Sleeps, then returns `value`. Useful for exercising concurrent branches.
pub struct WaitCapability;

#[derive(Deserialize)]
struct WaitInput {
    #[serde(default)]
    ms: u64,
    #[serde(default)]
    value: Value,
}

impl Capability for WaitCapability {
    fn name(&self) -> &str {
        "wait"
    }

    fn description(&self) -> &str {
        "Sleep for `ms` milliseconds, then return `value`."
    }

    fn execute(
        &self,
        inputs: Inputs,
        ctx: CapabilityContext,
    ) -> BoxFuture<'_, Result<CapabilityResponse>> {
        Box::pin(async move {
            let p: WaitInput = serde_json::from_value(Value::Object(inputs)).map_err(|e| {
                MeshError::CapabilityExecution {
                    capability: "wait".into(),
                    message: e.to_string(),
                }
            })?;
            debug!(step_id = %ctx.step_id, ms = p.ms, "Waiting");
            tokio::time::sleep(Duration::from_millis(p.ms)).await;
            Ok(CapabilityResponse::completed(p.value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn wait_returns_value_after_sleep() {
        let inputs = json!({"ms": 1500, "value": {"done": true}})
            .as_object()
            .cloned()
            .unwrap();
        let start = tokio::time::Instant::now();
        let resp = WaitCapability
            .execute(inputs, CapabilityContext::default())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1500));
        assert_eq!(resp, CapabilityResponse::completed(json!({"done": true})));
    }
}
