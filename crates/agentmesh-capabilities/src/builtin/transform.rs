use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};

use agentmesh_core::error::{MeshError, Result};
use agentmesh_core::path;
use agentmesh_core::traits::Capability;
use agentmesh_core::types::{CapabilityContext, CapabilityResponse, Inputs};

// ── EchoCapability ──────────────────────────────────────────────

/// Returns its resolved inputs unchanged.
pub struct EchoCapability;

impl Capability for EchoCapability {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the resolved inputs as the step result."
    }

    fn execute(
        &self,
        inputs: Inputs,
        _ctx: CapabilityContext,
    ) -> BoxFuture<'_, Result<CapabilityResponse>> {
        Box::pin(async move { Ok(CapabilityResponse::completed(Value::Object(inputs))) })
    }
}

// ── MergeCapability ─────────────────────────────────────────────

pub struct MergeCapability;

#[derive(Deserialize)]
struct MergeInput {
    objects: Vec<Value>,
}

impl Capability for MergeCapability {
    fn name(&self) -> &str {
        "merge"
    }

    fn description(&self) -> &str {
        "Shallow-merge a list of objects left to right; later keys win."
    }

    fn execute(
        &self,
        inputs: Inputs,
        _ctx: CapabilityContext,
    ) -> BoxFuture<'_, Result<CapabilityResponse>> {
        Box::pin(async move {
            let p: MergeInput = serde_json::from_value(Value::Object(inputs)).map_err(|e| {
                MeshError::CapabilityExecution {
                    capability: "merge".into(),
                    message: e.to_string(),
                }
            })?;

            let mut merged = Map::new();
            for (i, item) in p.objects.into_iter().enumerate() {
                match item {
                    Value::Object(obj) => merged.extend(obj),
                    // Optional upstream results resolve to null
                    Value::Null => continue,
                    other => {
                        return Ok(CapabilityResponse::failed(format!(
                            "objects[{}] is not an object: {}",
                            i, other
                        )))
                    }
                }
            }
            Ok(CapabilityResponse::completed(Value::Object(merged)))
        })
    }
}

// ── SelectCapability ────────────────────────────────────────────

pub struct SelectCapability;

#[derive(Deserialize)]
struct SelectInput {
    value: Value,
    path: String,
    #[serde(default)]
    default: Option<Value>,
}

impl Capability for SelectCapability {
    fn name(&self) -> &str {
        "select"
    }

    fn description(&self) -> &str {
        "Pick a nested value by dotted path (e.g. 'items.0.name')."
    }

    fn execute(
        &self,
        inputs: Inputs,
        _ctx: CapabilityContext,
    ) -> BoxFuture<'_, Result<CapabilityResponse>> {
        Box::pin(async move {
            let p: SelectInput = serde_json::from_value(Value::Object(inputs)).map_err(|e| {
                MeshError::CapabilityExecution {
                    capability: "select".into(),
                    message: e.to_string(),
                }
            })?;

            match path::lookup(&p.value, path::segments(&p.path)) {
                Some(found) => Ok(CapabilityResponse::completed(found.clone())),
                None => match p.default {
                    Some(default) => Ok(CapabilityResponse::completed(default)),
                    None => Ok(CapabilityResponse::failed(format!(
                        "path '{}' not found",
                        p.path
                    ))),
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(v: Value) -> Inputs {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn echo_returns_inputs() {
        let resp = EchoCapability
            .execute(inputs(json!({"a": 1})), CapabilityContext::default())
            .await
            .unwrap();
        assert_eq!(resp, CapabilityResponse::completed(json!({"a": 1})));
    }

    #[tokio::test]
    async fn merge_later_keys_win_and_nulls_skip() {
        let resp = MergeCapability
            .execute(
                inputs(json!({"objects": [{"a": 1, "b": 1}, null, {"b": 2}]})),
                CapabilityContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(resp, CapabilityResponse::completed(json!({"a": 1, "b": 2})));
    }

    #[tokio::test]
    async fn merge_rejects_scalars() {
        let resp = MergeCapability
            .execute(inputs(json!({"objects": [1]})), CapabilityContext::default())
            .await
            .unwrap();
        assert!(!resp.is_completed());
    }

    #[tokio::test]
    async fn merge_missing_objects_is_fault() {
        let result = MergeCapability
            .execute(inputs(json!({})), CapabilityContext::default())
            .await;
        assert!(matches!(result, Err(MeshError::CapabilityExecution { .. })));
    }

    #[tokio::test]
    async fn select_path_and_default() {
        let ctx = CapabilityContext::default();
        let resp = SelectCapability
            .execute(
                inputs(json!({"value": {"items": [{"name": "kettle"}]}, "path": "items.0.name"})),
                ctx.clone(),
            )
            .await
            .unwrap();
        assert_eq!(resp, CapabilityResponse::completed(json!("kettle")));

        let resp = SelectCapability
            .execute(
                inputs(json!({"value": {}, "path": "missing", "default": 0})),
                ctx.clone(),
            )
            .await
            .unwrap();
        assert_eq!(resp, CapabilityResponse::completed(json!(0)));

        let resp = SelectCapability
            .execute(inputs(json!({"value": {}, "path": "missing"})), ctx)
            .await
            .unwrap();
        assert!(!resp.is_completed());
    }
}
