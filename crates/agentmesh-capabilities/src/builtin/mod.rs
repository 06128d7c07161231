pub mod timing;
pub mod transform;

use std::sync::Arc;

use agentmesh_core::error::{MeshError, Result};
use agentmesh_core::traits::Capability;

/// Names of every built-in capability.
pub const BUILTIN_NAMES: &[&str] = &["echo", "merge", "select", "wait"];

/// Construct a built-in capability by name.
pub fn create(name: &str) -> Result<Arc<dyn Capability>> {
    let cap: Arc<dyn Capability> = match name {
        "echo" => Arc::new(transform::EchoCapability),
        "merge" => Arc::new(transform::MergeCapability),
        "select" => Arc::new(transform::SelectCapability),
        "wait" => Arc::new(timing::WaitCapability),
        other => {
            return Err(MeshError::Config(format!(
                "unknown built-in capability '{}'",
                other
            )))
        }
    };
    Ok(cap)
}
