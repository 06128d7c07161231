use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use agentmesh_core::error::{MeshError, Result};
use agentmesh_core::traits::Capability;
use agentmesh_core::types::{CapabilityContext, CapabilityResponse, Inputs};

/// Registry of available capabilities, keyed by name.
///
/// Built once at startup. A handler that fails to initialize is never
/// registered, so a step needing it later fails with "no agent for
/// capability" instead of the process failing at startup.
#[derive(Clone)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: HashMap::new(),
        }
    }

    /// Register a capability under its own name.
    pub fn register(&mut self, capability: impl Capability) {
        self.register_arc(Arc::new(capability));
    }

    /// Register a shared capability under its own name, replacing any previous one.
    pub fn register_arc(&mut self, capability: Arc<dyn Capability>) {
        let name = capability.name().to_string();
        if self.capabilities.insert(name.clone(), capability).is_some() {
            debug!(capability = %name, "Replaced existing capability");
        }
    }

    /// Run a handler constructor; register the handler only if it initializes.
    ///
    /// Returns whether the handler was registered.
    pub fn try_register<F>(&mut self, label: &str, init: F) -> bool
    where
        F: FnOnce() -> Result<Arc<dyn Capability>>,
    {
        match init() {
            Ok(capability) => {
                self.register_arc(capability);
                true
            }
            Err(e) => {
                warn!(capability = %label, error = %e, "Capability failed to initialize, skipping");
                false
            }
        }
    }

    /// Unregister a capability by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.capabilities.remove(name).is_some()
    }

    /// Get a capability by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// List all registered capability names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.capabilities.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Execute a capability by name.
    pub async fn execute(
        &self,
        name: &str,
        inputs: Inputs,
        ctx: CapabilityContext,
    ) -> Result<CapabilityResponse> {
        let capability = self
            .get(name)
            .ok_or_else(|| MeshError::CapabilityNotFound(name.to_string()))?;
        capability.execute(inputs, ctx).await
    }

    /// Create a registry holding the named built-ins. Unknown names are skipped.
    pub fn with_builtins<S: AsRef<str>>(names: &[S]) -> Self {
        let mut registry = Self::new();
        for name in names {
            let name = name.as_ref();
            registry.try_register(name, || crate::builtin::create(name));
        }
        registry
    }

    /// Create a registry holding every built-in.
    pub fn with_all_builtins() -> Self {
        Self::with_builtins(crate::builtin::BUILTIN_NAMES)
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
