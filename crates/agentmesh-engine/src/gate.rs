use std::sync::Arc;

use serde_json::Value;

use agentmesh_core::config::{GateConfig, GateKind};
use agentmesh_core::path;

/// Outcome of inspecting a step result.
#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    Pass,
    /// Fail the step with this explanation and stop dispatching.
    Reject(String),
}

/// A domain policy attached to one step id that can force-fail that step
/// based on its result.
pub trait StepGate: Send + Sync + 'static {
    /// Step this gate inspects.
    fn step_id(&self) -> &str;

    fn evaluate(&self, result: &Value) -> GateVerdict;
}

/// Rejects a result whose confidence score is below a threshold.
#[derive(Debug, Clone)]
pub struct ConfidenceGate {
    step_id: String,
    threshold: f64,
    field: String,
}

impl ConfidenceGate {
    pub fn new(step_id: impl Into<String>, threshold: f64) -> Self {
        Self {
            step_id: step_id.into(),
            threshold,
            field: "confidence".to_string(),
        }
    }

    /// Read the score from a dotted path instead of `confidence`.
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }
}

impl StepGate for ConfidenceGate {
    fn step_id(&self) -> &str {
        &self.step_id
    }

    fn evaluate(&self, result: &Value) -> GateVerdict {
        match path::lookup(result, path::segments(&self.field)).and_then(Value::as_f64) {
            Some(confidence) if confidence >= self.threshold => GateVerdict::Pass,
            Some(confidence) => GateVerdict::Reject(format!(
                "Identification confidence {} is below the required threshold {}; \
                 the result is not reliable enough to continue the workflow",
                confidence, self.threshold
            )),
            None => GateVerdict::Reject(format!(
                "Result carries no numeric '{}' to compare against the required threshold {}",
                self.field, self.threshold
            )),
        }
    }
}

/// Gate built from a closure.
pub struct PredicateGate<F> {
    step_id: String,
    predicate: F,
}

impl<F> PredicateGate<F>
where
    F: Fn(&Value) -> GateVerdict + Send + Sync + 'static,
{
    pub fn new(step_id: impl Into<String>, predicate: F) -> Self {
        Self {
            step_id: step_id.into(),
            predicate,
        }
    }
}

impl<F> StepGate for PredicateGate<F>
where
    F: Fn(&Value) -> GateVerdict + Send + Sync + 'static,
{
    fn step_id(&self) -> &str {
        &self.step_id
    }

    fn evaluate(&self, result: &Value) -> GateVerdict {
        (self.predicate)(result)
    }
}

/// The gates registered for one plan execution.
#[derive(Clone, Default)]
pub struct GateSet {
    gates: Vec<Arc<dyn StepGate>>,
}

impl GateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, gate: impl StepGate) {
        self.gates.push(Arc::new(gate));
    }

    /// Build gates from `[[gates]]` config entries.
    pub fn from_config(configs: &[GateConfig]) -> Self {
        let mut set = Self::new();
        for config in configs {
            match &config.kind {
                GateKind::Confidence { threshold, field } => {
                    set.add(ConfidenceGate::new(&config.step_id, *threshold).with_field(field));
                }
            }
        }
        set
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Run every gate registered for `step_id`; the first rejection wins.
    pub fn check(&self, step_id: &str, result: &Value) -> GateVerdict {
        self.gates
            .iter()
            .filter(|g| g.step_id() == step_id)
            .map(|g| g.evaluate(result))
            .find(|v| matches!(v, GateVerdict::Reject(_)))
            .unwrap_or(GateVerdict::Pass)
    }
}
