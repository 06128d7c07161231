use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{MeshError, Result};

/// Inputs handed to a capability: a JSON object keyed by parameter name.
pub type Inputs = Map<String, Value>;

/// A declarative workflow: an ordered list of steps forming a DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    #[serde(default)]
    pub workflow_goal: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(plan_id: impl Into<String>, workflow_goal: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            plan_id: plan_id.into(),
            workflow_goal: workflow_goal.into(),
            steps,
        }
    }

    /// Get a step by id.
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// The last declared step; its result is the workflow's final result.
    pub fn last_step(&self) -> Option<&Step> {
        self.steps.last()
    }

    /// Check that step ids are unique and every dependency names a step of this plan.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.step_id.as_str()) {
                return Err(MeshError::InvalidPlan(format!(
                    "duplicate step id '{}'",
                    step.step_id
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.dependencies {
                if !seen.contains(dep.as_str()) {
                    return Err(MeshError::InvalidPlan(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.step_id, dep
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One unit of work within a plan, requiring exactly one capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub agent_capability_required: String,
    /// May embed `{{step_id.path}}` placeholders.
    #[serde(default)]
    pub inputs: Inputs,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Advisory only; the scheduler dispatches in declaration order.
    #[serde(default)]
    pub priority: i32,
}

impl Step {
    pub fn new(step_id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            agent_capability_required: capability.into(),
            inputs: Map::new(),
            dependencies: vec![],
            priority: 0,
        }
    }

    /// Set the inputs from a JSON object. Non-object values are ignored.
    pub fn with_inputs(mut self, inputs: Value) -> Self {
        if let Value::Object(map) = inputs {
            self.inputs = map;
        }
        self
    }

    /// Set a single input.
    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Lifecycle of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Per-step state. Transitions only PENDING → RUNNING → {COMPLETED | FAILED}.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskState {
    pub fn pending() -> Self {
        Self {
            status: TaskStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// PENDING → RUNNING. Returns false if the task was not pending.
    pub fn start(&mut self) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// RUNNING → COMPLETED.
    pub fn complete(&mut self, result: Value) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
        true
    }

    /// RUNNING → FAILED. A rejected result may be kept for diagnostics.
    pub fn fail(&mut self, error: impl Into<String>, result: Option<Value>) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.result = result;
        self.finished_at = Some(Utc::now());
        true
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::pending()
    }
}

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    /// No step could make progress and nothing failed: the graph can never complete.
    Stalled,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Stalled => write!(f, "STALLED"),
        }
    }
}

/// Context passed to a capability for each invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityContext {
    pub workflow_id: String,
    pub step_id: String,
}

impl CapabilityContext {
    pub fn new(workflow_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            step_id: step_id.into(),
        }
    }
}

/// Envelope returned by every capability.
///
/// Serializes as `{"status":"COMPLETED","result":...}` or
/// `{"status":"FAILED","error":"..."}`. Deserialization goes through
/// [`CapabilityResponse::from_envelope`], which also accepts the legacy
/// `data` key in place of `result`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapabilityResponse {
    Completed { result: Value },
    Failed { error: String },
}

impl CapabilityResponse {
    pub fn completed(result: Value) -> Self {
        Self::Completed { result }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Normalize a raw envelope into a response.
    ///
    /// `status` is matched case-insensitively (`COMPLETED`/`SUCCESS` and
    /// `FAILED`/`ERROR`). On success the payload is read from `result`, then
    /// from the legacy `data` key; a missing payload becomes `null`.
    pub fn from_envelope(envelope: Value) -> Result<Self> {
        let Value::Object(mut obj) = envelope else {
            return Err(MeshError::MalformedResponse(
                "envelope is not a JSON object".into(),
            ));
        };

        let status = obj
            .get("status")
            .and_then(|s| s.as_str())
            .map(|s| s.to_ascii_uppercase())
            .ok_or_else(|| MeshError::MalformedResponse("missing status".into()))?;

        match status.as_str() {
            "COMPLETED" | "SUCCESS" => {
                let result = match obj.remove("result") {
                    Some(v) if !v.is_null() => v,
                    _ => obj.remove("data").unwrap_or(Value::Null),
                };
                Ok(Self::Completed { result })
            }
            "FAILED" | "ERROR" => {
                let error = match obj.remove("error") {
                    Some(Value::String(s)) => s,
                    Some(Value::Null) | None => {
                        "capability reported failure without an error message".to_string()
                    }
                    Some(other) => other.to_string(),
                };
                Ok(Self::Failed { error })
            }
            other => Err(MeshError::MalformedResponse(format!(
                "unknown status '{}'",
                other
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for CapabilityResponse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_envelope(value).map_err(serde::de::Error::custom)
    }
}

/// Workflow lifecycle event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    RunStarted { workflow_id: String, plan_id: String },
    StepStarted { workflow_id: String, step_id: String, capability: String },
    StepCompleted { workflow_id: String, step_id: String },
    StepFailed { workflow_id: String, step_id: String, error: String },
    GateRejected { workflow_id: String, step_id: String, reason: String },
    RunFinished { workflow_id: String, status: WorkflowStatus },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_with_result_key() {
        let resp =
            CapabilityResponse::from_envelope(json!({"status": "COMPLETED", "result": {"a": 1}}))
                .unwrap();
        assert_eq!(resp, CapabilityResponse::completed(json!({"a": 1})));
    }

    #[test]
    fn envelope_with_legacy_data_key() {
        let resp =
            CapabilityResponse::from_envelope(json!({"status": "COMPLETED", "data": {"a": 1}}))
                .unwrap();
        assert_eq!(resp, CapabilityResponse::completed(json!({"a": 1})));
    }

    #[test]
    fn envelope_prefers_result_over_data() {
        let resp = CapabilityResponse::from_envelope(
            json!({"status": "completed", "result": "new", "data": "old"}),
        )
        .unwrap();
        assert_eq!(resp, CapabilityResponse::completed(json!("new")));
    }

    #[test]
    fn envelope_failure() {
        let resp =
            CapabilityResponse::from_envelope(json!({"status": "FAILED", "error": "x"})).unwrap();
        assert_eq!(resp, CapabilityResponse::failed("x"));

        let resp = CapabilityResponse::from_envelope(json!({"status": "FAILED"})).unwrap();
        assert!(matches!(resp, CapabilityResponse::Failed { .. }));
    }

    #[test]
    fn envelope_malformed() {
        assert!(CapabilityResponse::from_envelope(json!("nope")).is_err());
        assert!(CapabilityResponse::from_envelope(json!({"result": 1})).is_err());
        assert!(CapabilityResponse::from_envelope(json!({"status": "MAYBE"})).is_err());
    }

    #[test]
    fn envelope_serializes_with_status_tag() {
        let json = serde_json::to_value(CapabilityResponse::completed(json!(5))).unwrap();
        assert_eq!(json, json!({"status": "COMPLETED", "result": 5}));

        let parsed: CapabilityResponse =
            serde_json::from_value(json!({"status": "SUCCESS", "data": 7})).unwrap();
        assert_eq!(parsed, CapabilityResponse::completed(json!(7)));
    }

    #[test]
    fn task_state_never_goes_backward() {
        let mut task = TaskState::pending();
        assert!(!task.complete(json!(1)));
        assert!(task.start());
        assert!(!task.start());
        assert!(task.complete(json!(1)));
        assert!(!task.fail("late", None));
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.is_terminal());
    }

    #[test]
    fn plan_validation() {
        let plan = Plan::new(
            "p",
            "goal",
            vec![
                Step::new("a", "echo"),
                Step::new("b", "echo").depends_on(["a"]),
            ],
        );
        assert!(plan.validate().is_ok());

        let plan = Plan::new("p", "goal", vec![Step::new("b", "echo").depends_on(["zzz"])]);
        assert!(matches!(plan.validate(), Err(MeshError::InvalidPlan(_))));

        let plan = Plan::new("p", "goal", vec![Step::new("a", "echo"), Step::new("a", "echo")]);
        assert!(matches!(plan.validate(), Err(MeshError::InvalidPlan(_))));
    }

    #[test]
    fn plan_deserializes_with_defaults() {
        let plan: Plan = serde_json::from_value(json!({
            "plan_id": "p1",
            "steps": [
                {"step_id": "s1", "agent_capability_required": "echo"},
                {"step_id": "s2", "agent_capability_required": "echo",
                 "inputs": {"x": "{{s1.value}}"}, "dependencies": ["s1"], "priority": 2}
            ]
        }))
        .unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.steps[0].inputs.is_empty());
        assert_eq!(plan.steps[1].dependencies, vec!["s1"]);
        assert_eq!(plan.last_step().map(|s| s.step_id.as_str()), Some("s2"));
    }
}
