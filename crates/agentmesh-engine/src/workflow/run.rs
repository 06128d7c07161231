use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use agentmesh_core::types::{Plan, TaskState, TaskStatus, WorkflowStatus};

/// Per-step state of one run, keyed by step id.
pub type TaskMap = BTreeMap<String, TaskState>;

/// State of one execution of a plan. Owned and mutated only by the executor.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRun {
    pub workflow_id: String,
    pub plan: Plan,
    pub status: WorkflowStatus,
    pub tasks: TaskMap,
    pub completed_tasks: BTreeSet<String>,
    pub failed_tasks: BTreeSet<String>,
    /// Scheduling scans performed, including the final empty one.
    pub passes: usize,
    /// Set when a gate halted further dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted_by: Option<String>,
}

impl WorkflowRun {
    pub fn new(workflow_id: impl Into<String>, plan: Plan) -> Self {
        let tasks = plan
            .steps
            .iter()
            .map(|s| (s.step_id.clone(), TaskState::pending()))
            .collect();
        Self {
            workflow_id: workflow_id.into(),
            plan,
            status: WorkflowStatus::Running,
            tasks,
            completed_tasks: BTreeSet::new(),
            failed_tasks: BTreeSet::new(),
            passes: 0,
            halted_by: None,
        }
    }

    pub fn task(&self, step_id: &str) -> Option<&TaskState> {
        self.tasks.get(step_id)
    }

    /// Pending steps whose dependencies have all completed, in declaration order.
    pub fn ready_steps(&self) -> Vec<String> {
        self.plan
            .steps
            .iter()
            .filter(|step| {
                self.tasks
                    .get(&step.step_id)
                    .is_some_and(|t| t.status == TaskStatus::Pending)
            })
            .filter(|step| {
                step.dependencies
                    .iter()
                    .all(|dep| self.completed_tasks.contains(dep))
            })
            .map(|step| step.step_id.clone())
            .collect()
    }

    /// Step ids still pending, in declaration order.
    pub fn pending_steps(&self) -> Vec<String> {
        self.plan
            .steps
            .iter()
            .filter(|s| {
                self.tasks
                    .get(&s.step_id)
                    .is_some_and(|t| t.status == TaskStatus::Pending)
            })
            .map(|s| s.step_id.clone())
            .collect()
    }

    pub fn mark_running(&mut self, step_id: &str) -> bool {
        self.transition(step_id, |t| t.start())
    }

    pub fn record_success(&mut self, step_id: &str, result: Value) -> bool {
        let ok = self.transition(step_id, |t| t.complete(result));
        if ok {
            self.completed_tasks.insert(step_id.to_string());
        }
        ok
    }

    pub fn record_failure(&mut self, step_id: &str, error: impl Into<String>, result: Option<Value>) -> bool {
        let error = error.into();
        let ok = self.transition(step_id, |t| t.fail(error, result));
        if ok {
            self.failed_tasks.insert(step_id.to_string());
        }
        ok
    }

    fn transition(&mut self, step_id: &str, f: impl FnOnce(&mut TaskState) -> bool) -> bool {
        match self.tasks.get_mut(step_id) {
            Some(task) => {
                let from = task.status;
                let ok = f(task);
                if !ok {
                    warn!(workflow_id = %self.workflow_id, step_id, from = %from, "Rejected illegal task transition");
                }
                ok
            }
            None => {
                warn!(workflow_id = %self.workflow_id, step_id, "Transition for unknown step");
                false
            }
        }
    }

    /// Compute the terminal status from the task sets and store it.
    pub fn finalize(&mut self) -> WorkflowStatus {
        self.status = if !self.failed_tasks.is_empty() {
            WorkflowStatus::Failed
        } else if self.completed_tasks.len() == self.plan.steps.len() {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Stalled
        };
        self.status
    }

    /// Result of the last declared step, if it completed.
    pub fn final_result(&self) -> Option<Value> {
        let last = self.plan.last_step()?;
        let task = self.tasks.get(&last.step_id)?;
        if task.status == TaskStatus::Completed {
            task.result.clone()
        } else {
            None
        }
    }

    /// One diagnostic naming every failed step, or the stall, in declaration order.
    pub fn error_summary(&self) -> Option<String> {
        match self.status {
            WorkflowStatus::Failed => {
                let failures: Vec<String> = self
                    .plan
                    .steps
                    .iter()
                    .filter(|s| self.failed_tasks.contains(&s.step_id))
                    .map(|s| {
                        let message = self
                            .tasks
                            .get(&s.step_id)
                            .and_then(|t| t.error.as_deref())
                            .unwrap_or("unknown error");
                        format!(
                            "step '{}' ({}) failed: {}",
                            s.step_id, s.agent_capability_required, message
                        )
                    })
                    .collect();
                Some(format!(
                    "{} of {} steps failed: {}",
                    failures.len(),
                    self.plan.steps.len(),
                    failures.join("; ")
                ))
            }
            WorkflowStatus::Stalled => Some(format!(
                "workflow stalled: steps [{}] can never run because their dependencies cannot complete",
                self.pending_steps().join(", ")
            )),
            WorkflowStatus::Running | WorkflowStatus::Completed => None,
        }
    }
}
