use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use agentmesh_capabilities::CapabilityRegistry;
use agentmesh_core::error::{MeshError, Result};
use agentmesh_core::event::EventBus;
use agentmesh_core::types::{CapabilityContext, CapabilityResponse, Plan, WorkflowEvent, WorkflowStatus};

use super::resolver::resolve_inputs;
use super::run::WorkflowRun;
use crate::gate::{GateSet, GateVerdict, StepGate};

/// Result of executing an entire plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub status: WorkflowStatus,
    pub workflow_id: String,
    /// Result of the plan's last declared step, if it completed.
    pub final_result: Option<Value>,
    #[serde(rename = "run_state")]
    pub run: WorkflowRun,
    /// Combined diagnostic for FAILED and STALLED runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }
}

/// Executes a plan as a DAG.
///
/// Each pass dispatches every pending step whose dependencies have completed,
/// runs those invocations concurrently, and folds each outcome into the run as
/// it arrives. The loop is bounded to `steps + 1` passes and stops early on a
/// pass with nothing to dispatch or when a gate rejects a result.
pub struct PlanExecutor {
    registry: Arc<CapabilityRegistry>,
    gates: GateSet,
    event_bus: Option<Arc<EventBus>>,
}

impl PlanExecutor {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            registry,
            gates: GateSet::new(),
            event_bus: None,
        }
    }

    /// Attach a gate to this executor.
    pub fn with_gate(mut self, gate: impl StepGate) -> Self {
        self.gates.add(gate);
        self
    }

    pub fn with_gates(mut self, gates: GateSet) -> Self {
        self.gates = gates;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Execute a plan under a freshly generated workflow id.
    pub async fn execute_plan(&self, plan: Plan) -> ExecutionResult {
        self.execute_plan_with_id(Uuid::new_v4().to_string(), plan)
            .await
    }

    /// Execute a plan under a caller-chosen workflow id.
    ///
    /// Never fails: configuration errors, capability failures, gate
    /// rejections, and stalls are all reported in the returned result.
    pub async fn execute_plan_with_id(&self, workflow_id: String, plan: Plan) -> ExecutionResult {
        let start = Instant::now();
        let mut run = WorkflowRun::new(workflow_id.clone(), plan);

        if let Err(e) = run.plan.validate() {
            warn!(workflow_id = %workflow_id, error = %e, "Rejected plan");
            run.status = WorkflowStatus::Failed;
            self.publish(WorkflowEvent::RunFinished {
                workflow_id: workflow_id.clone(),
                status: run.status,
            });
            return ExecutionResult {
                status: run.status,
                workflow_id,
                final_result: None,
                run,
                error: Some(e.to_string()),
                elapsed_ms: start.elapsed().as_millis() as u64,
            };
        }

        info!(
            workflow_id = %workflow_id,
            plan_id = %run.plan.plan_id,
            steps = run.plan.steps.len(),
            "Executing plan"
        );
        self.publish(WorkflowEvent::RunStarted {
            workflow_id: workflow_id.clone(),
            plan_id: run.plan.plan_id.clone(),
        });

        let max_passes = run.plan.steps.len() + 1;
        for pass in 1..=max_passes {
            run.passes = pass;
            let ready = run.ready_steps();
            if ready.is_empty() {
                debug!(workflow_id = %workflow_id, pass, "Nothing to dispatch");
                break;
            }
            debug!(workflow_id = %workflow_id, pass, ready = ?ready, "Dispatching steps");

            let mut in_flight = FuturesUnordered::new();
            for step_id in ready {
                let Some(step) = run.plan.step(&step_id).cloned() else {
                    continue;
                };
                run.mark_running(&step_id);
                self.publish(WorkflowEvent::StepStarted {
                    workflow_id: workflow_id.clone(),
                    step_id: step_id.clone(),
                    capability: step.agent_capability_required.clone(),
                });

                let inputs = resolve_inputs(&step.inputs, &run.tasks);
                let Some(capability) = self.registry.get(&step.agent_capability_required) else {
                    let err = MeshError::CapabilityNotFound(step.agent_capability_required.clone());
                    self.fold(&mut run, &step_id, Err(err));
                    continue;
                };

                let ctx = CapabilityContext::new(workflow_id.clone(), step_id.clone());
                in_flight.push(async move {
                    let outcome = AssertUnwindSafe(capability.execute(inputs, ctx))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            Err(MeshError::CapabilityExecution {
                                capability: step.agent_capability_required.clone(),
                                message: "capability panicked".into(),
                            })
                        });
                    (step_id, outcome)
                });
            }

            let mut halted = false;
            while let Some((step_id, outcome)) = in_flight.next().await {
                halted |= self.fold(&mut run, &step_id, outcome);
            }

            if halted {
                info!(workflow_id = %workflow_id, "Gate rejected a result, halting dispatch");
                break;
            }
        }

        let status = run.finalize();
        let error = run.error_summary();
        let final_result = run.final_result();
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match status {
            WorkflowStatus::Completed => info!(workflow_id = %workflow_id, elapsed_ms, "Workflow completed"),
            _ => warn!(
                workflow_id = %workflow_id,
                status = %status,
                error = error.as_deref().unwrap_or(""),
                "Workflow did not complete"
            ),
        }
        self.publish(WorkflowEvent::RunFinished {
            workflow_id: workflow_id.clone(),
            status,
        });

        ExecutionResult {
            status,
            workflow_id,
            final_result,
            run,
            error,
            elapsed_ms,
        }
    }

    /// Fold one invocation outcome into the run. Returns true if a gate
    /// rejected the result and dispatch must stop.
    fn fold(&self, run: &mut WorkflowRun, step_id: &str, outcome: Result<CapabilityResponse>) -> bool {
        let workflow_id = run.workflow_id.clone();
        match outcome {
            Ok(CapabilityResponse::Completed { result }) => {
                if let GateVerdict::Reject(reason) = self.gates.check(step_id, &result) {
                    warn!(workflow_id = %workflow_id, step_id, reason = %reason, "Gate rejected step result");
                    run.record_failure(step_id, reason.clone(), Some(result));
                    run.halted_by = Some(step_id.to_string());
                    self.publish(WorkflowEvent::GateRejected {
                        workflow_id: workflow_id.clone(),
                        step_id: step_id.to_string(),
                        reason: reason.clone(),
                    });
                    self.publish(WorkflowEvent::StepFailed {
                        workflow_id,
                        step_id: step_id.to_string(),
                        error: reason,
                    });
                    return true;
                }
                debug!(workflow_id = %workflow_id, step_id, "Step completed");
                run.record_success(step_id, result);
                self.publish(WorkflowEvent::StepCompleted {
                    workflow_id,
                    step_id: step_id.to_string(),
                });
            }
            Ok(CapabilityResponse::Failed { error: message }) => {
                warn!(workflow_id = %workflow_id, step_id, error = %message, "Step failed");
                run.record_failure(step_id, message.clone(), None);
                self.publish(WorkflowEvent::StepFailed {
                    workflow_id,
                    step_id: step_id.to_string(),
                    error: message,
                });
            }
            Err(e) => {
                error!(workflow_id = %workflow_id, step_id, error = %e, "Step faulted");
                let message = e.to_string();
                run.record_failure(step_id, message.clone(), None);
                self.publish(WorkflowEvent::StepFailed {
                    workflow_id,
                    step_id: step_id.to_string(),
                    error: message,
                });
            }
        }
        false
    }

    fn publish(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}
