pub mod gate;
pub mod workflow;

pub use gate::{ConfidenceGate, GateSet, GateVerdict, PredicateGate, StepGate};
pub use workflow::{ExecutionResult, PlanExecutor, WorkflowRun};
