//! Workflow execution — dependency-aware, concurrent runs of a `Plan`.
//!
//! A plan is a DAG of steps. The `PlanExecutor` repeatedly dispatches every
//! pending step whose dependencies have completed, resolves `{{step.path}}`
//! placeholders in its inputs from earlier results, and folds each outcome
//! into the `WorkflowRun` one at a time. Gates may force-fail a step and halt
//! further dispatch.

pub mod executor;
pub mod resolver;
pub mod run;

pub use executor::{ExecutionResult, PlanExecutor};
pub use resolver::{parse_placeholder, resolve_inputs, resolve_value};
pub use run::{TaskMap, WorkflowRun};
