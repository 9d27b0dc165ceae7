//! Workflow engine core: step graphs, condition and variable resolution,
//! the per-step state machine, and the run coordinator.
//!
//! - `graph` -- step nodes, flattened step graphs, workflow validation
//! - `handler` -- step handler trait, type-erased handlers, `StepContext`
//! - `path` -- dotted/indexed JSON path lookup
//! - `query` -- matcher for the declarative query operators
//! - `condition` -- `when` evaluation (declarative and function forms)
//! - `variables` -- input binding resolution
//! - `run_state` -- concurrent per-run state (results, attempts, machine state)
//! - `observer` -- per-run broadcast channel and event stream
//! - `actor` -- resolver actor wrapping one handler invocation
//! - `subscriber` -- subscriber sub-run spawning and merging
//! - `machine` -- parallel regions and per-step transitions
//! - `instance` -- run coordinator (start/resume/watch) and engine facade

pub mod actor;
pub mod condition;
pub mod graph;
pub mod handler;
pub mod instance;
pub mod machine;
pub mod observer;
pub mod path;
pub mod query;
pub mod run_state;
pub mod subscriber;
pub mod variables;

use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::StepStatus;
use uuid::Uuid;

pub use condition::{ConditionContext, ConditionVerdict, When, WhenOutcome};
pub use graph::{GraphError, GraphRef, StepGraph, StepGraphBuilder, StepNode, Workflow};
pub use handler::{BoxStepHandler, StepContext, StepError, StepHandler, handler_fn};
pub use instance::{WorkflowEngine, WorkflowExecutor, WorkflowInstance};
pub use observer::RunObserver;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure taxonomy of a run.
///
/// Only `ActorInitialization` ever reaches a caller; the others are recorded
/// into step entries or logged.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("step '{step_id}': {reason}")]
    ConditionFailure { step_id: String, reason: String },

    #[error("step '{step_id}' failed: {message}")]
    StepExecutionFailure { step_id: String, message: String },

    #[error("failed to persist snapshot for run {run_id}: {source}")]
    SnapshotPersistence {
        run_id: Uuid,
        #[source]
        source: RepositoryError,
    },

    #[error("run could not be initialized: {0}")]
    ActorInitialization(#[from] ExecutorError),

    #[error("subscribers of step '{parent}' failed: {message}")]
    SubscriberExecution { parent: String, message: String },
}

/// Errors returned by `start`/`resume`. Each happens before any step runs.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("workflow '{0}' has no steps")]
    EmptyGraph(String),

    #[error("run {0} has already been started")]
    AlreadyStarted(Uuid),

    #[error("no snapshot for workflow '{workflow_name}' run {run_id}")]
    SnapshotNotFound { workflow_name: String, run_id: Uuid },

    #[error("step '{0}' is not part of this workflow")]
    UnknownStep(String),

    #[error("step '{step_id}' is not suspended (status: {status:?})")]
    StepNotSuspended {
        step_id: String,
        status: Option<StepStatus>,
    },

    #[error("snapshot storage error: {0}")]
    Repository(#[from] RepositoryError),
}
