//! Workflow run domain types.
//!
//! Defines the per-run state that flows through the engine (`WorkflowContext`
//! and its `StepResult` entries), the per-step machine states, the events that
//! drive transitions, the persisted `Snapshot` and the terminal
//! `RunResolution` handed back to callers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reserved step id that refers to the run's trigger payload.
pub const TRIGGER_STEP_ID: &str = "trigger";

/// Default delay between a `waiting` hold and the next condition check.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// Outcome recorded for a step in `WorkflowContext::steps`.
///
/// Internally tagged by `status`:
/// ```json
/// { "status": "success", "output": { "x": 1 } }
/// { "status": "suspended", "suspend_payload": { "reason": "manual" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepResult {
    Success {
        output: Value,
    },
    Failed {
        error: String,
    },
    Suspended {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        suspend_payload: Option<Value>,
        /// Interim output attached by a soft suspend.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
    Waiting,
    Skipped,
}

impl StepResult {
    pub fn status(&self) -> StepStatus {
        match self {
            StepResult::Success { .. } => StepStatus::Success,
            StepResult::Failed { .. } => StepStatus::Failed,
            StepResult::Suspended { .. } => StepStatus::Suspended,
            StepResult::Waiting => StepStatus::Waiting,
            StepResult::Skipped => StepStatus::Skipped,
        }
    }

    /// Output of a successful step.
    pub fn success_output(&self) -> Option<&Value> {
        match self {
            StepResult::Success { output } => Some(output),
            _ => None,
        }
    }

    /// Whether this entry is final for the run.
    ///
    /// Final entries are never overwritten; `Suspended` and `Waiting` are
    /// intermediate and may still be refined.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            StepResult::Success { .. } | StepResult::Failed { .. } | StepResult::Skipped
        )
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            StepResult::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Flat status of a step result, as shown to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Suspended,
    Waiting,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Suspended => "suspended",
            StepStatus::Waiting => "waiting",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Machine states
// ---------------------------------------------------------------------------

/// Sub-state of a single step inside its region's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Waiting,
    Limbo,
    Suspended,
    Executing,
    RunningSubscribers,
    Completed,
    Failed,
}

impl StepState {
    /// States in which a region stops progressing for this invocation.
    ///
    /// `Limbo` is an indefinite hold but counts as settled for run completion.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Suspended | StepState::Limbo
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Pending => "pending",
            StepState::Waiting => "waiting",
            StepState::Limbo => "limbo",
            StepState::Suspended => "suspended",
            StepState::Executing => "executing",
            StepState::RunningSubscribers => "running_subscribers",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Machine events
// ---------------------------------------------------------------------------

/// Events that drive per-step state transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// The step (or its condition) asked to suspend the run.
    Suspended {
        step_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        suspend_payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        soft_output: Option<Value>,
    },
    StepSuccess {
        step_id: String,
        output: Value,
    },
    StepFailed {
        step_id: String,
        error: String,
    },
    /// Retry (or re-check) after the step's delay.
    StepWaiting {
        step_id: String,
    },
    ConditionsMet {
        step_id: String,
    },
    /// Condition said "treat as already done".
    ConditionsSkipToCompleted {
        step_id: String,
    },
    ConditionsSkipped {
        step_id: String,
    },
    ConditionFailed {
        step_id: String,
        error: String,
    },
    ConditionsLimbo {
        step_id: String,
    },
    ResetToPending {
        step_id: String,
    },
}

impl WorkflowEvent {
    pub fn step_id(&self) -> &str {
        match self {
            WorkflowEvent::Suspended { step_id, .. }
            | WorkflowEvent::StepSuccess { step_id, .. }
            | WorkflowEvent::StepFailed { step_id, .. }
            | WorkflowEvent::StepWaiting { step_id }
            | WorkflowEvent::ConditionsMet { step_id }
            | WorkflowEvent::ConditionsSkipToCompleted { step_id }
            | WorkflowEvent::ConditionsSkipped { step_id }
            | WorkflowEvent::ConditionFailed { step_id, .. }
            | WorkflowEvent::ConditionsLimbo { step_id }
            | WorkflowEvent::ResetToPending { step_id } => step_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry and data bindings
// ---------------------------------------------------------------------------

/// Retry configuration for a step (or a whole workflow).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Number of retries after the first attempt (default 0).
    #[serde(default)]
    pub attempts: u32,
    /// Delay in milliseconds spent in `waiting` before re-checking.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 0,
            delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl RetryConfig {
    pub fn new(attempts: u32, delay_ms: u64) -> Self {
        Self { attempts, delay_ms }
    }
}

/// Where a data binding reads from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BindingSource {
    Trigger,
    Step(String),
}

impl From<String> for BindingSource {
    fn from(value: String) -> Self {
        if value == TRIGGER_STEP_ID {
            BindingSource::Trigger
        } else {
            BindingSource::Step(value)
        }
    }
}

impl From<BindingSource> for String {
    fn from(value: BindingSource) -> Self {
        match value {
            BindingSource::Trigger => TRIGGER_STEP_ID.to_string(),
            BindingSource::Step(id) => id,
        }
    }
}

/// A single input binding: `{ "source": "fetch", "path": "items.0" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableBinding {
    pub source: BindingSource,
    /// Dotted/indexed accessor; `""` or `"."` selects the whole value.
    #[serde(default)]
    pub path: String,
}

impl VariableBinding {
    pub fn trigger(path: impl Into<String>) -> Self {
        Self {
            source: BindingSource::Trigger,
            path: path.into(),
        }
    }

    pub fn step(step_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            source: BindingSource::from(step_id.into()),
            path: path.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

/// Serializable state of a run.
///
/// `steps` holds exactly one entry per step that has produced an outcome;
/// `attempts` holds the remaining retry budget per step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    #[serde(default)]
    pub steps: BTreeMap<String, StepResult>,
    #[serde(default)]
    pub trigger_data: Value,
    #[serde(default)]
    pub attempts: BTreeMap<String, i64>,
    #[serde(default)]
    pub input_data: Value,
}

impl WorkflowContext {
    pub fn new(trigger_data: Value) -> Self {
        Self {
            steps: BTreeMap::new(),
            trigger_data,
            attempts: BTreeMap::new(),
            input_data: Value::Object(serde_json::Map::new()),
        }
    }

    /// Data visible to conditions and bindings for `step_id`.
    ///
    /// Returns the trigger payload for [`TRIGGER_STEP_ID`], the output of a
    /// successful step, and `None` for anything else.
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        if step_id == TRIGGER_STEP_ID {
            return Some(&self.trigger_data);
        }
        self.steps.get(step_id).and_then(StepResult::success_output)
    }

    /// Merge resume data into `input_data`; keys from `resume_data` win.
    pub fn merge_input(&mut self, resume_data: Value) {
        match (&mut self.input_data, resume_data) {
            (Value::Object(existing), Value::Object(incoming)) => {
                for (key, value) in incoming {
                    existing.insert(key, value);
                }
            }
            (_, Value::Null) => {}
            (slot, incoming) => *slot = incoming,
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Persisted `(machine state, context)` pair, keyed by `(workflow_name, run_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Last known machine state per step id.
    #[serde(default)]
    pub machine_state: BTreeMap<String, StepState>,
    pub context: WorkflowContext,
    pub saved_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(machine_state: BTreeMap<String, StepState>, context: WorkflowContext) -> Self {
        Self {
            machine_state,
            context,
            saved_at: Utc::now(),
        }
    }

    /// Step ids currently parked in `Suspended`.
    pub fn suspended_steps(&self) -> Vec<&str> {
        self.context
            .steps
            .iter()
            .filter(|(_, result)| matches!(result, StepResult::Suspended { .. }))
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// RunResolution
// ---------------------------------------------------------------------------

/// Terminal resolution of a run (or of one resume invocation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResolution {
    pub run_id: Uuid,
    /// Every step entry written during the run, including subscriber sub-runs.
    pub results: BTreeMap<String, StepResult>,
    /// Where each region stopped: step id -> settled machine state.
    pub active_paths: BTreeMap<String, StepState>,
    /// Unix epoch milliseconds at resolution time.
    pub timestamp: i64,
}

impl RunResolution {
    pub fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.results.get(step_id).map(StepResult::status)
    }

    pub fn output_of(&self, step_id: &str) -> Option<&Value> {
        self.results.get(step_id).and_then(StepResult::success_output)
    }

    /// Whether any region is parked in `Suspended`.
    pub fn is_suspended(&self) -> bool {
        self.active_paths
            .values()
            .any(|state| *state == StepState::Suspended)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
