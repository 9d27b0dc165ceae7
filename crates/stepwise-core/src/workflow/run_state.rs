//! Mutable per-run state shared by every region of a run.
//!
//! Each step writes only its own key, so the maps are concurrent (`DashMap`)
//! rather than lock-guarded. A subscriber sub-run gets a child `RunState`
//! seeded from its parent; the child's writes are folded back with
//! [`RunState::absorb`] once the sub-run settles.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use serde_json::Value;
use stepwise_types::workflow::{
    Snapshot, StepResult, StepState, WorkflowContext, TRIGGER_STEP_ID,
};
use uuid::Uuid;

pub struct RunState {
    run_id: Uuid,
    trigger_data: Value,
    input_data: Value,
    steps: DashMap<String, StepResult>,
    attempts: DashMap<String, i64>,
    machine_state: DashMap<String, StepState>,
    /// Keys written by this state (not inherited from a parent).
    written: DashSet<String>,
    parent: Option<Arc<RunState>>,
}

impl RunState {
    pub fn new(run_id: Uuid, trigger_data: Value) -> Self {
        Self::from_context(
            run_id,
            WorkflowContext::new(trigger_data),
            BTreeMap::new(),
        )
    }

    /// Rebuild a run's state from a persisted context and machine state.
    pub fn from_context(
        run_id: Uuid,
        context: WorkflowContext,
        machine_state: BTreeMap<String, StepState>,
    ) -> Self {
        Self {
            run_id,
            trigger_data: context.trigger_data,
            input_data: context.input_data,
            steps: context.steps.into_iter().collect(),
            attempts: context.attempts.into_iter().collect(),
            machine_state: machine_state.into_iter().collect(),
            written: DashSet::new(),
            parent: None,
        }
    }

    /// Child state for a subscriber sub-run, seeded with the parent's
    /// current context.
    pub fn child_of(parent: &Arc<RunState>) -> Self {
        let context = parent.context();
        let mut child = Self::from_context(parent.run_id, context, BTreeMap::new());
        child.parent = Some(Arc::clone(parent));
        child
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn trigger_data(&self) -> &Value {
        &self.trigger_data
    }

    pub fn input_data(&self) -> &Value {
        &self.input_data
    }

    // -----------------------------------------------------------------------
    // Step results
    // -----------------------------------------------------------------------

    pub fn step_result(&self, step_id: &str) -> Option<StepResult> {
        self.steps.get(step_id).map(|entry| entry.value().clone())
    }

    /// Trigger payload for `"trigger"`, otherwise a successful step's output.
    pub fn step_output(&self, step_id: &str) -> Option<Value> {
        if step_id == TRIGGER_STEP_ID {
            return Some(self.trigger_data.clone());
        }
        self.steps
            .get(step_id)
            .and_then(|entry| entry.value().success_output().cloned())
    }

    /// Write the entry for `step_id`.
    ///
    /// Final entries are never replaced; returns `false` when the write was
    /// refused.
    pub fn record(&self, step_id: &str, result: StepResult) -> bool {
        if let Some(existing) = self.steps.get(step_id)
            && existing.is_final()
        {
            tracing::warn!(
                run_id = %self.run_id,
                step_id,
                existing = %existing.status(),
                attempted = %result.status(),
                "refusing to overwrite final step result"
            );
            return false;
        }
        self.steps.insert(step_id.to_string(), result);
        self.written.insert(step_id.to_string());
        true
    }

    /// Entries written by this state, in key order.
    pub fn written_results(&self) -> BTreeMap<String, StepResult> {
        self.written
            .iter()
            .filter_map(|id| {
                self.steps
                    .get(id.key())
                    .map(|entry| (id.key().clone(), entry.value().clone()))
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Attempts
    // -----------------------------------------------------------------------

    /// Remaining retry budget; `0` when never initialised.
    pub fn attempts(&self, step_id: &str) -> i64 {
        self.attempts.get(step_id).map(|a| *a).unwrap_or(0)
    }

    /// Set the budget unless one is already recorded (e.g. from a snapshot).
    pub fn init_attempts(&self, step_id: &str, budget: u32) {
        self.attempts
            .entry(step_id.to_string())
            .or_insert(i64::from(budget));
    }

    pub fn reset_attempts(&self, step_id: &str, budget: u32) {
        self.attempts.insert(step_id.to_string(), i64::from(budget));
    }

    /// Decrement and return the new remaining budget.
    pub fn decrement_attempts(&self, step_id: &str) -> i64 {
        let mut entry = self.attempts.entry(step_id.to_string()).or_insert(0);
        *entry -= 1;
        *entry
    }

    // -----------------------------------------------------------------------
    // Machine state
    // -----------------------------------------------------------------------

    pub fn set_machine_state(&self, step_id: &str, state: StepState) {
        self.machine_state.insert(step_id.to_string(), state);
    }

    pub fn machine_state_of(&self, step_id: &str) -> Option<StepState> {
        self.machine_state.get(step_id).map(|s| *s)
    }

    pub fn machine_state(&self) -> BTreeMap<String, StepState> {
        let mut merged = self
            .parent
            .as_ref()
            .map(|parent| parent.machine_state())
            .unwrap_or_default();
        merged.extend(
            self.machine_state
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value())),
        );
        merged
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    /// Serializable view of the run.
    ///
    /// A child state overlays its own writes on the parent's current
    /// context, so snapshots taken inside a sub-run stay complete.
    pub fn context(&self) -> WorkflowContext {
        let mut context = match &self.parent {
            Some(parent) => parent.context(),
            None => WorkflowContext {
                steps: BTreeMap::new(),
                trigger_data: self.trigger_data.clone(),
                attempts: BTreeMap::new(),
                input_data: self.input_data.clone(),
            },
        };

        let own_steps: BTreeMap<String, StepResult> = match &self.parent {
            Some(_) => self.written_results(),
            None => self
                .steps
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
        };
        context.steps.extend(own_steps);
        context.attempts.extend(self.owned_attempts());
        context
    }

    /// Attempt counters this state is authoritative for. A child only owns
    /// the counters of steps it drove; the rest are stale seeded copies.
    fn owned_attempts(&self) -> Vec<(String, i64)> {
        self.attempts
            .iter()
            .filter(|entry| {
                self.parent.is_none() || self.machine_state.contains_key(entry.key())
            })
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.machine_state(), self.context())
    }

    /// Fold a finished child's writes back into this state.
    ///
    /// Keys already final here are left untouched.
    pub fn absorb(&self, child: &RunState) {
        for (step_id, result) in child.written_results() {
            self.record(&step_id, result);
        }
        for entry in child.machine_state.iter() {
            self.machine_state.insert(entry.key().clone(), *entry.value());
        }
        for (step_id, remaining) in child.owned_attempts() {
            self.attempts.insert(step_id, remaining);
        }
    }
}

impl std::fmt::Debug for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunState")
            .field("run_id", &self.run_id)
            .field("steps", &self.steps.len())
            .field("is_child", &self.parent.is_some())
            .finish()
    }
}
