//! Observer events published on a run's channel.
//!
//! `WorkflowRunEvent` is the unified event type a run emits while it
//! progresses. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::{RunResolution, Snapshot, StepState};

/// Events emitted by a single workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowRunEvent {
    /// A run (or a resume of a run) has started.
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
        resumed: bool,
    },

    /// A step changed machine state.
    StateUpdate {
        run_id: Uuid,
        step_id: String,
        state: StepState,
        snapshot: Snapshot,
    },

    /// A step handler emitted a custom event.
    Custom {
        run_id: Uuid,
        step_id: String,
        event: String,
        payload: Value,
    },

    /// A step is suspending and is waiting for external input.
    StepSuspended {
        run_id: Uuid,
        step_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        suspend_payload: Option<Value>,
    },

    /// Every region reached a settled state.
    RunSettled {
        resolution: RunResolution,
    },
}

impl WorkflowRunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            WorkflowRunEvent::RunStarted { run_id, .. }
            | WorkflowRunEvent::StateUpdate { run_id, .. }
            | WorkflowRunEvent::Custom { run_id, .. }
            | WorkflowRunEvent::StepSuspended { run_id, .. } => *run_id,
            WorkflowRunEvent::RunSettled { resolution } => resolution.run_id,
        }
    }

    /// Convenience accessor for the machine state carried by `StateUpdate`.
    pub fn machine_state(&self) -> Option<&BTreeMap<String, StepState>> {
        match self {
            WorkflowRunEvent::StateUpdate { snapshot, .. } => Some(&snapshot.machine_state),
            _ => None,
        }
    }
}
