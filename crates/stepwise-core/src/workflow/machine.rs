//! Per-step state machine and parallel regions.
//!
//! Every initial step of a graph starts a region, and regions run
//! concurrently on a `JoinSet`. Inside a region one cursor walks the chain,
//! and each step moves through these states:
//!
//! ```text
//! pending --met--> executing --success--> running_subscribers --> completed --> next step
//!    |                 |  \--suspend--> suspended
//!    |                 \--error--> waiting (attempts left) | failed
//!    +--skipped--> running_subscribers      +--limbo--> limbo
//!    +--skip_to_completed--> completed      +--failed--> failed
//!    +--suspended--> suspended              +--waiting--> waiting --delay--> pending
//! ```
//!
//! Snapshots are persisted on entry to `completed`, `failed` and `suspended`.
//! Regions settled inside subscriber sub-runs are reported alongside the
//! graph's own regions.
//! The region loop is iterative, so chain length never grows the stack;
//! recursion only happens through subscriber sub-runs, which go through the
//! boxed future returned by [`Machine::run`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use stepwise_types::config::EngineConfig;
use stepwise_types::event::WorkflowRunEvent;
use stepwise_types::workflow::{RetryConfig, StepResult, StepState, WorkflowEvent};
use tokio::task::JoinSet;

use crate::repository::snapshot::SnapshotRepository;

use super::EngineError;
use super::actor;
use super::condition::{self, ConditionVerdict};
use super::graph::{GraphRef, StepNode, Workflow};
use super::observer::RunObserver;
use super::run_state::RunState;
use super::subscriber;

// ---------------------------------------------------------------------------
// Shared run environment
// ---------------------------------------------------------------------------

/// Collaborators shared by every machine of one run (including sub-runs).
pub(crate) struct RunEnv<R> {
    pub workflow: Arc<Workflow>,
    pub repo: Arc<R>,
    pub config: Arc<EngineConfig>,
    pub observer: RunObserver,
}

impl<R: SnapshotRepository> RunEnv<R> {
    pub fn retry_for(&self, node: &StepNode) -> RetryConfig {
        self.workflow.effective_retry(node, self.config.default_retry)
    }

    /// Upsert the run's snapshot. Failures are logged and swallowed.
    pub async fn persist(&self, state: &RunState) {
        let run_id = state.run_id();
        let snapshot = state.snapshot();
        match self
            .repo
            .persist_snapshot(self.workflow.name(), &run_id, &snapshot)
            .await
        {
            Ok(()) => {
                tracing::debug!(run_id = %run_id, workflow = %self.workflow.name(), "snapshot persisted");
            }
            Err(source) => {
                let err = EngineError::SnapshotPersistence { run_id, source };
                tracing::warn!(error = %err, "snapshot write failed; continuing");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Regions
// ---------------------------------------------------------------------------

/// How a region enters this invocation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RegionStart {
    /// Start at the root in `pending`.
    Fresh { root: String },
    /// Re-enter a suspended step with `ResetToPending`.
    Resume { root: String, step_id: String },
    /// Already settled in a previous invocation; reported as-is.
    Settled {
        root: String,
        step_id: String,
        state: StepState,
    },
}

/// Where a region stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionOutcome {
    pub root: String,
    pub step_id: String,
    pub state: StepState,
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// Target state for `event` in `current`; `None` when the event is not
/// accepted there.
pub fn next_state(current: StepState, event: &WorkflowEvent) -> Option<StepState> {
    use StepState as S;
    use WorkflowEvent as E;

    match (current, event) {
        (S::Pending, E::ConditionsMet { .. }) => Some(S::Executing),
        (S::Pending, E::ConditionsSkipToCompleted { .. }) => Some(S::Completed),
        (S::Pending, E::ConditionsSkipped { .. }) => Some(S::RunningSubscribers),
        (S::Pending, E::ConditionsLimbo { .. }) => Some(S::Limbo),
        (S::Pending, E::ConditionFailed { .. }) => Some(S::Failed),
        (S::Pending | S::Executing, E::Suspended { .. }) => Some(S::Suspended),
        (S::Pending | S::Executing, E::StepWaiting { .. }) => Some(S::Waiting),
        (S::Executing, E::StepSuccess { .. }) => Some(S::RunningSubscribers),
        (S::Executing, E::StepFailed { .. }) => Some(S::Failed),
        (S::Suspended, E::ResetToPending { .. }) => Some(S::Pending),
        _ => None,
    }
}

fn verdict_event(step_id: &str, verdict: ConditionVerdict) -> WorkflowEvent {
    let step_id = step_id.to_string();
    match verdict {
        ConditionVerdict::Met => WorkflowEvent::ConditionsMet { step_id },
        ConditionVerdict::SkipToCompleted => WorkflowEvent::ConditionsSkipToCompleted { step_id },
        ConditionVerdict::Skipped => WorkflowEvent::ConditionsSkipped { step_id },
        ConditionVerdict::Limbo => WorkflowEvent::ConditionsLimbo { step_id },
        ConditionVerdict::Failed(error) => WorkflowEvent::ConditionFailed { step_id, error },
        ConditionVerdict::Suspended => WorkflowEvent::Suspended {
            step_id,
            suspend_payload: None,
            soft_output: None,
        },
        ConditionVerdict::Waiting => WorkflowEvent::StepWaiting { step_id },
    }
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

/// Drives the regions of one graph (the main graph or a subscriber graph)
/// against one `RunState`.
pub(crate) struct Machine<R> {
    env: Arc<RunEnv<R>>,
    graph: GraphRef,
    state: Arc<RunState>,
    depth: u32,
}

impl<R: SnapshotRepository + 'static> Machine<R> {
    pub fn new(env: Arc<RunEnv<R>>, graph: GraphRef, state: Arc<RunState>, depth: u32) -> Self {
        Self {
            env,
            graph,
            state,
            depth,
        }
    }

    /// Run every region to a settled state.
    ///
    /// The result also carries the settled regions of every subscriber
    /// sub-run started along the way.
    pub fn run(self: Arc<Self>, starts: Vec<RegionStart>) -> BoxFuture<'static, Vec<RegionOutcome>> {
        Box::pin(async move {
            let mut outcomes = Vec::with_capacity(starts.len());
            let mut regions = JoinSet::new();

            for start in starts {
                match start {
                    RegionStart::Settled {
                        root,
                        step_id,
                        state,
                    } => outcomes.push(RegionOutcome {
                        root,
                        step_id,
                        state,
                    }),
                    RegionStart::Fresh { root } => {
                        let machine = Arc::clone(&self);
                        let step_id = root.clone();
                        regions.spawn(machine.drive_region(root, step_id, false));
                    }
                    RegionStart::Resume { root, step_id } => {
                        let machine = Arc::clone(&self);
                        regions.spawn(machine.drive_region(root, step_id, true));
                    }
                }
            }

            while let Some(joined) = regions.join_next().await {
                match joined {
                    Ok(settled) => outcomes.extend(settled),
                    Err(e) => {
                        tracing::error!(
                            run_id = %self.state.run_id(),
                            error = %e,
                            "region task aborted"
                        );
                    }
                }
            }
            outcomes
        })
    }

    async fn drive_region(
        self: Arc<Self>,
        root: String,
        start: String,
        resume: bool,
    ) -> Vec<RegionOutcome> {
        let mut settled = Vec::new();
        let outcome = self.walk_region(root, start, resume, &mut settled).await;
        settled.push(outcome);
        settled
    }

    /// Walk one chain until it settles; sub-run outcomes go to `nested`.
    async fn walk_region(
        &self,
        root: String,
        start: String,
        resume: bool,
        nested: &mut Vec<RegionOutcome>,
    ) -> RegionOutcome {
        let run_id = self.state.run_id();
        let settle = |step_id: String, state: StepState| RegionOutcome {
            root: root.clone(),
            step_id,
            state,
        };

        let Some(graph) = self.env.workflow.graph_for(&self.graph) else {
            tracing::error!(run_id = %run_id, graph = ?self.graph, "graph missing from workflow");
            return settle(start, StepState::Failed);
        };

        let mut step_id = start;
        let mut current = if resume {
            let reset = WorkflowEvent::ResetToPending {
                step_id: step_id.clone(),
            };
            match self.transition(&step_id, StepState::Suspended, reset).await {
                Some(state) => state,
                None => return settle(step_id, StepState::Suspended),
            }
        } else {
            self.enter(&step_id, StepState::Pending).await;
            StepState::Pending
        };

        loop {
            let Some(node) = graph.node(&step_id).cloned() else {
                tracing::error!(run_id = %run_id, step_id = %step_id, "step missing from graph");
                return settle(step_id, StepState::Failed);
            };

            let event = match current {
                StepState::Pending => {
                    let verdict = condition::check(
                        &node,
                        self.env.workflow.has_subscribers(&step_id),
                        self.state.context(),
                        run_id,
                    )
                    .await;
                    verdict_event(&step_id, verdict)
                }
                StepState::Waiting => {
                    let delay = self.env.retry_for(&node).delay_ms;
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    self.enter(&step_id, StepState::Pending).await;
                    current = StepState::Pending;
                    continue;
                }
                StepState::Executing => {
                    actor::run_step(&node, &self.state, self.env.as_ref()).await
                }
                StepState::RunningSubscribers => {
                    nested.extend(
                        subscriber::spawn_subscribers(&self.env, &step_id, &self.state, self.depth)
                            .await,
                    );
                    self.enter(&step_id, StepState::Completed).await;
                    match graph.next_of(&step_id) {
                        Some(next) => {
                            step_id = next.to_string();
                            self.enter(&step_id, StepState::Pending).await;
                            current = StepState::Pending;
                            continue;
                        }
                        None => return settle(step_id, StepState::Completed),
                    }
                }
                StepState::Completed
                | StepState::Failed
                | StepState::Suspended
                | StepState::Limbo => return settle(step_id, current),
            };

            match self.transition(&step_id, current, event).await {
                Some(next) => current = next,
                None => return settle(step_id, current),
            }
        }
    }

    /// Apply `event`: run its context action, then enter the target state.
    async fn transition(
        &self,
        step_id: &str,
        current: StepState,
        event: WorkflowEvent,
    ) -> Option<StepState> {
        let run_id = self.state.run_id();
        let Some(next) = next_state(current, &event) else {
            tracing::warn!(
                run_id = %run_id,
                step_id,
                state = %current,
                event = ?event,
                "ignoring event not accepted in current state"
            );
            return None;
        };

        match event {
            WorkflowEvent::Suspended {
                suspend_payload,
                soft_output,
                ..
            } => {
                self.state.record(
                    step_id,
                    StepResult::Suspended {
                        suspend_payload: suspend_payload.clone(),
                        output: soft_output,
                    },
                );
                if let Some(node) = self.env.workflow.all_nodes().find(|n| n.id == step_id) {
                    let budget = self.env.retry_for(node).attempts;
                    self.state.reset_attempts(step_id, budget);
                }
                self.env.observer.publish(WorkflowRunEvent::StepSuspended {
                    run_id,
                    step_id: step_id.to_string(),
                    suspend_payload,
                });
            }
            WorkflowEvent::StepSuccess { output, .. } => {
                self.state.record(step_id, StepResult::Success { output });
            }
            WorkflowEvent::StepFailed { error, .. } | WorkflowEvent::ConditionFailed { error, .. } => {
                self.state.record(step_id, StepResult::Failed { error });
            }
            WorkflowEvent::StepWaiting { .. } => {
                let remaining = self.state.decrement_attempts(step_id);
                tracing::debug!(run_id = %run_id, step_id, remaining, "step waiting");
                self.state.record(step_id, StepResult::Waiting);
            }
            WorkflowEvent::ConditionsSkipped { .. }
            | WorkflowEvent::ConditionsLimbo { .. }
            | WorkflowEvent::ConditionsSkipToCompleted { .. } => {
                self.state.record(step_id, StepResult::Skipped);
            }
            WorkflowEvent::ConditionsMet { .. } | WorkflowEvent::ResetToPending { .. } => {}
        }

        self.enter(step_id, next).await;
        Some(next)
    }

    /// Record the new state, notify observers, and persist on terminal entry.
    async fn enter(&self, step_id: &str, state: StepState) {
        let run_id = self.state.run_id();
        self.state.set_machine_state(step_id, state);
        tracing::debug!(run_id = %run_id, step_id, state = %state, "step state transition");

        if self.env.observer.has_subscribers() {
            self.env.observer.publish(WorkflowRunEvent::StateUpdate {
                run_id,
                step_id: step_id.to_string(),
                state,
                snapshot: self.state.snapshot(),
            });
        }

        if matches!(
            state,
            StepState::Completed | StepState::Failed | StepState::Suspended
        ) {
            self.env.persist(&self.state).await;
        }
    }
}
