//! Subscriber spawner.
//!
//! After a step finishes, the sub-graph registered under its id runs as a
//! nested machine against a child `RunState` seeded from the parent. The
//! child's results are merged back additively and its settled regions are
//! handed back to the parent machine. Nothing that happens in the sub-run
//! fails the parent chain; problems are logged as `SubscriberExecution`
//! failures.

use std::sync::Arc;

use stepwise_types::workflow::StepState;

use crate::repository::snapshot::SnapshotRepository;

use super::EngineError;
use super::graph::GraphRef;
use super::machine::{Machine, RegionOutcome, RegionStart, RunEnv};
use super::run_state::RunState;

pub(crate) async fn spawn_subscribers<R: SnapshotRepository + 'static>(
    env: &Arc<RunEnv<R>>,
    parent_id: &str,
    state: &Arc<RunState>,
    depth: u32,
) -> Vec<RegionOutcome> {
    let Some(graph) = env.workflow.subscribers_of(parent_id) else {
        return Vec::new();
    };
    let run_id = state.run_id();

    if depth >= env.config.max_subscriber_depth {
        let err = EngineError::SubscriberExecution {
            parent: parent_id.to_string(),
            message: format!(
                "nesting depth {depth} reaches the limit of {}",
                env.config.max_subscriber_depth
            ),
        };
        tracing::warn!(run_id = %run_id, error = %err, "subscribers not run");
        return Vec::new();
    }

    tracing::debug!(
        run_id = %run_id,
        parent = parent_id,
        regions = graph.roots().len(),
        "spawning subscribers"
    );

    let starts: Vec<RegionStart> = graph
        .roots()
        .iter()
        .map(|root| RegionStart::Fresh { root: root.clone() })
        .collect();
    let expected = starts.len();

    let child = Arc::new(RunState::child_of(state));
    let machine = Arc::new(Machine::new(
        Arc::clone(env),
        GraphRef::Subscribers(parent_id.to_string()),
        Arc::clone(&child),
        depth + 1,
    ));
    let outcomes = machine.run(starts).await;

    state.absorb(&child);

    // Deeper sub-runs report their own failures.
    let own: Vec<&RegionOutcome> = outcomes
        .iter()
        .filter(|o| graph.roots().contains(&o.root))
        .collect();
    let failed: Vec<&str> = own
        .iter()
        .filter(|o| o.state == StepState::Failed)
        .map(|o| o.step_id.as_str())
        .collect();
    if !failed.is_empty() || own.len() < expected {
        let err = EngineError::SubscriberExecution {
            parent: parent_id.to_string(),
            message: format!(
                "{} of {expected} regions settled; failed steps: [{}]",
                own.len(),
                failed.join(", ")
            ),
        };
        tracing::warn!(run_id = %run_id, error = %err, "subscriber sub-run failed; parent continues");
    }

    outcomes
}
