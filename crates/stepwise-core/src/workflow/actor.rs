//! Resolver actor: runs one step handler and classifies the outcome.
//!
//! The actor never fails. Every invocation ends in exactly one machine
//! event:
//! - a `suspend()` call during the handler wins over its return value; the
//!   run's snapshot is written before the event is returned
//! - `Ok(output)` becomes `StepSuccess`
//! - an error or panic becomes `StepWaiting` while attempts remain,
//!   `StepFailed` otherwise

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use stepwise_types::workflow::WorkflowEvent;

use crate::repository::snapshot::SnapshotRepository;

use super::EngineError;
use super::graph::StepNode;
use super::handler::{StepContext, SuspendSlot};
use super::machine::RunEnv;
use super::run_state::RunState;
use super::variables;

pub(crate) async fn run_step<R: SnapshotRepository>(
    node: &StepNode,
    state: &Arc<RunState>,
    env: &RunEnv<R>,
) -> WorkflowEvent {
    let run_id = state.run_id();
    let input = variables::build_input(&node.bindings, &state.context());
    let slot = Arc::new(SuspendSlot::default());
    let ctx = StepContext::new(
        &node.id,
        input,
        Arc::clone(state),
        env.observer.clone(),
        Arc::clone(&slot),
    );

    tracing::debug!(run_id = %run_id, step_id = %node.id, "executing step handler");

    let handler = node.handler.clone();
    let outcome = AssertUnwindSafe(async move { handler.execute(ctx).await })
        .catch_unwind()
        .await;

    if let Some(request) = slot.close() {
        tracing::debug!(run_id = %run_id, step_id = %node.id, "step suspending");
        env.persist(state).await;
        return WorkflowEvent::Suspended {
            step_id: node.id.clone(),
            suspend_payload: request.payload,
            soft_output: request.soft_output,
        };
    }

    let error = match outcome {
        Ok(Ok(output)) => {
            return WorkflowEvent::StepSuccess {
                step_id: node.id.clone(),
                output,
            };
        }
        Ok(Err(err)) => err.to_string(),
        Err(panic) => format!("step handler panicked: {}", panic_message(panic.as_ref())),
    };

    let remaining = state.attempts(&node.id);
    if remaining > 0 {
        tracing::debug!(
            run_id = %run_id,
            step_id = %node.id,
            remaining,
            error = %error,
            "step failed; retrying after delay"
        );
        WorkflowEvent::StepWaiting {
            step_id: node.id.clone(),
        }
    } else {
        let failure = EngineError::StepExecutionFailure {
            step_id: node.id.clone(),
            message: error.clone(),
        };
        tracing::warn!(run_id = %run_id, error = %failure, "step failed");
        WorkflowEvent::StepFailed {
            step_id: node.id.clone(),
            error,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
