//! Condition evaluator.
//!
//! A step's `when` clause is either declarative ([`Condition`], evaluated by
//! [`evaluate`]) or an async predicate returning a [`WhenOutcome`]. The two
//! forms route a negative answer differently: a declarative `false` fails the
//! step, while a predicate `false` skips it (when it has subscribers) or parks
//! it in limbo.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use stepwise_types::condition::Condition;
use stepwise_types::workflow::{StepResult, WorkflowContext, TRIGGER_STEP_ID};
use uuid::Uuid;

use super::EngineError;
use super::graph::StepNode;
use super::path;
use super::query;

// ---------------------------------------------------------------------------
// Function form
// ---------------------------------------------------------------------------

/// Answer of a function-form condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenOutcome {
    Met,
    NotMet,
    /// Treated as `NotMet`.
    Abort,
    /// Treat the step as already done.
    ContinueFailed,
    /// Park the region indefinitely.
    Limbo,
    /// Hold in `waiting` and ask again after the step's delay.
    Wait,
}

impl From<bool> for WhenOutcome {
    fn from(met: bool) -> Self {
        if met { WhenOutcome::Met } else { WhenOutcome::NotMet }
    }
}

/// Read-only view handed to function-form conditions.
#[derive(Debug, Clone)]
pub struct ConditionContext {
    pub run_id: Uuid,
    pub context: WorkflowContext,
}

type PredicateFuture = Pin<Box<dyn Future<Output = WhenOutcome> + Send>>;

/// Type-erased async predicate.
#[derive(Clone)]
pub struct BoxPredicate {
    inner: Arc<dyn Fn(ConditionContext) -> PredicateFuture + Send + Sync>,
}

impl BoxPredicate {
    pub fn new<F, Fut, O>(f: F) -> Self
    where
        F: Fn(ConditionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        O: Into<WhenOutcome>,
    {
        Self {
            inner: Arc::new(move |ctx| {
                let fut = f(ctx);
                Box::pin(async move { fut.await.into() })
            }),
        }
    }

    pub async fn call(&self, ctx: ConditionContext) -> WhenOutcome {
        (self.inner)(ctx).await
    }
}

/// A step's `when` clause.
#[derive(Clone)]
pub enum When {
    Query(Condition),
    Function(BoxPredicate),
}

impl When {
    pub fn function<F, Fut, O>(f: F) -> Self
    where
        F: Fn(ConditionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        O: Into<WhenOutcome>,
    {
        When::Function(BoxPredicate::new(f))
    }
}

impl std::fmt::Debug for When {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            When::Query(condition) => f.debug_tuple("Query").field(condition).finish(),
            When::Function(_) => f.write_str("Function(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

/// Result of checking a step's conditions before it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionVerdict {
    Met,
    SkipToCompleted,
    Skipped,
    Limbo,
    Failed(String),
    Suspended,
    Waiting,
}

/// Decide whether `node` may run.
///
/// The retry budget is checked first: a budget below zero (only reachable
/// through repeated `Wait` answers) suspends the step when it snapshots on
/// timeout and fails it otherwise.
pub async fn check(
    node: &StepNode,
    has_subscribers: bool,
    context: WorkflowContext,
    run_id: Uuid,
) -> ConditionVerdict {
    let remaining = context.attempts.get(&node.id).copied().unwrap_or(0);
    if remaining < 0 {
        if node.snapshot_on_timeout {
            return ConditionVerdict::Suspended;
        }
        return ConditionVerdict::Failed(
            EngineError::ConditionFailure {
                step_id: node.id.clone(),
                reason: "retry attempts exhausted".to_string(),
            }
            .to_string(),
        );
    }

    match &node.when {
        None => ConditionVerdict::Met,
        Some(When::Query(condition)) => {
            if evaluate(condition, &context) {
                ConditionVerdict::Met
            } else {
                ConditionVerdict::Failed(
                    EngineError::ConditionFailure {
                        step_id: node.id.clone(),
                        reason: "condition check failed".to_string(),
                    }
                    .to_string(),
                )
            }
        }
        Some(When::Function(predicate)) => {
            let outcome = predicate.call(ConditionContext { run_id, context }).await;
            match outcome {
                WhenOutcome::Met => ConditionVerdict::Met,
                WhenOutcome::ContinueFailed => ConditionVerdict::SkipToCompleted,
                WhenOutcome::Limbo => ConditionVerdict::Limbo,
                WhenOutcome::Wait => ConditionVerdict::Waiting,
                WhenOutcome::NotMet | WhenOutcome::Abort => {
                    if node.conditional {
                        ConditionVerdict::Limbo
                    } else if has_subscribers {
                        ConditionVerdict::Skipped
                    } else {
                        ConditionVerdict::Limbo
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Declarative evaluation
// ---------------------------------------------------------------------------

/// Evaluate a declarative condition against the run context.
///
/// Any lookup miss (unknown step, or a step that has not succeeded) makes
/// that leaf false.
pub fn evaluate(condition: &Condition, context: &WorkflowContext) -> bool {
    match condition {
        Condition::Ref { step, path, query } => {
            let Some(source) = source_of(step, context) else {
                return false;
            };
            // Only successful steps get here, so a missing status reads as success.
            if step != TRIGGER_STEP_ID
                && path == "status"
                && source.get("status").is_none()
            {
                let success = serde_json::Value::String("success".to_string());
                return query::matches(query, Some(&success));
            }
            query::matches(query, path::lookup(source, path))
        }
        Condition::And(items) => items.iter().all(|c| evaluate(c, context)),
        Condition::Or(items) => items.is_empty() || items.iter().any(|c| evaluate(c, context)),
        Condition::Not(inner) => !evaluate(inner, context),
    }
}

fn source_of<'a>(step: &str, context: &'a WorkflowContext) -> Option<&'a serde_json::Value> {
    if step == TRIGGER_STEP_ID {
        return Some(&context.trigger_data);
    }
    match context.steps.get(step) {
        Some(StepResult::Success { output }) => Some(output),
        _ => None,
    }
}
