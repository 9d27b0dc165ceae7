//! Step handler contract.
//!
//! Handlers implement [`StepHandler`] (native async fn in trait). Because an
//! RPITIT trait cannot be a trait object, the graph stores handlers as
//! [`BoxStepHandler`], following the usual blanket-impl pattern:
//! 1. an object-safe `StepHandlerDyn` trait with boxed futures
//! 2. a blanket impl of `StepHandlerDyn` for every `T: StepHandler`
//! 3. `BoxStepHandler` wrapping `Arc<dyn StepHandlerDyn>` and delegating
//!
//! Closures are adapted with [`handler_fn`].

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use stepwise_types::event::WorkflowRunEvent;
use stepwise_types::workflow::StepResult;
use uuid::Uuid;

use super::observer::RunObserver;
use super::run_state::RunState;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Error returned by a step handler; feeds the step's retry policy.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StepError {
    pub fn msg(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }
}

// ---------------------------------------------------------------------------
// Suspension
// ---------------------------------------------------------------------------

/// A `suspend()` call captured while the handler was running.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SuspendRequest {
    pub payload: Option<Value>,
    pub soft_output: Option<Value>,
}

/// Slot through which `suspend()` reaches the owning actor.
///
/// Open while the handler runs; closed as soon as it returns.
#[derive(Debug, Default)]
pub(crate) struct SuspendSlot {
    inner: Mutex<SlotState>,
}

#[derive(Debug, Default)]
struct SlotState {
    closed: bool,
    request: Option<SuspendRequest>,
}

impl SuspendSlot {
    /// Store a request; returns `false` when the actor is no longer live.
    fn offer(&self, request: SuspendRequest) -> bool {
        match self.inner.lock() {
            Ok(mut slot) if !slot.closed => {
                slot.request = Some(request);
                true
            }
            _ => false,
        }
    }

    /// Close the slot and take whatever request was made.
    pub(crate) fn close(&self) -> Option<SuspendRequest> {
        match self.inner.lock() {
            Ok(mut slot) => {
                slot.closed = true;
                slot.request.take()
            }
            Err(poisoned) => {
                let mut slot = poisoned.into_inner();
                slot.closed = true;
                slot.request.take()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Everything a handler may touch while it runs.
#[derive(Clone)]
pub struct StepContext {
    run_id: Uuid,
    step_id: String,
    input_data: Value,
    state: Arc<RunState>,
    observer: RunObserver,
    slot: Arc<SuspendSlot>,
}

impl StepContext {
    pub(crate) fn new(
        step_id: &str,
        input_data: Value,
        state: Arc<RunState>,
        observer: RunObserver,
        slot: Arc<SuspendSlot>,
    ) -> Self {
        Self {
            run_id: state.run_id(),
            step_id: step_id.to_string(),
            input_data,
            state,
            observer,
            slot,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// Resolved bindings merged over the run's carried-over input.
    pub fn input_data(&self) -> &Value {
        &self.input_data
    }

    /// Trigger data for `"trigger"`, a prior step's successful output, or
    /// `None`.
    pub fn get_step_result(&self, step_id: &str) -> Option<Value> {
        self.state.step_output(step_id)
    }

    /// Forward a custom event to the run's observers.
    pub fn emit(&self, event: impl Into<String>, payload: Value) {
        self.observer.publish(WorkflowRunEvent::Custom {
            run_id: self.run_id,
            step_id: self.step_id.clone(),
            event: event.into(),
            payload,
        });
    }

    /// Ask the engine to park this step once the handler returns.
    ///
    /// Whatever the handler returns afterwards is discarded. Calls made after
    /// the handler has returned are logged and ignored.
    pub fn suspend(&self, payload: Option<Value>, soft_output: Option<Value>) {
        tracing::debug!(run_id = %self.run_id, step_id = %self.step_id, "step requested suspension");

        let request = SuspendRequest {
            payload: payload.clone(),
            soft_output: soft_output.clone(),
        };
        if !self.slot.offer(request) {
            tracing::warn!(
                run_id = %self.run_id,
                step_id = %self.step_id,
                "suspend() called after the step finished; ignoring"
            );
            return;
        }
        self.state.record(
            &self.step_id,
            StepResult::Suspended {
                suspend_payload: payload,
                output: soft_output,
            },
        );
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("run_id", &self.run_id)
            .field("step_id", &self.step_id)
            .field("input_data", &self.input_data)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Handler traits
// ---------------------------------------------------------------------------

/// Work performed by a step.
///
/// Returning `Ok(value)` records `Success { output: value }`; returning
/// `Err` is handled by the step's retry policy.
pub trait StepHandler: Send + Sync {
    fn execute(
        &self,
        ctx: StepContext,
    ) -> impl Future<Output = Result<Value, StepError>> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn execute_boxed(
        &self,
        ctx: StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + '_>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn execute_boxed(
        &self,
        ctx: StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + '_>> {
        Box::pin(self.execute(ctx))
    }
}

/// Type-erased, cheaply cloneable step handler.
#[derive(Clone)]
pub struct BoxStepHandler {
    inner: Arc<dyn StepHandlerDyn>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    pub async fn execute(&self, ctx: StepContext) -> Result<Value, StepError> {
        self.inner.execute_boxed(ctx).await
    }
}

impl std::fmt::Debug for BoxStepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxStepHandler")
    }
}

/// Handler backed by an async closure; see [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StepError>> + Send,
{
    fn execute(
        &self,
        ctx: StepContext,
    ) -> impl Future<Output = Result<Value, StepError>> + Send {
        (self.f)(ctx)
    }
}

/// Wrap an async closure as a step handler.
///
/// ```ignore
/// let double = handler_fn(|ctx: StepContext| async move {
///     let n = ctx.input_data()["n"].as_i64().unwrap_or(0);
///     Ok(serde_json::json!({ "n": n * 2 }))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StepError>> + Send,
{
    FnHandler { f }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context_for(step_id: &str, state: Arc<RunState>) -> (StepContext, Arc<SuspendSlot>, RunObserver) {
        let observer = RunObserver::new(8);
        let slot = Arc::new(SuspendSlot::default());
        let ctx = StepContext::new(step_id, json!({ "n": 2 }), state, observer.clone(), Arc::clone(&slot));
        (ctx, slot, observer)
    }

    #[tokio::test]
    async fn closure_handler_runs_through_box() {
        let handler = BoxStepHandler::new(handler_fn(|ctx: StepContext| async move {
            let n = ctx.input_data()["n"].as_i64().unwrap_or(0);
            Ok::<Value, StepError>(json!({ "n": n * 2 }))
        }));
        let state = Arc::new(RunState::new(Uuid::now_v7(), json!({})));
        let (ctx, _, _) = context_for("double", state);

        assert_eq!(handler.execute(ctx).await.unwrap(), json!({ "n": 4 }));
    }

    #[tokio::test]
    async fn suspend_is_captured_while_live() {
        let state = Arc::new(RunState::new(Uuid::now_v7(), json!({})));
        let (ctx, slot, _) = context_for("review", Arc::clone(&state));

        ctx.suspend(Some(json!({ "reason": "manual" })), None);
        let request = slot.close().unwrap();
        assert_eq!(request.payload, Some(json!({ "reason": "manual" })));
        assert!(matches!(
            state.step_result("review"),
            Some(StepResult::Suspended { .. })
        ));
    }

    #[tokio::test]
    async fn late_suspend_is_ignored() {
        let state = Arc::new(RunState::new(Uuid::now_v7(), json!({})));
        let (ctx, slot, _) = context_for("late", Arc::clone(&state));

        slot.close();
        ctx.suspend(None, None);
        assert!(slot.close().is_none());
        assert!(state.step_result("late").is_none());
    }

    #[tokio::test]
    async fn emit_reaches_observers() {
        let state = Arc::new(RunState::new(Uuid::now_v7(), json!({})));
        let (ctx, _, observer) = context_for("fetch", state);
        let mut rx = observer.subscribe();

        ctx.emit("progress", json!({ "pct": 50 }));
        match rx.recv().await.unwrap() {
            WorkflowRunEvent::Custom { step_id, event, payload, .. } => {
                assert_eq!(step_id, "fetch");
                assert_eq!(event, "progress");
                assert_eq!(payload, json!({ "pct": 50 }));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_step_result_reads_live_state() {
        let state = Arc::new(RunState::new(Uuid::now_v7(), json!({ "user": "ada" })));
        let (ctx, _, _) = context_for("b", Arc::clone(&state));
        assert_eq!(ctx.get_step_result("trigger"), Some(json!({ "user": "ada" })));
        assert_eq!(ctx.get_step_result("a"), None);

        state.record("a", StepResult::Success { output: json!(1) });
        assert_eq!(ctx.get_step_result("a"), Some(json!(1)));
    }

    #[test]
    fn step_error_from_anyhow() {
        let err: StepError = anyhow::anyhow!("upstream timeout").into();
        assert_eq!(err.to_string(), "upstream timeout");
        assert_eq!(StepError::msg("bad input").to_string(), "bad input");
    }
}
