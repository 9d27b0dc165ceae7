//! Run coordinator and engine facade.
//!
//! A `WorkflowInstance` owns one run: its id, its observer channel and the
//! persistence collaborator. `start` runs every region to a settled state
//! and resolves with the aggregated results; `resume` rebuilds the run from
//! its snapshot and re-enters one suspended step.
//!
//! `WorkflowEngine` is the stateless entry point implementing
//! [`WorkflowExecutor`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures_util::Stream;
use serde_json::Value;
use stepwise_types::config::EngineConfig;
use stepwise_types::event::WorkflowRunEvent;
use stepwise_types::workflow::{RunResolution, Snapshot, StepResult, StepState};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::repository::snapshot::SnapshotRepository;

use super::ExecutorError;
use super::graph::{GraphRef, StepGraph, Workflow};
use super::machine::{Machine, RegionOutcome, RegionStart, RunEnv};
use super::observer::{RunObserver, event_stream};
use super::run_state::RunState;

// ---------------------------------------------------------------------------
// WorkflowExecutor trait
// ---------------------------------------------------------------------------

/// Trait for workflow execution engines.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
pub trait WorkflowExecutor: Send + Sync {
    /// Run a workflow from its initial steps.
    fn execute(
        &self,
        workflow: Arc<Workflow>,
        trigger_data: Value,
    ) -> impl Future<Output = Result<RunResolution, ExecutorError>> + Send;

    /// Resume a suspended step of a previous run.
    fn resume(
        &self,
        workflow: Arc<Workflow>,
        run_id: Uuid,
        step_id: &str,
        resume_data: Value,
    ) -> impl Future<Output = Result<RunResolution, ExecutorError>> + Send;
}

// ---------------------------------------------------------------------------
// WorkflowInstance
// ---------------------------------------------------------------------------

/// One run of a workflow.
pub struct WorkflowInstance<R: SnapshotRepository> {
    workflow: Arc<Workflow>,
    repo: Arc<R>,
    config: Arc<EngineConfig>,
    observer: RunObserver,
    run_id: Uuid,
    started: AtomicBool,
}

impl<R: SnapshotRepository + 'static> WorkflowInstance<R> {
    pub fn new(workflow: Arc<Workflow>, repo: Arc<R>, config: Arc<EngineConfig>) -> Self {
        Self::with_run_id(workflow, repo, config, Uuid::now_v7())
    }

    /// Handle for an existing run, typically to resume it.
    pub fn with_run_id(
        workflow: Arc<Workflow>,
        repo: Arc<R>,
        config: Arc<EngineConfig>,
        run_id: Uuid,
    ) -> Self {
        let observer = RunObserver::new(config.event_capacity);
        Self {
            workflow,
            repo,
            config,
            observer,
            run_id,
            started: AtomicBool::new(false),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Subscribe to this run's events.
    pub fn watch(&self) -> broadcast::Receiver<WorkflowRunEvent> {
        self.observer.subscribe()
    }

    /// Events as a stream that ends after the next `RunSettled`.
    pub fn watch_stream(&self) -> impl Stream<Item = WorkflowRunEvent> + Send + 'static {
        event_stream(self.observer.subscribe())
    }

    /// Latest persisted snapshot of this run.
    pub async fn snapshot(&self) -> Result<Option<Snapshot>, ExecutorError> {
        Ok(self
            .repo
            .load_snapshot(self.workflow.name(), &self.run_id)
            .await?)
    }

    /// Step ids parked in `Suspended` according to the latest snapshot.
    pub async fn suspended_steps(&self) -> Result<Vec<String>, ExecutorError> {
        Ok(self
            .snapshot()
            .await?
            .map(|snapshot| {
                snapshot
                    .suspended_steps()
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Run the workflow from its initial steps.
    ///
    /// Resolves once every region is settled; step failures are reported in
    /// the resolution's `results`, not as an error.
    pub async fn start(&self, trigger_data: Value) -> Result<RunResolution, ExecutorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(self.reject(ExecutorError::AlreadyStarted(self.run_id)));
        }
        if self.workflow.graph().is_empty() {
            return Err(self.reject(ExecutorError::EmptyGraph(
                self.workflow.name().to_string(),
            )));
        }

        let state = Arc::new(RunState::new(self.run_id, trigger_data));
        self.init_attempts(&state);

        tracing::info!(run_id = %self.run_id, workflow = %self.workflow.name(), "workflow run started");
        self.observer.publish(WorkflowRunEvent::RunStarted {
            run_id: self.run_id,
            workflow_name: self.workflow.name().to_string(),
            resumed: false,
        });

        let env = self.env();
        let starts = self
            .workflow
            .graph()
            .roots()
            .iter()
            .map(|root| RegionStart::Fresh { root: root.clone() })
            .collect();
        let machine = Arc::new(Machine::new(
            Arc::clone(&env),
            GraphRef::Main,
            Arc::clone(&state),
            0,
        ));
        let outcomes = machine.run(starts).await;

        Ok(self.settle(&env, &state, outcomes).await)
    }

    /// Resume a suspended step with extra input.
    ///
    /// `resume_data` is merged over the snapshot's `input_data` (its keys
    /// win) and the step re-enters `pending`. Regions that are not being
    /// resumed are reported as they were left.
    pub async fn resume(
        &self,
        step_id: &str,
        resume_data: Value,
    ) -> Result<RunResolution, ExecutorError> {
        let snapshot = self
            .repo
            .load_snapshot(self.workflow.name(), &self.run_id)
            .await
            .map_err(|e| self.reject(e.into()))?
            .ok_or_else(|| {
                self.reject(ExecutorError::SnapshotNotFound {
                    workflow_name: self.workflow.name().to_string(),
                    run_id: self.run_id,
                })
            })?;

        let location = self
            .workflow
            .locate(step_id)
            .ok_or_else(|| self.reject(ExecutorError::UnknownStep(step_id.to_string())))?;

        match snapshot.context.steps.get(step_id) {
            Some(StepResult::Suspended { .. }) => {}
            other => {
                return Err(self.reject(ExecutorError::StepNotSuspended {
                    step_id: step_id.to_string(),
                    status: other.map(StepResult::status),
                }));
            }
        }

        let Snapshot {
            machine_state,
            mut context,
            ..
        } = snapshot;
        context.merge_input(resume_data);

        let state = Arc::new(RunState::from_context(
            self.run_id,
            context,
            machine_state.clone(),
        ));
        self.init_attempts(&state);

        tracing::info!(
            run_id = %self.run_id,
            workflow = %self.workflow.name(),
            step_id,
            "workflow run resumed"
        );
        self.observer.publish(WorkflowRunEvent::RunStarted {
            run_id: self.run_id,
            workflow_name: self.workflow.name().to_string(),
            resumed: true,
        });

        let Some(graph) = self.workflow.graph_for(&location) else {
            return Err(self.reject(ExecutorError::UnknownStep(step_id.to_string())));
        };
        let Some(root) = graph.region_of(step_id) else {
            return Err(self.reject(ExecutorError::UnknownStep(step_id.to_string())));
        };

        let mut starts = vec![RegionStart::Resume {
            root: root.to_string(),
            step_id: step_id.to_string(),
        }];
        starts.extend(
            graph
                .roots()
                .iter()
                .filter(|r| r.as_str() != root)
                .filter_map(|r| settled_outcome(graph, r, &machine_state))
                .map(|outcome| RegionStart::Settled {
                    root: outcome.root,
                    step_id: outcome.step_id,
                    state: outcome.state,
                }),
        );

        // Every other graph stays where the snapshot left it. Graphs whose
        // parent never ran have no machine state and report nothing.
        let mut outcomes: Vec<RegionOutcome> = self
            .workflow
            .graphs()
            .filter(|(graph_ref, _)| *graph_ref != location)
            .flat_map(|(_, other)| {
                other
                    .roots()
                    .iter()
                    .filter_map(|r| settled_outcome(other, r, &machine_state))
                    .collect::<Vec<_>>()
            })
            .collect();

        let depth = self.workflow.nesting_depth(&location);
        let env = self.env();
        let machine = Arc::new(Machine::new(
            Arc::clone(&env),
            location,
            Arc::clone(&state),
            depth,
        ));
        outcomes.extend(machine.run(starts).await);

        Ok(self.settle(&env, &state, outcomes).await)
    }

    fn env(&self) -> Arc<RunEnv<R>> {
        Arc::new(RunEnv {
            workflow: Arc::clone(&self.workflow),
            repo: Arc::clone(&self.repo),
            config: Arc::clone(&self.config),
            observer: self.observer.clone(),
        })
    }

    /// Give every step its retry budget unless the snapshot carried one.
    fn init_attempts(&self, state: &RunState) {
        for node in self.workflow.all_nodes() {
            let retry = self
                .workflow
                .effective_retry(node, self.config.default_retry);
            state.init_attempts(&node.id, retry.attempts);
        }
    }

    /// Persist the final snapshot and publish the resolution.
    async fn settle(
        &self,
        env: &RunEnv<R>,
        state: &RunState,
        outcomes: Vec<RegionOutcome>,
    ) -> RunResolution {
        env.persist(state).await;

        let active_paths: BTreeMap<String, StepState> = outcomes
            .into_iter()
            .map(|outcome| (outcome.step_id, outcome.state))
            .collect();
        let resolution = RunResolution {
            run_id: self.run_id,
            results: state.context().steps,
            active_paths,
            timestamp: Utc::now().timestamp_millis(),
        };

        tracing::info!(
            run_id = %self.run_id,
            workflow = %self.workflow.name(),
            steps = resolution.results.len(),
            suspended = resolution.is_suspended(),
            "workflow run settled"
        );
        self.observer.publish(WorkflowRunEvent::RunSettled {
            resolution: resolution.clone(),
        });
        resolution
    }

    fn reject(&self, err: ExecutorError) -> ExecutorError {
        tracing::error!(
            run_id = %self.run_id,
            workflow = %self.workflow.name(),
            error = %err,
            "run could not be initialized"
        );
        err
    }
}

/// Where a region stopped in a previous invocation: the last step of its
/// chain that has a recorded machine state.
fn settled_outcome(
    graph: &StepGraph,
    root: &str,
    machine_state: &BTreeMap<String, StepState>,
) -> Option<RegionOutcome> {
    graph
        .chain(root)
        .into_iter()
        .filter_map(|step_id| machine_state.get(step_id).map(|state| (step_id, *state)))
        .last()
        .map(|(step_id, state)| RegionOutcome {
            root: root.to_string(),
            step_id: step_id.to_string(),
            state,
        })
}

impl<R: SnapshotRepository> std::fmt::Debug for WorkflowInstance<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowInstance")
            .field("workflow", &self.workflow.name())
            .field("run_id", &self.run_id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Entry point holding the persistence collaborator and engine config.
///
/// Generic over `R: SnapshotRepository` for storage flexibility.
pub struct WorkflowEngine<R: SnapshotRepository> {
    repo: Arc<R>,
    config: Arc<EngineConfig>,
}

impl<R: SnapshotRepository + 'static> WorkflowEngine<R> {
    pub fn new(repo: Arc<R>, config: EngineConfig) -> Self {
        Self {
            repo,
            config: Arc::new(config),
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// New run handle; subscribe with `watch` before calling `start`.
    pub fn create_run(&self, workflow: Arc<Workflow>) -> WorkflowInstance<R> {
        WorkflowInstance::new(workflow, Arc::clone(&self.repo), Arc::clone(&self.config))
    }

    /// Handle for an existing run.
    pub fn run(&self, workflow: Arc<Workflow>, run_id: Uuid) -> WorkflowInstance<R> {
        WorkflowInstance::with_run_id(
            workflow,
            Arc::clone(&self.repo),
            Arc::clone(&self.config),
            run_id,
        )
    }
}

impl<R: SnapshotRepository + 'static> WorkflowExecutor for WorkflowEngine<R> {
    async fn execute(
        &self,
        workflow: Arc<Workflow>,
        trigger_data: Value,
    ) -> Result<RunResolution, ExecutorError> {
        self.create_run(workflow).start(trigger_data).await
    }

    async fn resume(
        &self,
        workflow: Arc<Workflow>,
        run_id: Uuid,
        step_id: &str,
        resume_data: Value,
    ) -> Result<RunResolution, ExecutorError> {
        self.run(workflow, run_id).resume(step_id, resume_data).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures_util::StreamExt;
    use serde_json::json;
    use stepwise_types::condition::Condition;
    use stepwise_types::error::RepositoryError;
    use stepwise_types::workflow::{RetryConfig, StepStatus, VariableBinding};

    use crate::repository::snapshot::InMemorySnapshotStore;
    use crate::workflow::condition::WhenOutcome;
    use crate::workflow::graph::StepNode;
    use crate::workflow::handler::{StepContext, StepError, handler_fn};

    fn engine() -> WorkflowEngine<InMemorySnapshotStore> {
        let config = EngineConfig {
            default_retry: RetryConfig::new(0, 10),
            ..EngineConfig::default()
        };
        WorkflowEngine::new(Arc::new(InMemorySnapshotStore::new()), config)
    }

    fn constant(id: &str, output: Value) -> StepNode {
        StepNode::new(
            id,
            handler_fn(move |_ctx: StepContext| {
                let output = output.clone();
                async move { Ok::<Value, StepError>(output) }
            }),
        )
    }

    fn counting_failures(
        id: &str,
        failures: usize,
        output: Value,
    ) -> (StepNode, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let node = StepNode::new(
            id,
            handler_fn(move |_ctx: StepContext| {
                let counter = Arc::clone(&counter);
                let output = output.clone();
                async move {
                    let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if call <= failures {
                        Err(StepError::msg(format!("attempt {call} failed")))
                    } else {
                        Ok(output)
                    }
                }
            }),
        );
        (node, calls)
    }

    fn drain(rx: &mut broadcast::Receiver<WorkflowRunEvent>) -> Vec<WorkflowRunEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn retry_exhaustion_fails_after_three_invocations() {
        let (flaky, calls) = counting_failures("flaky", usize::MAX, json!(null));
        let workflow = Arc::new(
            Workflow::builder("retry")
                .step(flaky.with_retry(RetryConfig::new(2, 10)))
                .build()
                .unwrap(),
        );

        let resolution = engine().execute(workflow, json!({})).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(resolution.status_of("flaky"), Some(StepStatus::Failed));
        let error = resolution.results["flaky"].error().unwrap();
        assert!(error.contains("attempt 3 failed"));
        assert_eq!(resolution.active_paths.get("flaky"), Some(&StepState::Failed));
    }

    #[tokio::test]
    async fn eventual_success_after_two_waits() {
        let (flaky, calls) = counting_failures("flaky", 2, json!({ "x": 1 }));
        let workflow = Arc::new(
            Workflow::builder("eventual")
                .step(flaky.with_retry(RetryConfig::new(2, 10)))
                .build()
                .unwrap(),
        );
        let engine = engine();
        let run = engine.create_run(workflow);
        let mut rx = run.watch();

        let resolution = run.start(json!({})).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(resolution.status_of("flaky"), Some(StepStatus::Success));
        assert_eq!(resolution.output_of("flaky"), Some(&json!({ "x": 1 })));

        let waits = drain(&mut rx)
            .into_iter()
            .filter(|event| {
                matches!(
                    event,
                    WorkflowRunEvent::StateUpdate { step_id, state: StepState::Waiting, .. }
                        if step_id == "flaky"
                )
            })
            .count();
        assert_eq!(waits, 2);
    }

    #[tokio::test]
    async fn suspend_and_resume_round_trip() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let review = StepNode::new(
            "review",
            handler_fn(move |ctx: StepContext| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if ctx.input_data()["approved"] == json!(true) {
                        Ok::<Value, StepError>(json!({ "approved": true }))
                    } else {
                        ctx.suspend(Some(json!({ "reason": "manual" })), None);
                        Ok(Value::Null)
                    }
                }
            }),
        );
        let workflow = Arc::new(
            Workflow::builder("approval")
                .step(constant("fetch", json!({ "doc": 1 })))
                .then(review)
                .then(constant("publish", json!("done")))
                .build()
                .unwrap(),
        );
        let engine = engine();

        let first = engine.create_run(Arc::clone(&workflow));
        let run_id = first.run_id();
        let resolution = first.start(json!({})).await.unwrap();

        assert!(resolution.is_suspended());
        assert_eq!(resolution.status_of("review"), Some(StepStatus::Suspended));
        assert_eq!(
            resolution.results["review"],
            StepResult::Suspended {
                suspend_payload: Some(json!({ "reason": "manual" })),
                output: None,
            }
        );
        assert_eq!(resolution.status_of("publish"), None);
        assert_eq!(first.suspended_steps().await.unwrap(), vec!["review".to_string()]);

        let resumed = engine
            .resume(Arc::clone(&workflow), run_id, "review", json!({ "approved": true }))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(resumed.run_id, run_id);
        assert_eq!(resumed.status_of("review"), Some(StepStatus::Success));
        assert_eq!(resumed.status_of("fetch"), Some(StepStatus::Success));
        assert_eq!(resumed.output_of("publish"), Some(&json!("done")));
        assert!(!resumed.is_suspended());

        let snapshot = first.snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.context.input_data["approved"], json!(true));
        assert!(snapshot.suspended_steps().is_empty());
    }

    #[tokio::test]
    async fn parallel_regions_are_independent() {
        let slow = StepNode::new(
            "a",
            handler_fn(|_ctx: StepContext| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<Value, StepError>(json!("a"))
            }),
        );
        let workflow = Arc::new(
            Workflow::builder("parallel")
                .step(slow)
                .step(constant("b", json!("b")))
                .build()
                .unwrap(),
        );

        let resolution = engine().execute(workflow, json!({})).await.unwrap();

        assert_eq!(resolution.output_of("a"), Some(&json!("a")));
        assert_eq!(resolution.output_of("b"), Some(&json!("b")));
        assert_eq!(resolution.active_paths.len(), 2);
        assert!(resolution.active_paths.values().all(|s| *s == StepState::Completed));
    }

    fn algebra_workflow(gt: i64) -> Arc<Workflow> {
        let condition = Condition::from_value(&json!({
            "and": [{ "stepA.x": { "$gt": gt } }],
            "or": [{ "stepA.x": { "$lt": 10 } }],
            "not": { "stepA.x": { "$eq": 0 } }
        }))
        .unwrap();
        Arc::new(
            Workflow::builder("algebra")
                .step(constant("stepA", json!({ "x": 5 })))
                .then(constant("stepB", json!("ran")).when_query(condition))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn declarative_condition_gates_step() {
        let met = engine().execute(algebra_workflow(0), json!({})).await.unwrap();
        assert_eq!(met.output_of("stepB"), Some(&json!("ran")));

        let failed = engine().execute(algebra_workflow(10), json!({})).await.unwrap();
        assert_eq!(failed.status_of("stepB"), Some(StepStatus::Failed));
        assert!(failed.results["stepB"].error().unwrap().contains("condition check failed"));
        assert_eq!(failed.active_paths.get("stepB"), Some(&StepState::Failed));
    }

    #[tokio::test]
    async fn false_predicate_with_subscribers_skips_and_continues() {
        let workflow = Arc::new(
            Workflow::builder("skip")
                .step(constant("gate", json!(1)).when_fn(|_ctx| async { false }))
                .then(constant("after", json!("after")))
                .after("gate", StepGraph::builder().step(constant("notify", json!("sent"))))
                .build()
                .unwrap(),
        );

        let resolution = engine().execute(workflow, json!({})).await.unwrap();

        assert_eq!(resolution.status_of("gate"), Some(StepStatus::Skipped));
        assert_eq!(resolution.output_of("notify"), Some(&json!("sent")));
        assert_eq!(resolution.output_of("after"), Some(&json!("after")));
        assert_eq!(resolution.active_paths.get("after"), Some(&StepState::Completed));
    }

    #[tokio::test]
    async fn false_predicate_without_subscribers_parks_in_limbo() {
        let workflow = Arc::new(
            Workflow::builder("limbo")
                .step(constant("gate", json!(1)).when_fn(|_ctx| async { false }))
                .then(constant("after", json!("after")))
                .step(constant("other", json!("other")))
                .build()
                .unwrap(),
        );

        let resolution = engine().execute(workflow, json!({})).await.unwrap();

        assert_eq!(resolution.status_of("gate"), Some(StepStatus::Skipped));
        assert_eq!(resolution.active_paths.get("gate"), Some(&StepState::Limbo));
        assert_eq!(resolution.status_of("after"), None);
        assert_eq!(resolution.output_of("other"), Some(&json!("other")));
    }

    #[tokio::test]
    async fn snapshots_are_upserted_per_run() {
        let engine = engine();
        let workflow = Arc::new(
            Workflow::builder("chain")
                .step(constant("a", json!(1)))
                .then(constant("b", json!(2)))
                .then(constant("c", json!(3)))
                .build()
                .unwrap(),
        );

        let run = engine.create_run(Arc::clone(&workflow));
        let resolution = run.start(json!({})).await.unwrap();

        let store = engine.repository();
        assert_eq!(store.len(), 1);
        assert_eq!(store.list_runs("chain").await.unwrap(), vec![resolution.run_id]);
        let snapshot = run.snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.context.steps.len(), 3);
        assert_eq!(snapshot.machine_state.get("c"), Some(&StepState::Completed));

        engine.execute(workflow, json!({})).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn bindings_flow_between_steps() {
        let sum = StepNode::new(
            "sum",
            handler_fn(|ctx: StepContext| async move {
                let a = ctx.input_data()["a"].as_i64().unwrap_or(0);
                let b = ctx.input_data()["b"].as_i64().unwrap_or(0);
                Ok::<Value, StepError>(json!(a + b))
            }),
        )
        .bind("a", VariableBinding::trigger("a"))
        .bind("b", VariableBinding::step("double", "value"));
        let workflow = Arc::new(
            Workflow::builder("bindings")
                .step(constant("double", json!({ "value": 20 })))
                .then(sum)
                .build()
                .unwrap(),
        );

        let resolution = engine().execute(workflow, json!({ "a": 1 })).await.unwrap();
        assert_eq!(resolution.output_of("sum"), Some(&json!(21)));
    }

    #[tokio::test]
    async fn subscriber_failures_do_not_fail_parent_chain() {
        let broken = StepNode::new(
            "broken",
            handler_fn(|_ctx: StepContext| async { Err::<Value, _>(StepError::msg("nope")) }),
        );
        let workflow = Arc::new(
            Workflow::builder("subs")
                .step(constant("parent", json!(1)))
                .then(constant("next", json!(2)))
                .after(
                    "parent",
                    StepGraph::builder()
                        .step(constant("sibling", json!("ok")))
                        .step(broken),
                )
                .build()
                .unwrap(),
        );

        let resolution = engine().execute(workflow, json!({})).await.unwrap();

        assert_eq!(resolution.output_of("sibling"), Some(&json!("ok")));
        assert_eq!(resolution.status_of("broken"), Some(StepStatus::Failed));
        assert_eq!(resolution.output_of("next"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn subscribers_see_parent_output() {
        let echo = StepNode::new(
            "echo",
            handler_fn(|ctx: StepContext| async move {
                Ok::<Value, StepError>(ctx.get_step_result("parent").unwrap_or(Value::Null))
            }),
        );
        let workflow = Arc::new(
            Workflow::builder("subs")
                .step(constant("parent", json!({ "n": 7 })))
                .after("parent", StepGraph::builder().step(echo))
                .build()
                .unwrap(),
        );

        let resolution = engine().execute(workflow, json!({})).await.unwrap();
        assert_eq!(resolution.output_of("echo"), Some(&json!({ "n": 7 })));
    }

    #[tokio::test]
    async fn resume_inside_subscriber_graph() {
        let approve = StepNode::new(
            "approve",
            handler_fn(|ctx: StepContext| async move {
                if ctx.input_data()["ok"] == json!(true) {
                    return Ok::<Value, StepError>(json!("approved"));
                }
                ctx.suspend(None, Some(json!("draft")));
                Ok(Value::Null)
            }),
        );
        let workflow = Arc::new(
            Workflow::builder("nested")
                .step(constant("parent", json!(1)))
                .then(constant("tail", json!(2)))
                .after("parent", StepGraph::builder().step(approve))
                .build()
                .unwrap(),
        );
        let engine = engine();

        let run = engine.create_run(Arc::clone(&workflow));
        let first = run.start(json!({})).await.unwrap();
        assert!(first.is_suspended());
        assert_eq!(first.status_of("approve"), Some(StepStatus::Suspended));
        assert_eq!(first.active_paths.get("approve"), Some(&StepState::Suspended));
        assert_eq!(first.output_of("tail"), Some(&json!(2)));
        assert_eq!(
            first.results["approve"],
            StepResult::Suspended { suspend_payload: None, output: Some(json!("draft")) }
        );

        let resumed = engine
            .resume(workflow, run.run_id(), "approve", json!({ "ok": true }))
            .await
            .unwrap();
        assert_eq!(resumed.output_of("approve"), Some(&json!("approved")));
        assert_eq!(resumed.active_paths.get("approve"), Some(&StepState::Completed));
        assert_eq!(resumed.active_paths.get("tail"), Some(&StepState::Completed));
    }

    #[tokio::test]
    async fn resume_rejections() {
        let engine = engine();
        let workflow = Arc::new(
            Workflow::builder("plain")
                .step(constant("a", json!(1)))
                .build()
                .unwrap(),
        );

        let missing = engine
            .resume(Arc::clone(&workflow), Uuid::now_v7(), "a", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(missing, ExecutorError::SnapshotNotFound { .. }));

        let resolution = engine.execute(Arc::clone(&workflow), json!({})).await.unwrap();
        let not_suspended = engine
            .resume(Arc::clone(&workflow), resolution.run_id, "a", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            not_suspended,
            ExecutorError::StepNotSuspended { status: Some(StepStatus::Success), .. }
        ));

        let unknown = engine
            .resume(workflow, resolution.run_id, "ghost", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(unknown, ExecutorError::UnknownStep(_)));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let engine = engine();
        let workflow = Arc::new(Workflow::builder("once").step(constant("a", json!(1))).build().unwrap());
        let run = engine.create_run(workflow);

        run.start(json!({})).await.unwrap();
        assert!(matches!(
            run.start(json!({})).await,
            Err(ExecutorError::AlreadyStarted(_))
        ));
    }

    #[tokio::test]
    async fn wait_sentinel_exhausts_budget() {
        let workflow = Arc::new(
            Workflow::builder("waiting")
                .step(
                    constant("poll", json!(1))
                        .with_retry(RetryConfig::new(1, 5))
                        .when_fn(|_ctx| async { WhenOutcome::Wait }),
                )
                .step(
                    constant("timeout", json!(1))
                        .with_retry(RetryConfig::new(0, 5))
                        .snapshot_on_timeout(true)
                        .when_fn(|_ctx| async { WhenOutcome::Wait }),
                )
                .build()
                .unwrap(),
        );

        let resolution = engine().execute(workflow, json!({})).await.unwrap();

        assert_eq!(resolution.status_of("poll"), Some(StepStatus::Failed));
        assert!(resolution.results["poll"].error().unwrap().contains("exhausted"));
        assert_eq!(resolution.active_paths.get("timeout"), Some(&StepState::Suspended));
    }

    #[tokio::test]
    async fn suspended_subscriber_shows_in_active_paths() {
        let approve = StepNode::new(
            "approve",
            handler_fn(|ctx: StepContext| async move {
                ctx.suspend(Some(json!({ "reason": "manual" })), None);
                Ok::<Value, StepError>(Value::Null)
            }),
        );
        let workflow = Arc::new(
            Workflow::builder("gated")
                .step(constant("parent", json!(1)))
                .after(
                    "parent",
                    StepGraph::builder()
                        .step(approve)
                        .step(constant("audit", json!("logged"))),
                )
                .build()
                .unwrap(),
        );

        let resolution = engine().execute(workflow, json!({})).await.unwrap();

        assert!(resolution.is_suspended());
        assert_eq!(resolution.status_of("approve"), Some(StepStatus::Suspended));
        assert_eq!(resolution.active_paths.get("approve"), Some(&StepState::Suspended));
        assert_eq!(resolution.active_paths.get("audit"), Some(&StepState::Completed));
        assert_eq!(resolution.active_paths.get("parent"), Some(&StepState::Completed));
    }

    #[tokio::test]
    async fn condition_suspension_restores_retry_budget() {
        let ready = Arc::new(AtomicBool::new(false));
        let checks = Arc::new(AtomicUsize::new(0));
        let (flag, counter) = (Arc::clone(&ready), Arc::clone(&checks));
        let workflow = Arc::new(
            Workflow::builder("timeout")
                .step(
                    constant("timeout", json!("done"))
                        .with_retry(RetryConfig::new(2, 5))
                        .snapshot_on_timeout(true)
                        .when_fn(move |_ctx| {
                            let flag = Arc::clone(&flag);
                            let counter = Arc::clone(&counter);
                            async move {
                                counter.fetch_add(1, Ordering::SeqCst);
                                if flag.load(Ordering::SeqCst) {
                                    WhenOutcome::Met
                                } else {
                                    WhenOutcome::Wait
                                }
                            }
                        }),
                )
                .build()
                .unwrap(),
        );
        let engine = engine();

        let run = engine.create_run(Arc::clone(&workflow));
        let first = run.start(json!({})).await.unwrap();
        assert_eq!(first.active_paths.get("timeout"), Some(&StepState::Suspended));
        // Two retries plus the initial check, then the exhausted budget suspends.
        assert_eq!(checks.load(Ordering::SeqCst), 3);

        let snapshot = run.snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.context.attempts.get("timeout"), Some(&2));
        assert_eq!(snapshot.machine_state.get("timeout"), Some(&StepState::Suspended));

        ready.store(true, Ordering::SeqCst);
        let resumed = engine
            .resume(workflow, run.run_id(), "timeout", json!({}))
            .await
            .unwrap();
        assert_eq!(resumed.status_of("timeout"), Some(StepStatus::Success));
        assert_eq!(resumed.output_of("timeout"), Some(&json!("done")));
        assert_eq!(resumed.active_paths.get("timeout"), Some(&StepState::Completed));
    }

    #[tokio::test]
    async fn resume_keeps_nesting_depth_of_deep_subscribers() {
        let config = EngineConfig {
            default_retry: RetryConfig::new(0, 10),
            max_subscriber_depth: 2,
            ..EngineConfig::default()
        };
        let engine = WorkflowEngine::new(Arc::new(InMemorySnapshotStore::new()), config);
        let sign = StepNode::new(
            "sign",
            handler_fn(|ctx: StepContext| async move {
                if ctx.input_data()["signed"] == json!(true) {
                    return Ok::<Value, StepError>(json!("signed"));
                }
                ctx.suspend(None, None);
                Ok(Value::Null)
            }),
        );
        let workflow = Arc::new(
            Workflow::builder("deep")
                .step(constant("order", json!(1)))
                .after("order", StepGraph::builder().step(constant("invoice", json!(2))))
                .after("invoice", StepGraph::builder().step(sign))
                .after("sign", StepGraph::builder().step(constant("archive", json!(3))))
                .build()
                .unwrap(),
        );

        let run = engine.create_run(Arc::clone(&workflow));
        let first = run.start(json!({})).await.unwrap();
        assert_eq!(first.active_paths.get("sign"), Some(&StepState::Suspended));

        let resumed = engine
            .resume(workflow, run.run_id(), "sign", json!({ "signed": true }))
            .await
            .unwrap();

        // "sign" runs two levels down, so its own subscribers hit the limit.
        assert_eq!(resumed.output_of("sign"), Some(&json!("signed")));
        assert_eq!(resumed.status_of("archive"), None);
        assert_eq!(resumed.active_paths.get("sign"), Some(&StepState::Completed));
        assert_eq!(resumed.active_paths.get("invoice"), Some(&StepState::Completed));
        assert_eq!(resumed.active_paths.get("order"), Some(&StepState::Completed));
    }

    #[tokio::test]
    async fn watch_stream_ends_with_resolution() {
        let engine = engine();
        let workflow = Arc::new(Workflow::builder("watched").step(constant("a", json!(1))).build().unwrap());
        let run = engine.create_run(workflow);
        let stream = run.watch_stream();

        run.start(json!({})).await.unwrap();
        let events: Vec<_> = stream.collect().await;

        assert!(matches!(events.first(), Some(WorkflowRunEvent::RunStarted { resumed: false, .. })));
        assert!(matches!(events.last(), Some(WorkflowRunEvent::RunSettled { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            WorkflowRunEvent::StateUpdate { state: StepState::Completed, .. }
        )));
    }

    #[tokio::test]
    async fn emitted_events_reach_watchers() {
        let engine = engine();
        let chatty = StepNode::new(
            "chatty",
            handler_fn(|ctx: StepContext| async move {
                ctx.emit("progress", json!({ "pct": 50 }));
                Ok::<Value, StepError>(Value::Null)
            }),
        );
        let run = engine.create_run(Arc::new(Workflow::builder("emit").step(chatty).build().unwrap()));
        let mut rx = run.watch();

        run.start(json!({})).await.unwrap();
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            WorkflowRunEvent::Custom { event, .. } if event == "progress"
        )));
    }

    // -----------------------------------------------------------------------
    // Persistence failures are swallowed
    // -----------------------------------------------------------------------

    struct FailingStore;

    impl SnapshotRepository for FailingStore {
        async fn persist_snapshot(
            &self,
            _workflow_name: &str,
            _run_id: &Uuid,
            _snapshot: &Snapshot,
        ) -> Result<(), RepositoryError> {
            Err(RepositoryError::Connection)
        }

        async fn load_snapshot(
            &self,
            _workflow_name: &str,
            _run_id: &Uuid,
        ) -> Result<Option<Snapshot>, RepositoryError> {
            Err(RepositoryError::Connection)
        }

        async fn list_runs(&self, _workflow_name: &str) -> Result<Vec<Uuid>, RepositoryError> {
            Ok(Vec::new())
        }

        async fn delete_snapshot(
            &self,
            _workflow_name: &str,
            _run_id: &Uuid,
        ) -> Result<bool, RepositoryError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn persistence_failures_do_not_fail_the_run() {
        let engine = WorkflowEngine::new(Arc::new(FailingStore), EngineConfig::default());
        let workflow = Arc::new(Workflow::builder("flaky-db").step(constant("a", json!(1))).build().unwrap());

        let resolution = engine.execute(Arc::clone(&workflow), json!({})).await.unwrap();
        assert_eq!(resolution.output_of("a"), Some(&json!(1)));

        let err = engine
            .resume(workflow, resolution.run_id, "a", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Repository(RepositoryError::Connection)));
    }
}
