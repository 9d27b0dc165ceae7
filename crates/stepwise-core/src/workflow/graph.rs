//! Step graph construction and validation.
//!
//! A committed workflow is flattened into an id-indexed table of
//! [`StepNode`]s plus one `next` pointer per chain position. Initial steps
//! start parallel regions; each region is a linear chain. Subscriber graphs
//! hang off a parent step id and run after that parent finishes.
//!
//! Validation happens once, at build time:
//! - step ids are unique across the main graph and every subscriber graph
//! - `trigger` is reserved
//! - chains are linear and every step is reachable from an initial step
//! - subscriber parents exist and subscriber registration is acyclic
//!   (checked with `petgraph::algo::toposort`)

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use stepwise_types::condition::Condition;
use stepwise_types::workflow::{RetryConfig, VariableBinding, TRIGGER_STEP_ID};

use super::condition::{ConditionContext, When, WhenOutcome};
use super::handler::{BoxStepHandler, StepHandler};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while committing a workflow graph.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("workflow graph has no steps")]
    Empty,

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("step id '{0}' is reserved")]
    ReservedStepId(String),

    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("step '{step_id}' has {count} successors; a chain allows at most one")]
    MultipleSuccessors { step_id: String, count: usize },

    #[error("step '{0}' has more than one predecessor")]
    MultiplePredecessors(String),

    #[error("step '{0}' is not reachable from any initial step")]
    Unreachable(String),

    #[error("subscriber graph registered for unknown step '{0}'")]
    UnknownSubscriberParent(String),

    #[error("more than one subscriber graph registered for step '{0}'")]
    DuplicateSubscriberGraph(String),

    #[error("subscriber cycle detected involving step '{0}'")]
    SubscriberCycle(String),
}

// ---------------------------------------------------------------------------
// StepNode
// ---------------------------------------------------------------------------

/// A step definition. Immutable once its workflow is built.
#[derive(Clone)]
pub struct StepNode {
    pub id: String,
    pub handler: BoxStepHandler,
    pub retry: Option<RetryConfig>,
    pub when: Option<When>,
    /// Input field name -> binding.
    pub bindings: BTreeMap<String, VariableBinding>,
    /// Suspend instead of failing when the retry budget runs out.
    pub snapshot_on_timeout: bool,
    /// Synthetic branch step: a `false` predicate always parks it in limbo.
    pub conditional: bool,
}

impl StepNode {
    pub fn new<H: StepHandler + 'static>(id: impl Into<String>, handler: H) -> Self {
        Self {
            id: id.into(),
            handler: BoxStepHandler::new(handler),
            retry: None,
            when: None,
            bindings: BTreeMap::new(),
            snapshot_on_timeout: false,
            conditional: false,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn when(mut self, when: When) -> Self {
        self.when = Some(when);
        self
    }

    pub fn when_query(self, condition: Condition) -> Self {
        self.when(When::Query(condition))
    }

    pub fn when_fn<F, Fut, O>(self, f: F) -> Self
    where
        F: Fn(ConditionContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = O> + Send + 'static,
        O: Into<WhenOutcome>,
    {
        self.when(When::function(f))
    }

    pub fn bind(mut self, field: impl Into<String>, binding: VariableBinding) -> Self {
        self.bindings.insert(field.into(), binding);
        self
    }

    pub fn snapshot_on_timeout(mut self, enabled: bool) -> Self {
        self.snapshot_on_timeout = enabled;
        self
    }

    pub fn conditional(mut self, enabled: bool) -> Self {
        self.conditional = enabled;
        self
    }
}

impl std::fmt::Debug for StepNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepNode")
            .field("id", &self.id)
            .field("retry", &self.retry)
            .field("when", &self.when)
            .field("bindings", &self.bindings)
            .field("snapshot_on_timeout", &self.snapshot_on_timeout)
            .field("conditional", &self.conditional)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// StepGraph
// ---------------------------------------------------------------------------

/// Flattened, validated step graph.
#[derive(Debug, Clone, Default)]
pub struct StepGraph {
    nodes: HashMap<String, Arc<StepNode>>,
    roots: Vec<String>,
    next: HashMap<String, String>,
}

impl StepGraph {
    pub fn builder() -> StepGraphBuilder {
        StepGraphBuilder::default()
    }

    /// Build from initial steps plus an edge list of `step id -> successors`.
    ///
    /// Each step may have at most one successor.
    pub fn from_parts(
        initial: Vec<StepNode>,
        edges: Vec<(String, Vec<StepNode>)>,
    ) -> Result<Self, GraphError> {
        let roots: Vec<String> = initial.iter().map(|n| n.id.clone()).collect();
        let mut nodes = initial;
        let mut next = Vec::new();
        for (from, successors) in edges {
            if successors.len() > 1 {
                return Err(GraphError::MultipleSuccessors {
                    step_id: from,
                    count: successors.len(),
                });
            }
            for node in successors {
                next.push((from.clone(), node.id.clone()));
                nodes.push(node);
            }
        }
        Self::assemble(nodes, roots, next)
    }

    fn assemble(
        nodes: Vec<StepNode>,
        roots: Vec<String>,
        next: Vec<(String, String)>,
    ) -> Result<Self, GraphError> {
        if nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut table: HashMap<String, Arc<StepNode>> = HashMap::with_capacity(nodes.len());
        for node in nodes {
            if node.id == TRIGGER_STEP_ID {
                return Err(GraphError::ReservedStepId(node.id));
            }
            if table.contains_key(&node.id) {
                return Err(GraphError::DuplicateStep(node.id));
            }
            table.insert(node.id.clone(), Arc::new(node));
        }

        let mut successors: HashMap<String, String> = HashMap::new();
        let mut has_predecessor: HashSet<String> = roots.iter().cloned().collect();
        for (from, to) in next {
            if !table.contains_key(&from) {
                return Err(GraphError::UnknownStep(from));
            }
            if !table.contains_key(&to) {
                return Err(GraphError::UnknownStep(to));
            }
            if successors.contains_key(&from) {
                return Err(GraphError::MultipleSuccessors {
                    step_id: from,
                    count: 2,
                });
            }
            if !has_predecessor.insert(to.clone()) {
                return Err(GraphError::MultiplePredecessors(to));
            }
            successors.insert(from, to);
        }

        let graph = Self {
            nodes: table,
            roots,
            next: successors,
        };

        let mut reached: HashSet<&str> = HashSet::new();
        for root in &graph.roots {
            reached.extend(graph.chain(root));
        }
        if let Some(orphan) = graph.nodes.keys().find(|id| !reached.contains(id.as_str())) {
            return Err(GraphError::Unreachable(orphan.clone()));
        }

        Ok(graph)
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn node(&self, step_id: &str) -> Option<&Arc<StepNode>> {
        self.nodes.get(step_id)
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.nodes.contains_key(step_id)
    }

    pub fn next_of(&self, step_id: &str) -> Option<&str> {
        self.next.get(step_id).map(String::as_str)
    }

    /// Step ids along the chain starting at `root`, in order.
    pub fn chain<'a>(&'a self, root: &'a str) -> Vec<&'a str> {
        let mut chain = Vec::new();
        let mut cursor = Some(root);
        while let Some(step_id) = cursor {
            if !self.nodes.contains_key(step_id) {
                break;
            }
            chain.push(step_id);
            cursor = self.next_of(step_id);
        }
        chain
    }

    /// The initial step whose chain contains `step_id`.
    pub fn region_of(&self, step_id: &str) -> Option<&str> {
        self.roots
            .iter()
            .map(String::as_str)
            .find(|root| self.chain(root).contains(&step_id))
    }

    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<StepNode>> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Incremental builder: `step` opens a new region, `then` extends the
/// current chain.
#[derive(Debug, Default)]
pub struct StepGraphBuilder {
    nodes: Vec<StepNode>,
    roots: Vec<String>,
    next: Vec<(String, String)>,
    tail: Option<String>,
}

impl StepGraphBuilder {
    pub fn step(mut self, node: StepNode) -> Self {
        self.roots.push(node.id.clone());
        self.tail = Some(node.id.clone());
        self.nodes.push(node);
        self
    }

    pub fn then(mut self, node: StepNode) -> Self {
        let Some(previous) = self.tail.take() else {
            return self.step(node);
        };
        self.next.push((previous, node.id.clone()));
        self.tail = Some(node.id.clone());
        self.nodes.push(node);
        self
    }

    pub fn build(self) -> Result<StepGraph, GraphError> {
        StepGraph::assemble(self.nodes, self.roots, self.next)
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Which graph of a workflow a step lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GraphRef {
    Main,
    /// Subscriber graph registered under the given parent step id.
    Subscribers(String),
}

/// A committed workflow: main graph, subscriber graphs and retry defaults.
#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    graph: StepGraph,
    subscribers: HashMap<String, StepGraph>,
    retry: Option<RetryConfig>,
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.into(),
            graph: StepGraph::builder(),
            subscribers: Vec::new(),
            retry: None,
        }
    }

    pub fn new(
        name: impl Into<String>,
        graph: StepGraph,
        subscribers: HashMap<String, StepGraph>,
        retry: Option<RetryConfig>,
    ) -> Result<Self, GraphError> {
        let workflow = Self {
            name: name.into(),
            graph,
            subscribers,
            retry,
        };
        workflow.validate()?;
        Ok(workflow)
    }

    fn validate(&self) -> Result<(), GraphError> {
        if self.graph.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for graph in std::iter::once(&self.graph).chain(self.subscribers.values()) {
            for step_id in graph.step_ids() {
                if !seen.insert(step_id) {
                    return Err(GraphError::DuplicateStep(step_id.to_string()));
                }
            }
        }

        if let Some(parent) = self.subscribers.keys().find(|p| !seen.contains(p.as_str())) {
            return Err(GraphError::UnknownSubscriberParent(parent.clone()));
        }

        // Chain edges plus parent -> subscriber-step edges must be acyclic.
        let mut dag = DiGraph::<&str, ()>::new();
        let index: HashMap<&str, _> = seen.iter().map(|id| (*id, dag.add_node(*id))).collect();
        for graph in std::iter::once(&self.graph).chain(self.subscribers.values()) {
            for (from, to) in &graph.next {
                dag.add_edge(index[from.as_str()], index[to.as_str()], ());
            }
        }
        for (parent, graph) in &self.subscribers {
            for step_id in graph.step_ids() {
                dag.add_edge(index[parent.as_str()], index[step_id], ());
            }
        }
        toposort(&dag, None).map_err(|cycle| {
            GraphError::SubscriberCycle(dag[cycle.node_id()].to_string())
        })?;

        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    pub fn retry(&self) -> Option<RetryConfig> {
        self.retry
    }

    pub fn subscribers_of(&self, parent: &str) -> Option<&StepGraph> {
        self.subscribers.get(parent)
    }

    pub fn has_subscribers(&self, step_id: &str) -> bool {
        self.subscribers
            .get(step_id)
            .is_some_and(|graph| !graph.is_empty())
    }

    pub fn graph_for(&self, graph: &GraphRef) -> Option<&StepGraph> {
        match graph {
            GraphRef::Main => Some(&self.graph),
            GraphRef::Subscribers(parent) => self.subscribers.get(parent),
        }
    }

    /// Which graph holds `step_id`.
    pub fn locate(&self, step_id: &str) -> Option<GraphRef> {
        if self.graph.contains(step_id) {
            return Some(GraphRef::Main);
        }
        self.subscribers
            .iter()
            .find(|(_, graph)| graph.contains(step_id))
            .map(|(parent, _)| GraphRef::Subscribers(parent.clone()))
    }

    /// The main graph followed by every subscriber graph.
    pub fn graphs(&self) -> impl Iterator<Item = (GraphRef, &StepGraph)> {
        std::iter::once((GraphRef::Main, &self.graph)).chain(
            self.subscribers
                .iter()
                .map(|(parent, graph)| (GraphRef::Subscribers(parent.clone()), graph)),
        )
    }

    /// How many subscriber hops separate `graph` from the main graph.
    ///
    /// Parent links are acyclic (checked in `validate`), so the walk ends.
    pub fn nesting_depth(&self, graph: &GraphRef) -> u32 {
        let mut depth = 0;
        let mut current = graph.clone();
        while let GraphRef::Subscribers(parent) = current {
            depth += 1;
            match self.locate(&parent) {
                Some(next) => current = next,
                None => break,
            }
        }
        depth
    }

    /// Every step of every graph.
    pub fn all_nodes(&self) -> impl Iterator<Item = &Arc<StepNode>> {
        std::iter::once(&self.graph)
            .chain(self.subscribers.values())
            .flat_map(StepGraph::nodes)
    }

    /// Retry policy for a step: its own, else the workflow's, else `fallback`.
    pub fn effective_retry(&self, node: &StepNode, fallback: RetryConfig) -> RetryConfig {
        node.retry.or(self.retry).unwrap_or(fallback)
    }
}

/// Fluent workflow builder.
///
/// ```ignore
/// let workflow = Workflow::builder("onboarding")
///     .step(fetch)
///     .then(score)
///     .step(audit)
///     .after("score", StepGraph::builder().step(notify))
///     .build()?;
/// ```
#[derive(Debug)]
pub struct WorkflowBuilder {
    name: String,
    graph: StepGraphBuilder,
    subscribers: Vec<(String, StepGraphBuilder)>,
    retry: Option<RetryConfig>,
}

impl WorkflowBuilder {
    pub fn step(mut self, node: StepNode) -> Self {
        self.graph = self.graph.step(node);
        self
    }

    pub fn then(mut self, node: StepNode) -> Self {
        self.graph = self.graph.then(node);
        self
    }

    /// Register a sub-graph that runs after `parent` finishes.
    pub fn after(mut self, parent: impl Into<String>, graph: StepGraphBuilder) -> Self {
        self.subscribers.push((parent.into(), graph));
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Result<Workflow, GraphError> {
        let graph = self.graph.build()?;
        let mut subscribers = HashMap::new();
        for (parent, builder) in self.subscribers {
            if subscribers.contains_key(&parent) {
                return Err(GraphError::DuplicateSubscriberGraph(parent));
            }
            subscribers.insert(parent, builder.build()?);
        }
        Workflow::new(self.name, graph, subscribers, self.retry)
    }
}
