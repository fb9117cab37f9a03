//! A small workflow engine: named steps over a shared [`GraphState`], joined
//! by direct or conditional edges, with bounded iterations and steps.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_MAX_ITERATIONS, DEFAULT_STEP_LIMIT};
use crate::llm::LlmError;
use crate::state::GraphState;
use crate::tools::ToolError;

pub mod routes;

/// Pseudo-node that starts a run. `add_edge(START, x)` sets the entry point.
pub const START: &str = "__start__";
/// Pseudo-node that finishes a run.
pub const END: &str = "__end__";

#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("node '{0}' is defined more than once")]
    DuplicateNode(String),

    #[error("node name '{0}' is reserved")]
    ReservedName(String),

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("no entry point set")]
    MissingEntry,

    #[error("node '{0}' already has an outgoing edge")]
    ConflictingEdges(String),

    #[error("node '{0}' has no outgoing edge")]
    DeadEnd(String),

    #[error("conditional edge from '{0}' has no branches")]
    EmptyBranches(String),

    #[error("router for '{step}' returned '{label}', which has no branch")]
    UnknownBranch { step: String, label: String },

    #[error("run exceeded the limit of {limit} steps")]
    StepLimitExceeded { limit: u32 },

    #[error("step '{step}' pushed iterations to {iterations}, above the limit of {limit}")]
    IterationLimitExceeded { step: String, iterations: u32, limit: u32 },

    #[error("step '{step}' moved iterations backwards from {before} to {after}")]
    IterationRegressed { step: String, before: u32, after: u32 },

    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: StepError,
    },
}

impl GraphError {
    /// The completion-service error behind a failed step, if that is what failed.
    pub fn llm_error(&self) -> Option<&LlmError> {
        match self {
            GraphError::StepFailed { source: StepError::Llm(e), .. } => Some(e),
            _ => None,
        }
    }
}

/// One named unit of work in a workflow.
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(&self, state: &mut GraphState) -> Result<(), StepError>;
}

/// Adapts a synchronous closure into a [`Step`].
pub struct FnStep<F>(F);

pub fn step_fn<F>(f: F) -> FnStep<F>
where
    F: Fn(&mut GraphState) -> Result<(), StepError> + Send + Sync,
{
    FnStep(f)
}

#[async_trait]
impl<F> Step for FnStep<F>
where
    F: Fn(&mut GraphState) -> Result<(), StepError> + Send + Sync,
{
    async fn run(&self, state: &mut GraphState) -> Result<(), StepError> {
        (self.0)(state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Node(String),
    End,
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        if name == END { Target::End } else { Target::Node(name.to_string()) }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Node(name) => f.write_str(name),
            Target::End => f.write_str(END),
        }
    }
}

pub type Router = Arc<dyn Fn(&GraphState) -> String + Send + Sync>;

#[derive(Clone)]
enum Edge {
    Direct(Target),
    Conditional { router: Router, branches: HashMap<String, Target> },
}

impl Edge {
    fn targets(&self) -> Vec<&Target> {
        match self {
            Edge::Direct(target) => vec![target],
            Edge::Conditional { branches, .. } => branches.values().collect(),
        }
    }
}

/// Collects nodes and edges; [`WorkflowBuilder::compile`] checks the graph.
pub struct WorkflowBuilder {
    nodes: HashMap<String, Arc<dyn Step>>,
    edges: HashMap<String, Edge>,
    entry: Option<String>,
    max_iterations: u32,
    step_limit: u32,
    problem: Option<GraphError>,
}

impl Default for WorkflowBuilder {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            entry: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            step_limit: DEFAULT_STEP_LIMIT,
            problem: None,
        }
    }
}

impl WorkflowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, problem: GraphError) {
        if self.problem.is_none() {
            self.problem = Some(problem);
        }
    }

    pub fn add_node(mut self, name: &str, step: impl Step + 'static) -> Self {
        if name == START || name == END {
            self.record(GraphError::ReservedName(name.to_string()));
        } else if self.nodes.insert(name.to_string(), Arc::new(step)).is_some() {
            self.record(GraphError::DuplicateNode(name.to_string()));
        }
        self
    }

    fn add_rule(&mut self, from: &str, edge: Edge) {
        if self.edges.contains_key(from) {
            self.record(GraphError::ConflictingEdges(from.to_string()));
        } else {
            self.edges.insert(from.to_string(), edge);
        }
    }

    pub fn add_edge(mut self, from: &str, to: &str) -> Self {
        if from == START {
            return self.set_entry_point(to);
        }
        self.add_rule(from, Edge::Direct(Target::from(to)));
        self
    }

    /// Route out of `from` by the label `router` returns.
    pub fn add_conditional_edges<R>(
        mut self,
        from: &str,
        router: R,
        branches: &[(&str, &str)],
    ) -> Self
    where
        R: Fn(&GraphState) -> String + Send + Sync + 'static,
    {
        if branches.is_empty() {
            self.record(GraphError::EmptyBranches(from.to_string()));
            return self;
        }
        let branches = branches
            .iter()
            .map(|(label, to)| (label.to_string(), Target::from(*to)))
            .collect();
        self.add_rule(from, Edge::Conditional { router: Arc::new(router), branches });
        self
    }

    pub fn set_entry_point(mut self, name: &str) -> Self {
        self.entry = Some(name.to_string());
        self
    }

    pub fn max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn step_limit(mut self, limit: u32) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn compile(self) -> Result<Workflow, GraphError> {
        if let Some(problem) = self.problem {
            return Err(problem);
        }

        let entry = self.entry.ok_or(GraphError::MissingEntry)?;
        if !self.nodes.contains_key(&entry) {
            return Err(GraphError::UnknownNode(entry));
        }

        for (from, edge) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(GraphError::UnknownNode(from.clone()));
            }
            for target in edge.targets() {
                if let Target::Node(name) = target {
                    if !self.nodes.contains_key(name) {
                        return Err(GraphError::UnknownNode(name.clone()));
                    }
                }
            }
        }

        let mut names: Vec<&String> = self.nodes.keys().collect();
        names.sort();
        if let Some(dead) = names.into_iter().find(|name| !self.edges.contains_key(*name)) {
            return Err(GraphError::DeadEnd(dead.clone()));
        }

        Ok(Workflow {
            nodes: self.nodes,
            edges: self.edges,
            entry,
            max_iterations: self.max_iterations,
            step_limit: self.step_limit,
        })
    }
}

/// Final state of a completed run.
#[derive(Debug)]
pub struct RunOutcome {
    pub state: GraphState,
    pub steps_executed: u32,
}

impl RunOutcome {
    /// Whether the run finished without the error flag raised.
    pub fn succeeded(&self) -> bool {
        !self.state.error
    }
}

/// A validated, runnable workflow.
pub struct Workflow {
    nodes: HashMap<String, Arc<dyn Step>>,
    edges: HashMap<String, Edge>,
    entry: String,
    max_iterations: u32,
    step_limit: u32,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut nodes: Vec<&String> = self.nodes.keys().collect();
        nodes.sort();
        f.debug_struct("Workflow")
            .field("entry", &self.entry)
            .field("nodes", &nodes)
            .field("max_iterations", &self.max_iterations)
            .field("step_limit", &self.step_limit)
            .finish()
    }
}

impl Workflow {
    pub fn builder() -> WorkflowBuilder {
        WorkflowBuilder::new()
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Run from the entry point until a route reaches [`END`].
    pub async fn invoke(&self, mut state: GraphState) -> Result<RunOutcome, GraphError> {
        let mut current = self.entry.clone();
        let mut executed: u32 = 0;
        info!(run_id = %state.run_id, entry = %current, "workflow started");

        loop {
            if executed >= self.step_limit {
                warn!(run_id = %state.run_id, limit = self.step_limit, "step limit reached");
                return Err(GraphError::StepLimitExceeded { limit: self.step_limit });
            }

            let step = self
                .nodes
                .get(&current)
                .ok_or_else(|| GraphError::UnknownNode(current.clone()))?;
            let before = state.iterations();
            debug!(run_id = %state.run_id, step = %current, iterations = before, "running step");

            step.run(&mut state)
                .await
                .map_err(|source| GraphError::StepFailed { step: current.clone(), source })?;
            executed += 1;
            state.steps.push(current.clone());

            let after = state.iterations();
            if after < before {
                return Err(GraphError::IterationRegressed { step: current, before, after });
            }
            if after > self.max_iterations {
                return Err(GraphError::IterationLimitExceeded {
                    step: current,
                    iterations: after,
                    limit: self.max_iterations,
                });
            }

            let next = match self.edges.get(&current) {
                Some(Edge::Direct(target)) => target.clone(),
                Some(Edge::Conditional { router, branches }) => {
                    let label = router(&state);
                    match branches.get(&label) {
                        Some(target) => {
                            info!(
                                run_id = %state.run_id,
                                step = %current,
                                %label,
                                next = %target,
                                "routed"
                            );
                            target.clone()
                        }
                        None => return Err(GraphError::UnknownBranch { step: current, label }),
                    }
                }
                None => return Err(GraphError::DeadEnd(current)),
            };

            match next {
                Target::End => {
                    info!(
                        run_id = %state.run_id,
                        steps = executed,
                        iterations = state.iterations(),
                        error = state.error,
                        "workflow finished"
                    );
                    return Ok(RunOutcome { state, steps_executed: executed });
                }
                Target::Node(name) => current = name,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;

    fn noop() -> impl Step {
        step_fn(|_| Ok(()))
    }

    fn bump() -> impl Step {
        step_fn(|state| {
            state.bump_iteration();
            Ok(())
        })
    }

    #[tokio::test]
    async fn linear_workflow_runs_in_order() {
        let workflow = Workflow::builder()
            .add_node("a", noop())
            .add_node("b", noop())
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("b", END)
            .compile()
            .unwrap();
        assert_eq!(workflow.entry(), "a");
        assert_eq!(workflow.max_iterations(), DEFAULT_MAX_ITERATIONS);

        let outcome = workflow.invoke(GraphState::new()).await.unwrap();
        assert_eq!(outcome.state.steps, vec!["a", "b"]);
        assert_eq!(outcome.steps_executed, 2);
        assert!(outcome.succeeded());
    }

    #[tokio::test]
    async fn conditional_edge_picks_branch_from_state() {
        // retrieve -> grade -> (search -> generate | generate) -> end
        let workflow = Workflow::builder()
            .add_node("retrieve", noop())
            .add_node(
                "grade",
                step_fn(|state| {
                    state.error = true;
                    Ok(())
                }),
            )
            .add_node("web_search", noop())
            .add_node("generate", noop())
            .set_entry_point("retrieve")
            .add_edge("retrieve", "grade")
            .add_conditional_edges(
                "grade",
                |state| if state.error { "search".to_string() } else { "generate".to_string() },
                &[("search", "web_search"), ("generate", "generate")],
            )
            .add_edge("web_search", "generate")
            .add_edge("generate", END)
            .compile()
            .unwrap();

        let outcome = workflow.invoke(GraphState::new()).await.unwrap();
        assert_eq!(outcome.state.steps, vec!["retrieve", "grade", "web_search", "generate"]);
    }

    #[tokio::test]
    async fn retry_loop_stops_at_iteration_bound() {
        let workflow = Workflow::builder()
            .add_node(
                "generate",
                step_fn(|state| {
                    state.bump_iteration();
                    state.push(Role::Assistant, "attempt");
                    Ok(())
                }),
            )
            .add_node(
                "check",
                step_fn(|state| {
                    state.error = true;
                    Ok(())
                }),
            )
            .set_entry_point("generate")
            .add_edge("generate", "check")
            .add_conditional_edges(
                "check",
                routes::decide_to_finish(3),
                &[
                    (routes::END_LABEL, END),
                    (routes::GENERATE, "generate"),
                    (routes::REFLECT, "generate"),
                ],
            )
            .max_iterations(3)
            .compile()
            .unwrap();

        let outcome = workflow.invoke(GraphState::new()).await.unwrap();
        assert_eq!(outcome.state.iterations(), 3);
        assert_eq!(outcome.steps_executed, 6);
        assert!(!outcome.succeeded());
    }

    #[tokio::test]
    async fn iteration_bound_is_enforced_by_engine() {
        let workflow = Workflow::builder()
            .add_node("spin", bump())
            .set_entry_point("spin")
            .add_edge("spin", "spin")
            .max_iterations(2)
            .compile()
            .unwrap();

        let err = workflow.invoke(GraphState::new()).await.unwrap_err();
        assert!(matches!(err, GraphError::IterationLimitExceeded { iterations: 3, limit: 2, .. }));
    }

    #[tokio::test]
    async fn step_limit_stops_runaway_loops() {
        let workflow = Workflow::builder()
            .add_node("a", noop())
            .add_node("b", noop())
            .set_entry_point("a")
            .add_edge("a", "b")
            .add_edge("b", "a")
            .step_limit(5)
            .compile()
            .unwrap();

        let err = workflow.invoke(GraphState::new()).await.unwrap_err();
        assert!(matches!(err, GraphError::StepLimitExceeded { limit: 5 }));
    }

    #[tokio::test]
    async fn replacing_state_cannot_rewind_iterations() {
        let workflow = Workflow::builder()
            .add_node("bump", bump())
            .add_node(
                "reset",
                step_fn(|state| {
                    *state = GraphState::new();
                    Ok(())
                }),
            )
            .set_entry_point("bump")
            .add_edge("bump", "reset")
            .add_edge("reset", END)
            .compile()
            .unwrap();

        let err = workflow.invoke(GraphState::new()).await.unwrap_err();
        assert!(matches!(err, GraphError::IterationRegressed { before: 1, after: 0, .. }));
    }

    #[tokio::test]
    async fn unknown_router_label_is_an_error() {
        let workflow = Workflow::builder()
            .add_node("a", noop())
            .set_entry_point("a")
            .add_conditional_edges("a", |_| "elsewhere".to_string(), &[("end", END)])
            .compile()
            .unwrap();

        let err = workflow.invoke(GraphState::new()).await.unwrap_err();
        assert!(matches!(err, GraphError::UnknownBranch { label, .. } if label == "elsewhere"));
    }

    #[tokio::test]
    async fn step_failure_names_the_step() {
        let workflow = Workflow::builder()
            .add_node("boom", step_fn(|_| Err(StepError::Failed("kaboom".into()))))
            .set_entry_point("boom")
            .add_edge("boom", END)
            .compile()
            .unwrap();

        let err = workflow.invoke(GraphState::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "step 'boom' failed: kaboom");
        assert!(err.llm_error().is_none());
    }

    #[test]
    fn compile_rejects_invalid_graphs() {
        let missing_entry = Workflow::builder().add_node("a", noop()).add_edge("a", END).compile();
        assert!(matches!(missing_entry, Err(GraphError::MissingEntry)));

        let unknown_target = Workflow::builder()
            .add_node("a", noop())
            .set_entry_point("a")
            .add_edge("a", "ghost")
            .compile();
        assert!(matches!(unknown_target, Err(GraphError::UnknownNode(n)) if n == "ghost"));

        let conflicting = Workflow::builder()
            .add_node("generate", noop())
            .add_node("reflect", noop())
            .add_node("check", noop())
            .set_entry_point("generate")
            .add_edge("generate", "reflect")
            .add_edge("generate", "check")
            .compile();
        assert!(matches!(conflicting, Err(GraphError::ConflictingEdges(n)) if n == "generate"));

        let dead_end = Workflow::builder()
            .add_node("a", noop())
            .add_node("b", noop())
            .set_entry_point("a")
            .add_edge("a", "b")
            .compile();
        assert!(matches!(dead_end, Err(GraphError::DeadEnd(n)) if n == "b"));

        let duplicate = Workflow::builder().add_node("a", noop()).add_node("a", noop()).compile();
        assert!(matches!(duplicate, Err(GraphError::DuplicateNode(n)) if n == "a"));

        let reserved = Workflow::builder().add_node(END, noop()).compile();
        assert!(matches!(reserved, Err(GraphError::ReservedName(_))));

        let no_branches = Workflow::builder()
            .add_node("a", noop())
            .set_entry_point("a")
            .add_conditional_edges("a", |_| String::new(), &[])
            .compile();
        assert!(matches!(no_branches, Err(GraphError::EmptyBranches(_))));
    }
}
