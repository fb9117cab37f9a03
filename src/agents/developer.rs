use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::graph::routes::{self, decide_to_finish};
use crate::graph::{END, RunOutcome, Step, StepError, Workflow};
use crate::llm::{ChatMessage, CompletionClient, Role};
use crate::state::{Generation, GraphState, RetryStrategy};

use super::checker::{ArtifactChecker, CheckVerdict};
use super::{Agent, AgentError};

const PLAN: &str = "plan";
const GENERATE: &str = "generate";
const CHECK: &str = "check_code";
const REFLECT: &str = "reflect";

const RETRY_INSTRUCTION: &str =
    "Now, try again. Respond with the JSON object (prefix, imports, code) only:";

/// A coding request for the developer workflow.
#[derive(Debug, Clone)]
pub struct DevTask {
    pub prompt: String,
    /// Reference material (documentation, existing code) the model should rely on
    pub context: Option<String>,
}

fn system_prompt(context: Option<&str>) -> String {
    let mut prompt = String::from(
        "You are a coding assistant. Ensure any code you provide can be executed with all \
         required imports and variables defined.\n\
         Answer with ONLY a JSON object of this form, no markdown and no commentary:\n\
         {\"prefix\": \"description of the solution\", \"imports\": \"import statements\", \
         \"code\": \"code body without imports\"}",
    );
    if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
        prompt.push_str("\n\nHere is the reference material for this task:\n ------- \n");
        prompt.push_str(context);
        prompt.push_str("\n ------- \n");
    }
    prompt
}

struct PlanStep {
    client: Arc<dyn CompletionClient>,
    system_prompt: String,
}

#[async_trait]
impl Step for PlanStep {
    async fn run(&self, state: &mut GraphState) -> Result<(), StepError> {
        info!("---PLANNING SOLUTION---");
        let mut messages = state.transcript(Some(&self.system_prompt));
        messages.push(ChatMessage::user(
            "Before writing any code, outline a short numbered plan for solving this. \
             Plain text, no JSON.",
        ));
        let plan = self.client.complete(&messages).await?;
        state.push(Role::Assistant, format!("Plan:\n{}", plan.trim()));
        Ok(())
    }
}

struct GenerateStep {
    client: Arc<dyn CompletionClient>,
    system_prompt: String,
}

#[async_trait]
impl Step for GenerateStep {
    async fn run(&self, state: &mut GraphState) -> Result<(), StepError> {
        info!(iteration = state.iterations() + 1, "---GENERATING CODE SOLUTION---");

        // routed back here after a failed check
        if state.error {
            state.push(Role::User, RETRY_INSTRUCTION);
        }

        let raw = self.client.complete(&state.transcript(Some(&self.system_prompt))).await?;
        let generation = Generation::parse(&raw);
        state.push(Role::Assistant, generation.summary());
        state.generation = Some(generation);
        state.bump_iteration();
        Ok(())
    }
}

struct CheckStep {
    checker: Arc<dyn ArtifactChecker>,
}

#[async_trait]
impl Step for CheckStep {
    async fn run(&self, state: &mut GraphState) -> Result<(), StepError> {
        info!("---CHECKING CODE---");
        let verdict = match &state.generation {
            Some(generation) => self.checker.check(generation).await?,
            None => CheckVerdict::Fail("the check: no solution was generated".to_string()),
        };

        match verdict {
            CheckVerdict::Pass => {
                info!("---NO CODE TEST FAILURES---");
                state.error = false;
            }
            CheckVerdict::Fail(reason) => {
                info!(%reason, "---CODE CHECK: FAILED---");
                state.push(Role::User, format!("Your solution failed {}", reason));
                state.error = true;
            }
        }
        Ok(())
    }
}

struct ReflectStep {
    client: Arc<dyn CompletionClient>,
    system_prompt: String,
}

#[async_trait]
impl Step for ReflectStep {
    async fn run(&self, state: &mut GraphState) -> Result<(), StepError> {
        info!("---REFLECTING ON ERROR---");
        let mut messages = state.transcript(Some(&self.system_prompt));
        messages.push(ChatMessage::user(
            "Reflect on the failure above: what went wrong and how should the next attempt fix it? \
             Plain text, do not write the solution yet.",
        ));
        let reflections = self.client.complete(&messages).await?;
        state.push(
            Role::Assistant,
            format!("Here are reflections on the error: {}", reflections.trim()),
        );
        Ok(())
    }
}

/// Plans, generates code, checks it, and retries with reflection until the
/// check passes or the iteration budget runs out.
///
/// plan → generate → check_code → { end | reflect → generate | generate }
#[derive(Clone)]
pub struct DeveloperAgent {
    client: Arc<dyn CompletionClient>,
    checker: Arc<dyn ArtifactChecker>,
    max_iterations: u32,
    step_limit: u32,
    retry: RetryStrategy,
}

impl DeveloperAgent {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        checker: Arc<dyn ArtifactChecker>,
        max_iterations: u32,
    ) -> Self {
        Self {
            client,
            checker,
            max_iterations,
            step_limit: crate::config::DEFAULT_STEP_LIMIT,
            retry: RetryStrategy::Reflect,
        }
    }

    pub fn with_retry(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_step_limit(mut self, step_limit: u32) -> Self {
        self.step_limit = step_limit;
        self
    }

    /// Never below the steps the retry loop can take: plan, then a generate
    /// and check per iteration with a reflect between retries.
    fn effective_step_limit(&self) -> u32 {
        let needed = self.max_iterations.saturating_mul(3).saturating_add(1);
        self.step_limit.max(needed)
    }

    pub fn workflow(&self, task: &DevTask) -> Result<Workflow, AgentError> {
        let system_prompt = system_prompt(task.context.as_deref());
        let workflow = Workflow::builder()
            .add_node(
                PLAN,
                PlanStep { client: self.client.clone(), system_prompt: system_prompt.clone() },
            )
            .add_node(
                GENERATE,
                GenerateStep { client: self.client.clone(), system_prompt: system_prompt.clone() },
            )
            .add_node(CHECK, CheckStep { checker: self.checker.clone() })
            .add_node(REFLECT, ReflectStep { client: self.client.clone(), system_prompt })
            .set_entry_point(PLAN)
            .add_edge(PLAN, GENERATE)
            .add_edge(GENERATE, CHECK)
            .add_conditional_edges(
                CHECK,
                decide_to_finish(self.max_iterations),
                &[
                    (routes::END_LABEL, END),
                    (routes::REFLECT, REFLECT),
                    (routes::GENERATE, GENERATE),
                ],
            )
            .add_edge(REFLECT, GENERATE)
            .max_iterations(self.max_iterations)
            .step_limit(self.effective_step_limit())
            .compile()?;
        Ok(workflow)
    }
}

#[async_trait]
impl Agent for DeveloperAgent {
    type Input = DevTask;
    type Output = RunOutcome;

    async fn execute(&self, task: &Self::Input) -> Result<Self::Output, AgentError> {
        if task.prompt.trim().is_empty() {
            return Err(AgentError::Unexpected("prompt is required".to_string()));
        }
        let workflow = self.workflow(task)?;

        let mut state = GraphState::with_user_message(task.prompt.trim());
        state.retry = self.retry;
        info!(
            run_id = %state.run_id,
            model = self.client.model(),
            max_iterations = self.max_iterations,
            "DeveloperAgent: starting"
        );

        let outcome = workflow.invoke(state).await?;
        info!(
            run_id = %outcome.state.run_id,
            passed = outcome.succeeded(),
            iterations = outcome.state.iterations(),
            "DeveloperAgent: finished"
        );
        Ok(outcome)
    }
}
