use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tracing::{info, warn};

use crate::graph::routes::{self, has_tool_calls};
use crate::graph::{END, RunOutcome, Step, StepError, Workflow};
use crate::llm::{CompletionClient, Role};
use crate::state::{Generation, GraphState, Turn};
use crate::tools::{ToolCallParser, ToolOutput, ToolRegistry};

use super::{Agent, AgentError};

const RESPOND: &str = "respond";
const TOOLS: &str = "tools";

const BASE_PROMPT: &str = "You are Goblin, a helpful AI assistant. Answer concisely.";

/// Called with each streamed chunk as it arrives.
pub type ChunkHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct AskInput {
    pub question: String,
    /// Earlier turns of the same conversation
    pub history: Vec<Turn>,
}

impl AskInput {
    pub fn new(question: impl Into<String>) -> Self {
        Self { question: question.into(), history: Vec::new() }
    }
}

struct RespondStep {
    client: Arc<dyn CompletionClient>,
    parser: ToolCallParser,
    system_prompt: String,
    on_chunk: Option<ChunkHandler>,
}

#[async_trait]
impl Step for RespondStep {
    async fn run(&self, state: &mut GraphState) -> Result<(), StepError> {
        let mut stream = self.client.stream(&state.transcript(Some(&self.system_prompt))).await?;
        let mut reply = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if let Some(handler) = &self.on_chunk {
                handler(&chunk);
            }
            reply.push_str(&chunk);
        }

        state.bump_iteration();
        info!(iteration = state.iterations(), chars = reply.len(), "assistant replied");
        state.generation = Some(Generation::text(self.parser.strip(&reply)));
        state.push(Role::Assistant, reply);
        Ok(())
    }
}

struct ToolsStep {
    tools: Arc<ToolRegistry>,
    parser: ToolCallParser,
}

#[async_trait]
impl Step for ToolsStep {
    async fn run(&self, state: &mut GraphState) -> Result<(), StepError> {
        let Some(turn) = state.last_assistant() else {
            return Err(StepError::Failed("no assistant turn to take tool calls from".to_string()));
        };
        let extraction = self.parser.extract(&turn.content);

        let mut outputs: Vec<ToolOutput> = Vec::new();
        for call in &extraction.calls {
            outputs.push(self.tools.execute(call).await);
        }
        for malformed in &extraction.malformed {
            warn!(reason = %malformed.reason, "reporting malformed tool call back to the model");
            let message = format!("malformed tool call: {}", malformed.reason);
            outputs.push(ToolOutput::error("unknown", message));
        }

        let report = json!(outputs
            .iter()
            .map(|o| json!({ "tool": o.tool, "is_error": o.is_error, "result": o.content }))
            .collect::<Vec<_>>());
        state.push(Role::Tool, format!("Tool results:\n{}", report));
        state.tool_results.extend(outputs);
        Ok(())
    }
}

/// Answers a question, calling tools the model asks for between turns.
///
/// respond → { tools → respond | end }
#[derive(Clone)]
pub struct AssistantAgent {
    client: Arc<dyn CompletionClient>,
    tools: Arc<ToolRegistry>,
    parser: ToolCallParser,
    max_iterations: u32,
    step_limit: u32,
    on_chunk: Option<ChunkHandler>,
}

impl AssistantAgent {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        tools: ToolRegistry,
        max_iterations: u32,
    ) -> Self {
        Self {
            client,
            tools: Arc::new(tools),
            parser: ToolCallParser::new(),
            max_iterations,
            step_limit: crate::config::DEFAULT_STEP_LIMIT,
            on_chunk: None,
        }
    }

    pub fn with_parser(mut self, parser: ToolCallParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_step_limit(mut self, step_limit: u32) -> Self {
        self.step_limit = step_limit;
        self
    }

    pub fn on_chunk(mut self, handler: ChunkHandler) -> Self {
        self.on_chunk = Some(handler);
        self
    }

    fn system_prompt(&self) -> String {
        if self.tools.is_empty() {
            BASE_PROMPT.to_string()
        } else {
            format!("{}\n\n{}", BASE_PROMPT, self.tools.describe(&self.parser))
        }
    }

    /// Never below the steps the tool loop can take: a respond per iteration
    /// with a tools step between them.
    fn effective_step_limit(&self) -> u32 {
        self.step_limit.max(self.max_iterations.saturating_mul(2))
    }

    pub fn workflow(&self) -> Result<Workflow, AgentError> {
        let workflow = Workflow::builder()
            .add_node(
                RESPOND,
                RespondStep {
                    client: self.client.clone(),
                    parser: self.parser.clone(),
                    system_prompt: self.system_prompt(),
                    on_chunk: self.on_chunk.clone(),
                },
            )
            .add_node(TOOLS, ToolsStep { tools: self.tools.clone(), parser: self.parser.clone() })
            .set_entry_point(RESPOND)
            .add_conditional_edges(
                RESPOND,
                has_tool_calls(self.parser.clone(), self.max_iterations),
                &[(routes::TOOLS, TOOLS), (routes::END_LABEL, END)],
            )
            .add_edge(TOOLS, RESPOND)
            .max_iterations(self.max_iterations)
            .step_limit(self.effective_step_limit())
            .compile()?;
        Ok(workflow)
    }
}

#[async_trait]
impl Agent for AssistantAgent {
    type Input = AskInput;
    type Output = RunOutcome;

    async fn execute(&self, input: &Self::Input) -> Result<Self::Output, AgentError> {
        let question = input.question.trim();
        if question.is_empty() {
            return Err(AgentError::Unexpected("Message is required".to_string()));
        }

        let mut state = GraphState::new();
        state.messages = input.history.clone();
        state.push(Role::User, question);
        info!(run_id = %state.run_id, tools = ?self.tools.names(), "AssistantAgent: answering");

        let outcome = self.workflow()?.invoke(state).await?;
        info!(
            run_id = %outcome.state.run_id,
            iterations = outcome.state.iterations(),
            tool_calls = outcome.state.tool_results.len(),
            "AssistantAgent: finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, LlmError};
    use crate::tools::{Tool, ToolError};
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<String>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl Scripted {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionClient for Scripted {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| LlmError::ParseError { message: "script exhausted".into() })
        }
    }

    struct Count;

    #[async_trait]
    impl Tool for Count {
        fn name(&self) -> &str {
            "count_orders"
        }

        fn description(&self) -> &str {
            "Count orders"
        }

        async fn call(&self, _arguments: &Value) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::ok("count_orders", json!({"count": 42})))
        }
    }

    fn registry() -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(Count)).unwrap();
        tools
    }

    const CALL: &str = "Checking.\n[TOOL_REQUEST]{\"name\": \"count_orders\"}[END_TOOL_REQUEST]";

    #[tokio::test]
    async fn answers_directly_without_tools() {
        let agent = AssistantAgent::new(Scripted::new(&["Hello there."]), registry(), 3);
        let outcome = agent.execute(&AskInput::new("hi")).await.unwrap();

        assert_eq!(outcome.state.steps, vec![RESPOND]);
        assert_eq!(outcome.state.generation.unwrap().prefix, "Hello there.");
        assert!(outcome.state.tool_results.is_empty());
    }

    #[tokio::test]
    async fn runs_requested_tool_and_feeds_result_back() {
        let client = Scripted::new(&[CALL, "There are 42 orders."]);
        let agent = AssistantAgent::new(client.clone(), registry(), 3);
        let outcome = agent.execute(&AskInput::new("how many orders?")).await.unwrap();

        assert_eq!(outcome.state.steps, vec![RESPOND, TOOLS, RESPOND]);
        assert_eq!(outcome.state.tool_results[0].content, json!({"count": 42}));
        assert_eq!(outcome.state.generation.unwrap().prefix, "There are 42 orders.");

        let seen = client.seen.lock().unwrap();
        assert!(seen[0][0].content.contains("- count_orders: Count orders"));
        let tool_turn = seen[1].last().unwrap();
        assert_eq!(tool_turn.role, Role::Tool);
        assert!(tool_turn.content.contains("\"count\":42"));
    }

    #[tokio::test]
    async fn tool_loop_is_bounded() {
        let client = Scripted::new(&[CALL, CALL, CALL]);
        let agent = AssistantAgent::new(client, registry(), 2);
        let outcome = agent.execute(&AskInput::new("loop")).await.unwrap();

        assert_eq!(outcome.state.iterations(), 2);
        assert_eq!(outcome.state.steps, vec![RESPOND, TOOLS, RESPOND]);
        assert_eq!(outcome.state.generation.unwrap().prefix, "Checking.");
    }

    #[tokio::test]
    async fn unknown_and_malformed_calls_are_reported_to_the_model() {
        let reply = "[TOOL_REQUEST]{\"name\": \"drop_db\"}[END_TOOL_REQUEST]\
                     [TOOL_REQUEST]oops[END_TOOL_REQUEST]";
        let agent = AssistantAgent::new(Scripted::new(&[reply, "Sorry."]), registry(), 3);
        let outcome = agent.execute(&AskInput::new("do it")).await.unwrap();

        let results = &outcome.state.tool_results;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_error));
        assert_eq!(results[0].content, json!({"error": "unknown tool 'drop_db'"}));
    }

    #[tokio::test]
    async fn malformed_only_reply_is_reported_back() {
        let reply = "[TOOL_REQUEST]{name: count_orders}[END_TOOL_REQUEST]";
        let client = Scripted::new(&[reply, "Let me fix that."]);
        let agent = AssistantAgent::new(client.clone(), registry(), 3);
        let outcome = agent.execute(&AskInput::new("count")).await.unwrap();

        assert_eq!(outcome.state.steps, vec![RESPOND, TOOLS, RESPOND]);
        assert_eq!(outcome.state.tool_results.len(), 1);
        assert!(outcome.state.tool_results[0].is_error);
        assert_eq!(outcome.state.generation.unwrap().prefix, "Let me fix that.");

        let seen = client.seen.lock().unwrap();
        let tool_turn = seen[1].last().unwrap();
        assert!(tool_turn.content.contains("malformed tool call"));
    }

    #[tokio::test]
    async fn streams_chunks_to_handler_and_keeps_history() {
        let seen_chunks = Arc::new(Mutex::new(String::new()));
        let sink = seen_chunks.clone();
        let client = Scripted::new(&["streamed"]);
        let agent = AssistantAgent::new(client.clone(), ToolRegistry::new(), 3)
            .on_chunk(Arc::new(move |c: &str| sink.lock().unwrap().push_str(c)));

        let input = AskInput {
            question: "again".into(),
            history: vec![Turn::new(Role::User, "first"), Turn::new(Role::Assistant, "answer")],
        };
        agent.execute(&input).await.unwrap();

        assert_eq!(*seen_chunks.lock().unwrap(), "streamed");
        let sent = &client.seen.lock().unwrap()[0];
        assert_eq!(sent[0].content, BASE_PROMPT);
        assert_eq!(sent.len(), 4);
    }

    #[tokio::test]
    async fn custom_delimiters_drive_the_tool_loop() {
        let parser = ToolCallParser::with_delimiters("<call>", "</call>").unwrap();
        let client = Scripted::new(&["<call>{\"name\": \"count_orders\"}</call>", "42."]);
        let agent = AssistantAgent::new(client, registry(), 3).with_parser(parser);
        let outcome = agent.execute(&AskInput::new("count")).await.unwrap();

        assert_eq!(outcome.state.steps, vec![RESPOND, TOOLS, RESPOND]);
        assert!(!outcome.state.tool_results[0].is_error);
    }

    #[tokio::test]
    async fn long_tool_loop_is_not_cut_by_small_step_limit() {
        let replies = vec![CALL; 15];
        let agent =
            AssistantAgent::new(Scripted::new(&replies), registry(), 15).with_step_limit(25);
        let outcome = agent.execute(&AskInput::new("loop")).await.unwrap();

        assert_eq!(outcome.state.iterations(), 15);
        assert_eq!(outcome.steps_executed, 29);
    }

    #[tokio::test]
    async fn blank_question_is_rejected() {
        let agent = AssistantAgent::new(Scripted::new(&[]), ToolRegistry::new(), 3);
        assert!(agent.execute(&AskInput::new("   ")).await.is_err());
    }
}
