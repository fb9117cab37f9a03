use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::{ChatMessage, Role};
use crate::tools::ToolOutput;

/// One conversation turn recorded in the graph state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), at: Utc::now() }
    }

    pub fn as_message(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }
}

/// Where a failed check routes back to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Go straight back to generation with the failure appended
    Regenerate,
    /// Ask the model to reflect on the failure before regenerating
    #[default]
    Reflect,
}

/// The generation artifact a workflow produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    /// Description of the solution
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub imports: String,
    #[serde(default)]
    pub code: String,
}

impl Generation {
    /// A prose answer with no code component.
    pub fn text(body: impl Into<String>) -> Self {
        Self { prefix: body.into(), ..Self::default() }
    }

    /// Parse a model reply into a generation.
    ///
    /// Accepts a bare JSON object, a JSON object inside a ```json fence, or
    /// anything else, which is kept verbatim as code.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Some(generation) = from_json(trimmed) {
            return generation;
        }
        if let Some(generation) = fenced_body(trimmed).and_then(from_json) {
            return generation;
        }
        Self { code: trimmed.to_string(), ..Self::default() }
    }

    /// Imports followed by the code body, as it would be written to a file.
    pub fn source(&self) -> String {
        match (self.imports.trim().is_empty(), self.code.trim().is_empty()) {
            (true, _) => self.code.clone(),
            (false, true) => self.imports.clone(),
            (false, false) => format!("{}\n{}", self.imports.trim_end(), self.code),
        }
    }

    pub fn summary(&self) -> String {
        format!("{} \n Imports: {} \n Code: {}", self.prefix, self.imports, self.code)
    }
}

#[derive(Deserialize)]
struct GenerationFields {
    prefix: Option<String>,
    imports: Option<String>,
    code: Option<String>,
}

/// A JSON object counts as a generation only if it carries one of its fields.
fn from_json(text: &str) -> Option<Generation> {
    let fields: GenerationFields = serde_json::from_str(text).ok()?;
    if fields.prefix.is_none() && fields.imports.is_none() && fields.code.is_none() {
        return None;
    }
    Some(Generation {
        prefix: fields.prefix.unwrap_or_default(),
        imports: fields.imports.unwrap_or_default(),
        code: fields.code.unwrap_or_default(),
    })
}

fn fenced_body(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// Shared mutable state threaded through every step of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphState {
    pub run_id: Uuid,
    pub messages: Vec<Turn>,
    /// Set by check steps when the current generation failed
    pub error: bool,
    pub generation: Option<Generation>,
    iterations: u32,
    pub retry: RetryStrategy,
    /// Names of the steps visited, in order
    pub steps: Vec<String>,
    pub tool_results: Vec<ToolOutput>,
}

impl Default for GraphState {
    fn default() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            messages: Vec::new(),
            error: false,
            generation: None,
            iterations: 0,
            retry: RetryStrategy::default(),
            steps: Vec::new(),
            tool_results: Vec::new(),
        }
    }
}

impl GraphState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_message(content: impl Into<String>) -> Self {
        let mut state = Self::new();
        state.push(Role::User, content);
        state
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Advance the iteration counter. The counter never goes down.
    pub fn bump_iteration(&mut self) -> u32 {
        self.iterations = self.iterations.saturating_add(1);
        self.iterations
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(Turn::new(role, content));
    }

    pub fn last_assistant(&self) -> Option<&Turn> {
        self.messages.iter().rev().find(|t| t.role == Role::Assistant)
    }

    /// Conversation as chat messages, optionally led by a system prompt.
    pub fn transcript(&self, system_prompt: Option<&str>) -> Vec<ChatMessage> {
        system_prompt
            .map(ChatMessage::system)
            .into_iter()
            .chain(self.messages.iter().map(Turn::as_message))
            .collect()
    }
}
