use async_trait::async_trait;

use crate::graph::GraphError;
use crate::llm::LlmError;
use crate::tools::ToolError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("Unexpected: {0}")]
    Unexpected(String),
}

impl AgentError {
    /// The completion-service error at the root of this failure, if any.
    pub fn llm_error(&self) -> Option<&LlmError> {
        match self {
            AgentError::Llm(e) => Some(e),
            AgentError::Graph(e) => e.llm_error(),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Agent {
    type Input: Send + Sync;
    type Output: Send + Sync;
    async fn execute(&self, input: &Self::Input) -> Result<Self::Output, AgentError>;
}

pub mod assistant;
pub mod checker;
pub mod developer;

pub use assistant::{AskInput, AssistantAgent};
pub use checker::{ArtifactChecker, CheckVerdict, CommandChecker};
pub use developer::{DevTask, DeveloperAgent};
