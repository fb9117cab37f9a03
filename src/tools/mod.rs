use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

pub mod parser;
pub mod sql;

pub use parser::{Extraction, MalformedCall, ToolCallParser};
pub use sql::{HttpQueryExecutor, QueryExecutor, QueryResult, SqlQueryTool};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("tool '{0}' is already registered")]
    Duplicate(String),

    #[error("invalid arguments for '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("query rejected: {0}")]
    Rejected(String),

    #[error("invalid tool delimiters: {0}")]
    InvalidDelimiters(String),

    #[error("tool '{tool}' failed: {message}")]
    Execution { tool: String, message: String },
}

/// A structured invocation extracted from model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool: String,
    pub content: Value,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(tool: impl Into<String>, content: Value) -> Self {
        Self { tool: tool.into(), content, is_error: false }
    }

    pub fn error(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            content: json!({ "error": message.into() }),
            is_error: true,
        }
    }
}

/// An external service a workflow may invoke on the model's behalf.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn call(&self, arguments: &Value) -> Result<ToolOutput, ToolError>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::Duplicate(name));
        }
        info!(tool = %name, "registered tool");
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Run a call. Failures come back as error outputs so the model can see them.
    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(tool) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, "model requested an unknown tool");
            let message = ToolError::UnknownTool(call.name.clone()).to_string();
            return ToolOutput::error(&call.name, message);
        };

        info!(tool = %call.name, "executing tool call");
        match tool.call(&call.arguments).await {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "tool call failed");
                ToolOutput::error(&call.name, e.to_string())
            }
        }
    }

    /// Prompt fragment describing the available tools and how to invoke them.
    pub fn describe(&self, parser: &ToolCallParser) -> String {
        let mut out = String::from("You can call the following tools:\n");
        for (name, tool) in &self.tools {
            out.push_str(&format!("- {}: {}\n", name, tool.description()));
        }
        out.push_str("\nTo call a tool, reply with a block in exactly this form ");
        out.push_str("and nothing else after it:\n");
        out.push_str(&parser.format_hint());
        out.push_str("\nWhen you have enough information, answer without any tool block.");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the arguments back"
        }

        async fn call(&self, arguments: &Value) -> Result<ToolOutput, ToolError> {
            if arguments.get("fail").is_some() {
                return Err(ToolError::Execution {
                    tool: "echo".into(),
                    message: "asked to fail".into(),
                });
            }
            Ok(ToolOutput::ok("echo", arguments.clone()))
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        assert!(registry.get("echo").is_some());
        assert!(matches!(
            registry.register(Arc::new(Echo)),
            Err(ToolError::Duplicate(name)) if name == "echo"
        ));
    }

    #[tokio::test]
    async fn execute_routes_to_tool_and_wraps_failures() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();

        let call = |name: &str, arguments| ToolCall { name: name.into(), arguments };

        let ok = registry.execute(&call("echo", json!({"a": 1}))).await;
        assert!(!ok.is_error);
        assert_eq!(ok.content, json!({"a": 1}));

        let failed = registry.execute(&call("echo", json!({"fail": true}))).await;
        assert!(failed.is_error);

        let unknown = registry.execute(&call("nope", json!({}))).await;
        assert!(unknown.is_error);
        assert_eq!(unknown.content, json!({"error": "unknown tool 'nope'"}));
    }

    #[test]
    fn describe_lists_tools_and_format() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let text = registry.describe(&ToolCallParser::new());
        assert!(text.contains("- echo: Echo the arguments back"));
        assert!(text.contains("[TOOL_REQUEST]"));
    }
}
