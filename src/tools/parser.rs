use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use super::{ToolCall, ToolError};

pub const DEFAULT_OPEN: &str = "[TOOL_REQUEST]";
pub const DEFAULT_CLOSE: &str = "[END_TOOL_REQUEST]";

/// Result of scanning model output for tool invocations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub calls: Vec<ToolCall>,
    /// Bodies that sat between delimiters but were not a valid invocation
    pub malformed: Vec<MalformedCall>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MalformedCall {
    pub body: String,
    pub reason: String,
}

/// Pulls delimiter-bracketed invocations out of free text.
///
/// Each invocation body is JSON: `{"name": "...", "arguments": {...}}`.
#[derive(Debug, Clone)]
pub struct ToolCallParser {
    open: String,
    close: String,
    block: Regex,
    think: Regex,
}

static DEFAULT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\[TOOL_REQUEST\](.*?)\[END_TOOL_REQUEST\]").expect("valid regex")
});
static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));

impl Default for ToolCallParser {
    fn default() -> Self {
        Self {
            open: DEFAULT_OPEN.to_string(),
            close: DEFAULT_CLOSE.to_string(),
            block: DEFAULT_BLOCK.clone(),
            think: THINK_BLOCK.clone(),
        }
    }
}

impl ToolCallParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delimiters(open: &str, close: &str) -> Result<Self, ToolError> {
        if open.is_empty() || close.is_empty() {
            return Err(ToolError::InvalidDelimiters("delimiters must be non-empty".to_string()));
        }
        let pattern = format!(r"(?s){}(.*?){}", regex::escape(open), regex::escape(close));
        let block =
            Regex::new(&pattern).map_err(|e| ToolError::InvalidDelimiters(e.to_string()))?;
        Ok(Self {
            open: open.to_string(),
            close: close.to_string(),
            block,
            think: THINK_BLOCK.clone(),
        })
    }

    pub fn open(&self) -> &str {
        &self.open
    }

    pub fn close(&self) -> &str {
        &self.close
    }

    /// Whether `text` holds any invocation block, well-formed or not.
    pub fn has_invocations(&self, text: &str) -> bool {
        self.block.is_match(text)
    }

    pub fn extract(&self, text: &str) -> Extraction {
        let mut extraction = Extraction::default();
        for cap in self.block.captures_iter(text) {
            let body = cap.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            match parse_body(body) {
                Ok(call) => extraction.calls.push(call),
                Err(reason) => {
                    warn!(%reason, body, "ignoring malformed tool invocation");
                    extraction.malformed.push(MalformedCall { body: body.to_string(), reason });
                }
            }
        }
        extraction
    }

    /// The prose around the invocations, with reasoning blocks removed as well.
    pub fn strip(&self, text: &str) -> String {
        let without_tools = self.block.replace_all(text, "");
        self.think.replace_all(&without_tools, "").trim().to_string()
    }

    /// How an invocation must be written, for inclusion in a system prompt.
    pub fn format_hint(&self) -> String {
        format!(
            "{}\n{{\"name\": \"<tool name>\", \"arguments\": {{ ... }}}}\n{}",
            self.open, self.close
        )
    }
}

fn parse_body(body: &str) -> Result<ToolCall, String> {
    let parsed: Value = serde_json::from_str(body).map_err(|e| format!("invalid JSON: {}", e))?;
    let name = parsed
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| "missing \"name\"".to_string())?;

    let arguments = match parsed.get("arguments") {
        None | Some(Value::Null) => Value::Object(Default::default()),
        // Some models double-encode the arguments object.
        Some(Value::String(s)) => {
            serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))
        }
        Some(other) => other.clone(),
    };

    Ok(ToolCall { name: name.to_string(), arguments })
}
