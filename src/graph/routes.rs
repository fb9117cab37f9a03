//! Stock routers for the retry and tool-use loops.

use tracing::info;

use crate::state::{GraphState, RetryStrategy};
use crate::tools::ToolCallParser;

pub const END_LABEL: &str = "end";
pub const GENERATE: &str = "generate";
pub const REFLECT: &str = "reflect";
pub const TOOLS: &str = "tools";

/// Finish when the last check passed or the retry budget is spent;
/// otherwise retry the way `state.retry` asks for.
pub fn decide_to_finish(
    max_iterations: u32,
) -> impl Fn(&GraphState) -> String + Send + Sync + 'static {
    move |state| {
        if !state.error || state.iterations() >= max_iterations {
            info!(iterations = state.iterations(), error = state.error, "decision: finish");
            return END_LABEL.to_string();
        }
        info!(iterations = state.iterations(), "decision: re-try solution");
        match state.retry {
            RetryStrategy::Reflect => REFLECT.to_string(),
            RetryStrategy::Regenerate => GENERATE.to_string(),
        }
    }
}

/// Go to the tools step while the last assistant turn holds invocation
/// blocks and the budget allows another model turn. Malformed blocks count,
/// so their errors reach the model.
pub fn has_tool_calls(
    parser: ToolCallParser,
    max_iterations: u32,
) -> impl Fn(&GraphState) -> String + Send + Sync + 'static {
    move |state| {
        let wants_tools = state
            .last_assistant()
            .is_some_and(|turn| parser.has_invocations(&turn.content));
        if wants_tools && state.iterations() < max_iterations {
            TOOLS.to_string()
        } else {
            END_LABEL.to_string()
        }
    }
}
