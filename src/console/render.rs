use anyhow::Error;
use colored::*;

use crate::agents::AgentError;
use crate::graph::RunOutcome;
use crate::llm::{LlmError, Role};
use crate::state::Generation;
use crate::tools::ToolOutput;

pub fn display_welcome() {
    println!("{}", "🧌 Goblin Assistant".bright_blue().bold());
    println!(
        "{}",
        "Ask a question. The assistant may call tools before answering.".blue()
    );
    println!(
        "{}",
        "Make sure to set the LLM_API_KEY environment variable.".blue()
    );
    println!("{}", "Type '/quit' or '/exit' to stop.\n".blue());
}

pub fn display_thinking() {
    print!("{} ", "🤖 Goblin:".bright_green().bold());
}

pub fn display_trace(outcome: &RunOutcome) {
    let trace = outcome.state.steps.join(" → ");
    println!("\n{}", "🧭 Workflow Trace".bright_yellow().bold());
    println!("{}", "┌─────────────────────────────────────────────────────────────".yellow());
    println!("{} {}", "│ 🆔 Run:".yellow(), outcome.state.run_id.to_string().bright_white());
    println!("{} {}", "│ 🪜 Steps:".yellow(), trace.white());
    println!(
        "{} {} ({} steps)",
        "│ 🔁 Iterations:".yellow(),
        outcome.state.iterations().to_string().white(),
        outcome.steps_executed
    );
    let status = if outcome.succeeded() {
        "passed".bright_green().bold()
    } else {
        "gave up after the last attempt".bright_red().bold()
    };
    println!("{} {}", "│ ⚖️  Result:".yellow(), status);
    println!("{}", "└─────────────────────────────────────────────────────────────\n".yellow());
}

pub fn display_generation(generation: &Generation) {
    println!("\n{}", "📦 Solution".bright_cyan().bold());
    println!("{}", "┌─────────────────────────────────────────────────────────────".cyan());
    if !generation.prefix.trim().is_empty() {
        for line in generation.prefix.lines() {
            println!("│ {}", line.white());
        }
    }
    if !generation.imports.trim().is_empty() {
        println!("{}", "│ ── Imports:".cyan());
        for line in generation.imports.lines() {
            println!("│   {}", line.white());
        }
    }
    if !generation.code.trim().is_empty() {
        println!("{}", "│ ── Code:".cyan());
        for line in generation.code.lines() {
            println!("│   {}", line.white());
        }
    }
    println!("{}", "└─────────────────────────────────────────────────────────────\n".cyan());
}

pub fn display_failures(outcome: &RunOutcome) {
    let failures: Vec<_> = outcome
        .state
        .messages
        .iter()
        .filter(|t| t.role == Role::User && t.content.starts_with("Your solution failed"))
        .collect();
    if failures.is_empty() {
        return;
    }
    println!("{}", "🧪 Check failures".bright_magenta().bold());
    for (idx, turn) in failures.iter().enumerate() {
        println!("  {}. {}", idx + 1, turn.content.magenta());
    }
    println!();
}

pub fn display_tool_results(results: &[ToolOutput]) {
    if results.is_empty() {
        return;
    }
    println!("\n{}", "🛠️  Tool calls".bright_magenta().bold());
    for output in results {
        let icon = if output.is_error { "✖".bright_red() } else { "✔".bright_green() };
        let pretty = serde_json::to_string_pretty(&output.content)
            .unwrap_or_else(|_| output.content.to_string());
        println!("  {} {}", icon, output.tool.bright_white());
        for line in pretty.lines() {
            println!("    {}", line.white());
        }
    }
    println!();
}

pub fn display_error(error: &Error) {
    let llm_error = error
        .downcast_ref::<AgentError>()
        .and_then(AgentError::llm_error)
        .or_else(|| error.downcast_ref::<LlmError>());

    if let Some(llm_error) = llm_error {
        display_llm_error(llm_error);
    } else {
        println!(
            "{} {}",
            "❌ Error:".bright_red().bold(),
            error.to_string().red()
        );
        println!(
            "{}",
            "Please check your configuration and try again.\n".red()
        );
    }
}

pub fn display_llm_error(error: &LlmError) {
    let user_message = error.user_message();
    match error {
        LlmError::ServerBusy | LlmError::Timeout { .. } => {
            println!("{}", user_message.bright_yellow().bold());
            println!(
                "{}",
                "💡 Tip: The server might be overloaded. Try again later.".yellow()
            );
        }
        LlmError::NetworkError { .. } => {
            println!("{}", user_message.bright_red().bold());
            println!(
                "{}",
                "💡 Tip: Check your internet connection and LLM_BASE_URL.".red()
            );
        }
        LlmError::ApiError { status, .. } => {
            println!("{}", user_message.bright_red().bold());
            if *status == 404 {
                println!("{}", "💡 Tip: Check LLM_MODEL and LLM_BASE_URL.".red());
            }
        }
        LlmError::ParseError { .. } => {
            println!("{}", user_message.bright_magenta().bold());
            println!(
                "{}",
                "💡 Tip: The server response was unexpected. Try rephrasing your request.".magenta()
            );
        }
        LlmError::ConfigError { .. } => {
            println!("{}", user_message.bright_red().bold());
            println!(
                "{}",
                "💡 Tip: Check your environment variables and configuration.".red()
            );
        }
    }
    println!();
}

pub fn display_goodbye() {
    println!("{}", "👋 Goodbye!".bright_yellow().bold());
}
