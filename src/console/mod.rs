use std::io::Write;
use std::sync::Arc;

use anyhow::{Error, Result};
use colored::*;
use tokio::select;

use crate::agents::{Agent, AskInput, AssistantAgent};
use crate::graph::RunOutcome;
use crate::llm::Role;
use crate::state::Turn;

mod input;
mod render;

/// Terminal front end for the workflows
pub struct Console;

impl Console {
    pub fn display_welcome() {
        render::display_welcome();
    }

    pub async fn get_user_input(lines: &mut input::InputLines) -> Result<String> {
        input::get_user_input(lines).await
    }

    pub fn is_quit_command(input_text: &str) -> bool {
        input::is_quit_command(input_text)
    }

    /// Summary of a finished developer run: trace, failures and the final solution
    pub fn display_development(outcome: &RunOutcome) {
        render::display_trace(outcome);
        render::display_failures(outcome);
        if let Some(generation) = &outcome.state.generation {
            render::display_generation(generation);
        }
    }

    pub fn display_answer(outcome: &RunOutcome) {
        render::display_tool_results(&outcome.state.tool_results);
        if let Some(generation) = &outcome.state.generation {
            println!("{} {}\n", "🤖 Goblin:".bright_green().bold(), generation.prefix.white());
        }
    }

    pub fn display_error(error: &Error) {
        render::display_error(error);
    }

    pub fn display_goodbye() {
        render::display_goodbye();
    }

    /// Interactive loop: each line is answered by the assistant workflow,
    /// with replies streamed to the terminal as they arrive.
    pub async fn run_chat(agent: AssistantAgent) -> Result<()> {
        Self::display_welcome();
        let agent = agent.on_chunk(Arc::new(|chunk: &str| {
            print!("{}", chunk.white());
            let _ = std::io::stdout().flush();
        }));
        let mut history: Vec<Turn> = Vec::new();
        let mut lines = input::stdin_lines();

        loop {
            select! {
                _ = tokio::signal::ctrl_c() => {
                    Self::display_goodbye();
                    break;
                }
                input_result = Self::get_user_input(&mut lines) => {
                    let input = match input_result {
                        Ok(input) => input,
                        Err(e) => {
                            println!("Error reading input: {}", e);
                            continue;
                        }
                    };

                    if input.is_empty() {
                        continue;
                    }

                    if Self::is_quit_command(&input) {
                        Self::display_goodbye();
                        break;
                    }

                    render::display_thinking();
                    let ask = AskInput { question: input, history: history.clone() };

                    // Allow request to be cancelled by Ctrl+C
                    select! {
                        _ = tokio::signal::ctrl_c() => {
                            println!("\n⚠️ Request cancelled by user");
                            continue;
                        }
                        result = agent.execute(&ask) => {
                            println!();
                            match result {
                                Ok(outcome) => {
                                    render::display_tool_results(&outcome.state.tool_results);
                                    history = outcome
                                        .state
                                        .messages
                                        .into_iter()
                                        .filter(|t| t.role != Role::System)
                                        .collect();
                                }
                                Err(e) => Self::display_error(&Error::from(e)),
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
