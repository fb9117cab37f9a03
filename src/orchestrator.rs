use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::agents::{Agent, AskInput, AssistantAgent, CommandChecker, DevTask, DeveloperAgent};
use crate::config::Config;
use crate::console::Console;
use crate::graph::RunOutcome;
use crate::llm::{CompletionClient, HttpCompletionClient};
use crate::state::RetryStrategy;
use crate::tools::{HttpQueryExecutor, SqlQueryTool, ToolRegistry};

/// How the developer workflow should verify its output.
#[derive(Debug, Clone)]
pub struct DevelopOptions {
    /// Interpreter for the import and execution tests, e.g. `python3`
    pub runner: Option<String>,
    pub testing_commands: Vec<String>,
    pub file_name: String,
    pub retry: RetryStrategy,
}

/// Wires configuration, clients and tools into the agents and renders results.
pub struct Orchestrator {
    config: Config,
    client: Arc<dyn CompletionClient>,
    json: bool,
}

impl Orchestrator {
    pub fn new(config: Config, json: bool) -> Result<Self> {
        let client = HttpCompletionClient::new(config.clone())?;
        info!(model = %config.model, base_url = %config.base_url, "completion client ready");
        Ok(Self { config, client: Arc::new(client), json })
    }

    /// Use an already-built completion client instead of the HTTP one.
    pub fn with_client(config: Config, client: Arc<dyn CompletionClient>, json: bool) -> Self {
        Self { config, client, json }
    }

    pub fn tools(&self) -> Result<ToolRegistry> {
        let mut tools = ToolRegistry::new();
        match &self.config.query_service_url {
            Some(url) => {
                let timeout = Duration::from_secs(self.config.timeout);
                let executor = HttpQueryExecutor::new(url.clone(), timeout)?;
                tools.register(Arc::new(SqlQueryTool::new(Arc::new(executor))))?;
                info!(%url, "sql_query tool registered");
            }
            None => info!("QUERY_SERVICE_URL not set, running without tools"),
        }
        Ok(tools)
    }

    pub fn assistant(&self) -> Result<AssistantAgent> {
        let agent =
            AssistantAgent::new(self.client.clone(), self.tools()?, self.config.max_iterations)
                .with_step_limit(self.config.step_limit);
        Ok(agent)
    }

    pub async fn run_develop(
        &self,
        prompt: String,
        context_file: Option<&Path>,
        options: DevelopOptions,
    ) -> Result<RunOutcome> {
        let context = match context_file {
            Some(path) => {
                info!("Loading context from file: {}", path.display());
                Some(tokio::fs::read_to_string(path).await?)
            }
            None => None,
        };
        if options.runner.is_none() && options.testing_commands.is_empty() {
            warn!("no runner and no --test commands, every generation will pass the check");
        }

        let mut checker = CommandChecker::new(options.testing_commands, options.file_name);
        if let Some(runner) = options.runner {
            checker = checker.with_runner(runner);
        }
        let agent =
            DeveloperAgent::new(self.client.clone(), Arc::new(checker), self.config.max_iterations)
                .with_retry(options.retry)
                .with_step_limit(self.config.step_limit);

        let outcome = agent.execute(&DevTask { prompt, context }).await?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&outcome.state)?);
        } else {
            Console::display_development(&outcome);
        }
        Ok(outcome)
    }

    pub async fn run_ask(&self, question: String) -> Result<RunOutcome> {
        let outcome = self.assistant()?.execute(&AskInput::new(question)).await?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&outcome.state)?);
        } else {
            Console::display_answer(&outcome);
        }
        Ok(outcome)
    }

    pub async fn run_chat(&self) -> Result<()> {
        info!("Interactive mode: each line is answered by the assistant workflow");
        Console::run_chat(self.assistant()?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(query_service_url: Option<&str>) -> Config {
        let mut cfg =
            Config::from_lookup(|key| (key == "LLM_API_KEY").then(|| "sk-test".to_string()))
                .unwrap();
        cfg.query_service_url = query_service_url.map(str::to_string);
        cfg
    }

    #[test]
    fn sql_tool_registered_only_with_query_service() {
        let without = Orchestrator::new(config(None), false).unwrap();
        assert!(without.tools().unwrap().is_empty());

        let with = Orchestrator::new(config(Some("http://localhost:9/query")), false).unwrap();
        assert_eq!(with.tools().unwrap().names(), vec![SqlQueryTool::NAME]);
    }
}
