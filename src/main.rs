use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use agent_workflow::config::Config;
use agent_workflow::console::Console;
use agent_workflow::orchestrator::{DevelopOptions, Orchestrator};
use agent_workflow::state::RetryStrategy;

#[derive(Debug, Parser)]
#[command(version, about = "Bounded-iteration LLM agent workflows")]
struct Args {
    /// Override WORKFLOW_MAX_ITERATIONS
    #[arg(long, global = true)]
    max_iterations: Option<u32>,

    /// Override LLM_MODEL
    #[arg(long, global = true)]
    model: Option<String>,

    /// Print the final graph state as JSON instead of the console summary
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate code and retry until the testing commands pass
    Develop {
        #[arg(long)]
        prompt: String,

        /// Reference material included in the system prompt
        #[arg(long)]
        context_file: Option<PathBuf>,

        /// Shell command run against the generated file (repeatable).
        /// `$SOLUTION_FILE` holds its path
        #[arg(long = "test")]
        tests: Vec<String>,

        /// Interpreter for the import and execution tests
        #[arg(long, default_value = "python3")]
        runner: String,

        /// Skip the import and execution tests and rely on --test commands only
        #[arg(long, default_value_t = false)]
        no_runner: bool,

        /// Name of the file the solution is written to before testing
        #[arg(long, default_value = "solution.py")]
        file_name: String,

        /// Retry without a reflection step
        #[arg(long, default_value_t = false)]
        regenerate: bool,
    },
    /// Answer one question, calling tools as needed
    Ask {
        #[arg(long)]
        question: String,
    },
    /// Interactive assistant session
    Chat,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    // logging
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter_layer).with_writer(std::io::stderr).init();

    tracing::info!("Starting agent workflow");

    let mut config = Config::load()?;
    if let Some(model) = args.model {
        config.model = model;
    }
    if let Some(max_iterations) = args.max_iterations {
        config.max_iterations = max_iterations;
    }
    // overrides are re-validated when the client is built
    let orchestrator = Orchestrator::new(config, args.json)?;

    let result = match args.command {
        Command::Develop {
            prompt,
            context_file,
            tests,
            runner,
            no_runner,
            file_name,
            regenerate,
        } => {
            let options = DevelopOptions {
                runner: (!no_runner).then_some(runner),
                testing_commands: tests,
                file_name,
                retry: if regenerate { RetryStrategy::Regenerate } else { RetryStrategy::Reflect },
            };
            orchestrator
                .run_develop(prompt, context_file.as_deref(), options)
                .await
                .map(|_| ())
        }
        Command::Ask { question } => orchestrator.run_ask(question).await.map(|_| ()),
        Command::Chat => orchestrator.run_chat().await,
    };

    if let Err(e) = result {
        Console::display_error(&e);
        std::process::exit(1);
    }
    Ok(())
}
