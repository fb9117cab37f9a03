use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

use crate::state::Generation;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
/// Longest slice of command output fed back to the model.
const MAX_REPORTED_OUTPUT: usize = 2000;

/// `Fail` carries the rest of "Your solution failed ...", naming the test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckVerdict {
    Pass,
    Fail(String),
}

/// Decides whether a generation is acceptable.
#[async_trait]
pub trait ArtifactChecker: Send + Sync {
    async fn check(&self, generation: &Generation) -> Result<CheckVerdict, std::io::Error>;
}

/// Writes the generated source into a scratch directory and checks it there.
///
/// With a runner (for example `python3`), the imports are run alone first,
/// then imports and code together. The testing commands then run with
/// `sh -c` and `$SOLUTION_FILE` pointing at the written source. The first
/// failure fails the check.
#[derive(Debug, Clone)]
pub struct CommandChecker {
    runner: Option<String>,
    commands: Vec<String>,
    file_name: String,
    timeout: Duration,
}

impl CommandChecker {
    pub fn new(commands: Vec<String>, file_name: impl Into<String>) -> Self {
        Self {
            runner: None,
            commands,
            file_name: file_name.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_runner(mut self, runner: impl Into<String>) -> Self {
        let runner = runner.into();
        self.runner = (!runner.trim().is_empty()).then_some(runner);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one shell command in `dir`. `Err` carries the failure detail.
    async fn run_shell(
        &self,
        script: &str,
        arg: Option<&Path>,
        dir: &Path,
        file: &Path,
    ) -> Result<Result<(), String>, std::io::Error> {
        info!(command = script, "running check command");
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        if let Some(arg) = arg {
            command.arg("sh").arg(arg);
        }
        let child = command
            .current_dir(dir)
            .env("SOLUTION_FILE", file)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(
                    command = script,
                    timeout_secs = self.timeout.as_secs(),
                    "check command timed out"
                );
                return Ok(Err(format!("timed out after {} seconds", self.timeout.as_secs())));
            }
        };

        if output.status.success() {
            return Ok(Ok(()));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() { stdout } else { stderr };
        warn!(command = script, status = %output.status, "check command failed");
        Ok(Err(format!(
            "exited with {}: {}",
            output.status,
            truncate(detail.trim(), MAX_REPORTED_OUTPUT)
        )))
    }
}

#[async_trait]
impl ArtifactChecker for CommandChecker {
    async fn check(&self, generation: &Generation) -> Result<CheckVerdict, std::io::Error> {
        if self.runner.is_none() && self.commands.is_empty() {
            return Ok(CheckVerdict::Pass);
        }

        let dir = tempfile::tempdir()?;
        let file = dir.path().join(&self.file_name);
        fs::write(&file, generation.source()).await?;

        if let Some(runner) = &self.runner {
            let script = format!("{} \"$1\"", runner);

            let imports = dir.path().join(format!("imports_{}", self.file_name));
            fs::write(&imports, &generation.imports).await?;
            info!("---CHECKING IMPORTS---");
            if let Err(detail) = self.run_shell(&script, Some(&imports), dir.path(), &file).await? {
                return Ok(CheckVerdict::Fail(format!("the import test: {}", detail)));
            }

            info!("---CHECKING CODE EXECUTION---");
            if let Err(detail) = self.run_shell(&script, Some(&file), dir.path(), &file).await? {
                return Ok(CheckVerdict::Fail(format!("the code execution test: {}", detail)));
            }
        }

        for command in &self.commands {
            if let Err(detail) = self.run_shell(command, None, dir.path(), &file).await? {
                return Ok(CheckVerdict::Fail(format!("the check: `{}` {}", command, detail)));
            }
        }
        Ok(CheckVerdict::Pass)
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solution(code: &str) -> Generation {
        Generation { prefix: String::new(), imports: String::new(), code: code.to_string() }
    }

    #[tokio::test]
    async fn no_commands_passes() {
        let checker = CommandChecker::new(vec![], "main.sh");
        assert_eq!(checker.check(&solution("anything")).await.unwrap(), CheckVerdict::Pass);
    }

    #[tokio::test]
    async fn runs_commands_against_written_file() {
        let checker =
            CommandChecker::new(vec!["grep -q hello \"$SOLUTION_FILE\"".to_string()], "main.txt");
        assert_eq!(checker.check(&solution("say hello")).await.unwrap(), CheckVerdict::Pass);

        let verdict = checker.check(&solution("say goodbye")).await.unwrap();
        assert!(matches!(verdict, CheckVerdict::Fail(reason) if reason.contains("exited with")));
    }

    #[tokio::test]
    async fn first_failure_reports_stderr() {
        let checker = CommandChecker::new(
            vec!["echo broken >&2; exit 3".to_string(), "true".to_string()],
            "main.sh",
        );
        let verdict = checker.check(&solution("")).await.unwrap();
        assert!(matches!(verdict, CheckVerdict::Fail(reason) if reason.ends_with("broken")));
    }

    #[tokio::test]
    async fn slow_commands_time_out() {
        let checker = CommandChecker::new(vec!["sleep 5".to_string()], "main.sh")
            .with_timeout(Duration::from_millis(100));
        let verdict = checker.check(&solution("")).await.unwrap();
        assert!(matches!(verdict, CheckVerdict::Fail(reason) if reason.contains("timed out")));
    }

    fn split(imports: &str, code: &str) -> Generation {
        Generation { prefix: String::new(), imports: imports.to_string(), code: code.to_string() }
    }

    #[tokio::test]
    async fn runner_passes_clean_solution() {
        let checker = CommandChecker::new(vec![], "main.sh").with_runner("sh");
        let verdict = checker.check(&split("X=1", "test \"$X\" = 1")).await.unwrap();
        assert_eq!(verdict, CheckVerdict::Pass);
    }

    #[tokio::test]
    async fn runner_reports_import_failure() {
        let checker = CommandChecker::new(vec![], "main.sh").with_runner("sh");
        let solution = split("echo no such module >&2; exit 1", "true");
        let verdict = checker.check(&solution).await.unwrap();
        assert!(matches!(
            verdict,
            CheckVerdict::Fail(reason) if reason.starts_with("the import test:")
                && reason.ends_with("no such module")
        ));
    }

    #[tokio::test]
    async fn runner_reports_execution_failure() {
        let checker = CommandChecker::new(vec!["true".to_string()], "main.sh").with_runner("sh");
        let verdict = checker.check(&split("X=1", "echo boom >&2; exit 2")).await.unwrap();
        assert!(matches!(
            verdict,
            CheckVerdict::Fail(reason) if reason.starts_with("the code execution test:")
                && reason.ends_with("boom")
        ));
    }

    #[tokio::test]
    async fn blank_runner_is_ignored() {
        let checker = CommandChecker::new(vec![], "main.sh").with_runner("  ");
        assert_eq!(checker.check(&split("exit 1", "exit 1")).await.unwrap(), CheckVerdict::Pass);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h…");
        assert_eq!(truncate("short", 10), "short");
    }
}
