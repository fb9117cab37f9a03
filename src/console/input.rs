use std::io::Write;

use anyhow::Result;
use colored::*;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};

/// Line reader kept for a whole session so pasted lines are not lost between prompts.
pub type InputLines = Lines<BufReader<Stdin>>;

pub fn stdin_lines() -> InputLines {
    BufReader::new(tokio::io::stdin()).lines()
}

pub async fn get_user_input(lines: &mut InputLines) -> Result<String> {
    prompt_user(&format!("{} ", "🧌 You:".bright_cyan().bold()), lines).await
}

/// Print `prompt_text` and read one trimmed line. End of input reads as `/quit`.
pub async fn prompt_user<R>(prompt_text: &str, lines: &mut Lines<R>) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    print!("{}", prompt_text);
    std::io::stdout().flush()?;

    match lines.next_line().await? {
        Some(line) => Ok(line.trim().to_string()),
        None => Ok("/quit".to_string()),
    }
}

pub fn is_quit_command(input_text: &str) -> bool {
    matches!(input_text.trim().to_lowercase().as_str(), "/quit" | "/exit")
}
