//! Runs external tools and captures their output.

use crate::error::{ShrinkError, ShrinkResult};
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    benign_stderr: Vec<String>,
}

impl CommandExecutor {
    pub fn new(benign_stderr: Vec<String>) -> Self {
        Self { benign_stderr }
    }

    /// Run a command and fail unless it exits successfully.
    pub async fn run(&self, program: &str, args: &[String]) -> ShrinkResult<CommandOutput> {
        let output = self.execute(program, args, None).await?;
        Self::require_success(program, args, output)
    }

    /// Run a command with `input` piped to stdin.
    pub async fn run_with_input(
        &self,
        program: &str,
        args: &[String],
        input: &str,
    ) -> ShrinkResult<CommandOutput> {
        let output = self.execute(program, args, Some(input.to_string())).await?;
        Self::require_success(program, args, output)
    }

    /// Run a command and hand back its output whatever the exit status.
    pub async fn execute(
        &self,
        program: &str,
        args: &[String],
        input: Option<String>,
    ) -> ShrinkResult<CommandOutput> {
        let command_line = render_command(program, args);
        info!("{}", command_line.replace('\n', "\\n"));

        let owned_program = program.to_string();
        let owned_args = args.to_vec();
        let raw = tokio::task::spawn_blocking(move || {
            let mut expression = duct::cmd(owned_program, owned_args)
                .stdout_capture()
                .stderr_capture()
                .unchecked();
            if let Some(input) = input {
                expression = expression.stdin_bytes(input.into_bytes());
            }
            expression.run()
        })
        .await
        .map_err(|e| ShrinkError::Tooling {
            command: command_line.clone(),
            status: "task aborted".to_string(),
            stderr: e.to_string(),
        })??;

        let output = CommandOutput {
            success: raw.status.success(),
            status: raw.status.to_string(),
            stdout: String::from_utf8_lossy(&raw.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&raw.stderr).into_owned(),
        };

        if !output.stdout.is_empty() {
            debug!("{}", tail(&output.stdout, 100));
        }
        if !output.stderr.is_empty() {
            if self.is_benign(&output.stderr) {
                debug!("{}", output.stderr.trim_end());
            } else {
                error!("{}", output.stderr.trim_end());
            }
        }

        Ok(output)
    }

    fn is_benign(&self, stderr: &str) -> bool {
        let trimmed = stderr.trim();
        self.benign_stderr.iter().any(|b| b.trim() == trimmed)
    }

    fn require_success(
        program: &str,
        args: &[String],
        output: CommandOutput,
    ) -> ShrinkResult<CommandOutput> {
        if output.success {
            Ok(output)
        } else {
            Err(ShrinkError::Tooling {
                command: render_command(program, args),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

pub fn render_command(program: &str, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(shell_quote(program));
    parts.extend(args.iter().map(|a| shell_quote(a)));
    parts.join(" ")
}

/// Quote a string for display as a shell word, only when needed.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }

    if s.chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '=' | '/' | '.' | ':' | ','))
    {
        return s.to_string();
    }

    format!("'{}'", s.replace('\'', r"'\''"))
}

fn tail(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    match s.char_indices().nth(count - max_chars) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        vec![$(::std::string::ToString::to_string(&$arg)),*]
    };
}
