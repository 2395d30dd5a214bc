use std::io;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time;

use super::{ProbeKind, ProbeResult};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// First non-empty stderr line, falling back to the exit code.
    pub fn error_summary(&self) -> String {
        self.stderr
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("exited with code {}", self.exit_code))
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{program} not found")]
    NotFound { program: String },
    #[error("permission denied running {program}")]
    PermissionDenied { program: String },
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl CommandError {
    /// Turns a launch failure into a failed probe result. A missing binary
    /// is reported as an unavailable facility with an install hint.
    pub fn into_result(self, kind: ProbeKind, target: Option<String>, install_hint: &str) -> ProbeResult {
        match self {
            CommandError::NotFound { program } => {
                ProbeResult::unavailable(kind, target, &program, install_hint)
            }
            CommandError::Timeout { .. } => ProbeResult::timed_out(kind, target),
            other => ProbeResult::failure(kind, target, other.to_string()),
        }
    }
}

/// Runs an external tool with a C locale and a hard deadline. The child is
/// killed when the deadline passes.
pub async fn run_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let child = Command::new(program)
        .args(args)
        .env("LC_ALL", "C")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| classify_spawn_error(program, err))?;

    // Dropping the wait future on timeout drops the child, which kills it.
    let output = match time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(CommandError::Io {
                program: program.to_string(),
                source,
            })
        }
        Err(_elapsed) => {
            return Err(CommandError::Timeout {
                program: program.to_string(),
                timeout,
            })
        }
    };

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn classify_spawn_error(program: &str, err: io::Error) -> CommandError {
    let program = program.to_string();
    match err.kind() {
        io::ErrorKind::NotFound => CommandError::NotFound { program },
        io::ErrorKind::PermissionDenied => CommandError::PermissionDenied { program },
        _ => CommandError::Io {
            program,
            source: err,
        },
    }
}
