//! External command execution
//!
//! Every interaction with the platform CLI and the container tool goes
//! through [`CommandRunner`], so the supervisors can be driven by a scripted
//! runner in tests.

use crate::error::ServiceError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, warn};

/// A fully described command invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute (resolved through PATH)
    pub program: String,
    /// Arguments passed to the program
    pub args: Vec<String>,
    /// Working directory for the child
    pub cwd: Option<PathBuf>,
    /// Extra environment variables layered over the inherited environment
    pub env: HashMap<String, String>,
    /// Do not log stderr or failures above debug level
    pub suppress_errors: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn suppress_errors(mut self, suppress: bool) -> Self {
        self.suppress_errors = suppress;
        self
    }

    /// Human-readable command line, used in logs and error messages
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the child was terminated by a signal
    pub status_code: Option<i32>,
    /// Trimmed standard output
    pub stdout: String,
    /// Raw standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }
}

/// Runs external commands to completion.
///
/// Implementations return [`ServiceError::Spawn`] when the program cannot be
/// executed and [`ServiceError::CommandFailed`] when it exits unsuccessfully.
/// A spec with `suppress_errors` set gets its output back whatever the exit
/// status; only a spawn failure is an error then.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ServiceError>;
}

/// [`CommandRunner`] backed by real child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ServiceError> {
        let command_line = spec.display();
        debug!(command = %command_line, cwd = ?spec.cwd, "Executing command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) => {
                if spec.suppress_errors {
                    debug!(command = %command_line, error = %e, "Command could not be executed");
                } else {
                    error!(command = %command_line, error = %e, "Error executing command");
                }
                return Err(ServiceError::Spawn {
                    command: command_line,
                    source: e,
                });
            }
        };

        let result = CommandOutput {
            status_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        debug!(command = %command_line, stdout = %result.stdout, "Command stdout");

        if !result.stderr.trim().is_empty() && !spec.suppress_errors {
            warn!(command = %command_line, stderr = %result.stderr.trim(), "Command stderr");
        }

        if !result.success() {
            if spec.suppress_errors {
                debug!(
                    command = %command_line,
                    code = ?result.status_code,
                    "Command exited unsuccessfully, returning its output"
                );
                return Ok(result);
            }
            error!(
                command = %command_line,
                code = ?result.status_code,
                "Command exited unsuccessfully"
            );
            return Err(ServiceError::CommandFailed {
                command: command_line,
                code: result.status_code,
                stdout: result.stdout,
                stderr: result.stderr,
            });
        }

        Ok(result)
    }
}
