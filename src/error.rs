//! Error types for the platform and proxy supervisors

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while driving the backend platform CLI
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The platform CLI could not be found or did not answer the version probe
    #[error("{tool} is not installed or not on PATH. Please install it first.")]
    ToolUnavailable {
        tool: String,
        #[source]
        source: Box<ServiceError>,
    },

    /// The command ran but exited unsuccessfully
    #[error("Command failed: {command} (exit code: {code:?}){}", stderr_suffix(.stderr))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        /// Trimmed stdout, kept for callers that can still use partial output
        stdout: String,
        stderr: String,
    },

    /// The command could not be spawned or its output could not be collected
    #[error("Failed to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The platform did not report ready within the allotted time
    #[error("Timeout waiting for the platform to start after {waited:?}")]
    StartupTimeout { waited: Duration },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    }
}

impl ServiceError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::ToolUnavailable { .. } => ExitCode::from(69),
            Self::CommandFailed { .. } => ExitCode::from(70),
            Self::Spawn { .. } => ExitCode::from(71),
            Self::StartupTimeout { .. } => ExitCode::from(75),
            Self::Io { .. } => ExitCode::from(74),
        }
    }
}

/// Errors raised by the reverse-proxy supervisor
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to write proxy configuration at {path}: {source}")]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start proxy binary {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// A piped stdio stream was not available on the spawned child
    #[error("Proxy child process has no {stream} handle")]
    MissingStream { stream: &'static str },
}

impl ProxyError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::WriteConfig { .. } => ExitCode::from(74),
            Self::Spawn { .. } => ExitCode::from(71),
            Self::MissingStream { .. } => ExitCode::from(70),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_message_includes_stderr() {
        let err = ServiceError::CommandFailed {
            command: "supabase status".to_string(),
            code: Some(1),
            stdout: "API URL: http://localhost:54321".to_string(),
            stderr: "  no such container\n".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("supabase status"));
        assert!(msg.contains("Some(1)"));
        assert!(msg.ends_with(": no such container"));
        assert!(!msg.contains("API URL"));
    }

    #[test]
    fn test_command_failed_message_without_stderr() {
        let err = ServiceError::CommandFailed {
            command: "supabase stop".to_string(),
            code: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(
            err.to_string(),
            "Command failed: supabase stop (exit code: None)"
        );
    }

    #[test]
    fn test_startup_timeout_message() {
        let err = ServiceError::StartupTimeout {
            waited: Duration::from_secs(30),
        };
        assert_eq!(
            err.to_string(),
            "Timeout waiting for the platform to start after 30s"
        );
    }

    #[test]
    fn test_tool_unavailable_keeps_source() {
        use std::error::Error as _;

        let err = ServiceError::ToolUnavailable {
            tool: "supabase".to_string(),
            source: Box::new(ServiceError::Spawn {
                command: "supabase --version".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
        };
        assert!(err.to_string().starts_with("supabase is not installed"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_exit_codes_are_distinct_for_fatal_kinds() {
        let timeout = ServiceError::StartupTimeout {
            waited: Duration::ZERO,
        };
        let spawn = ProxyError::Spawn {
            binary: "caddy".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(timeout.exit_code(), ExitCode::from(75));
        assert_eq!(spawn.exit_code(), ExitCode::from(71));
    }
}
