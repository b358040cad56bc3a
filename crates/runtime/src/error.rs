use std::{path::PathBuf, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime binary not found; searched: {}", display_paths(.searched))]
    BinaryNotFound { searched: Vec<PathBuf> },

    #[error("workload image {image} is unavailable: {reason}")]
    ImageUnavailable { image: String, reason: String },

    #[error("`{command}` exited with {}: {}", display_exit(.exit_code), .stderr.trim())]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("`{command}` timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse runtime output: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Message(String),
}

impl RuntimeError {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Exit code of a failed command, if this is one.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    /// Whether the runtime reported that the named container does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        let Self::CommandFailed { stderr, .. } = self else {
            return false;
        };
        let stderr = stderr.to_ascii_lowercase();
        stderr.contains("no such container") || stderr.contains("no container with name")
    }
}

fn display_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_string(),
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "(nothing)".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl podvisor_common::FromMessage for RuntimeError {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Error = RuntimeError;
pub type Result<T> = std::result::Result<T, RuntimeError>;

podvisor_common::impl_context!();

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn failed(stderr: &str) -> RuntimeError {
        RuntimeError::CommandFailed {
            command: "podman rm desk".into(),
            exit_code: Some(1),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn not_found_matches_podman_and_docker_wording() {
        assert!(
            failed("Error: no container with name or ID \"desk\" found: no such container")
                .is_not_found()
        );
        assert!(failed("Error response from daemon: No such container: desk").is_not_found());
        assert!(!failed("Error: container is running").is_not_found());
        assert!(!RuntimeError::Parse("x".into()).is_not_found());
    }

    #[test]
    fn command_failed_display_includes_exit_code_and_stderr() {
        let err = failed("boom\n");
        assert_eq!(err.to_string(), "`podman rm desk` exited with exit code 1: boom");
        assert_eq!(err.exit_code(), Some(1));

        let killed = RuntimeError::CommandFailed {
            command: "podman run".into(),
            exit_code: None,
            stderr: String::new(),
        };
        assert!(killed.to_string().contains("a signal"));
    }

    #[test]
    fn binary_not_found_lists_candidates() {
        let err = RuntimeError::BinaryNotFound {
            searched: vec![PathBuf::from("/a/podman"), PathBuf::from("/b/podman")],
        };
        assert!(err.to_string().ends_with("/a/podman, /b/podman"));
    }

    #[test]
    fn option_context_builds_message() {
        let none: Option<u8> = None;
        let err = none.context("no bundle directory").unwrap_err();
        assert_eq!(err.to_string(), "no bundle directory");
    }
}
