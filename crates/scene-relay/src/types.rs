//! Core data types shared by the caption, prompt, and generation stages.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result of a generation child process that ran to a successful exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOutcome {
    pub exit_code: i32,
    pub lines_forwarded: usize,
    pub elapsed_ms: u64,
}

/// Everything one pipeline run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Absent when the caption was supplied rather than produced from an image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
    pub caption: String,
    pub prompt: String,
    pub outcome: StreamOutcome,
}

/// Lifecycle of the generation child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running { pid: Option<u32> },
    Exited { code: Option<i32> },
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::NotStarted => write!(f, "not-started"),
            ProcessState::Running { pid: Some(pid) } => write!(f, "running (pid {pid})"),
            ProcessState::Running { pid: None } => write!(f, "running"),
            ProcessState::Exited { code: Some(code) } => write!(f, "exited ({code})"),
            ProcessState::Exited { code: None } => write!(f, "exited (signal)"),
        }
    }
}

/// Errors that can occur anywhere in the relay.
#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("Image not found: {}", .0.display())]
    ImageNotFound(PathBuf),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Model not available: {0}")]
    ModelNotAvailable(String),

    #[error("Caption error: {0}")]
    Caption(String),

    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process exited with code {code} before producing output")]
    ProcessFailed { code: i32 },

    #[error("Process exited with code {code} after {lines_forwarded} lines; output is incomplete")]
    PartialOutput { code: i32, lines_forwarded: usize },

    #[error("Process terminated abnormally ({status}) after {lines_forwarded} lines")]
    ProcessCrashed {
        status: String,
        lines_forwarded: usize,
    },

    #[error("Process timed out after {}s ({lines_forwarded} lines forwarded)", .after.as_secs_f32())]
    TimedOut {
        after: Duration,
        lines_forwarded: usize,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    /// Process exit code a front end should use for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            RelayError::ImageNotFound(_)
            | RelayError::Image(_)
            | RelayError::InvalidInput(_)
            | RelayError::Config(_)
            | RelayError::Json(_) => 2,
            RelayError::ModelNotAvailable(_) | RelayError::Caption(_) => 3,
            RelayError::ExecutableNotFound(_) | RelayError::Spawn { .. } => 4,
            RelayError::ProcessFailed { .. }
            | RelayError::PartialOutput { .. }
            | RelayError::ProcessCrashed { .. } => 5,
            RelayError::TimedOut { .. } => 6,
            RelayError::Io(_) => 1,
        }
    }

    /// Whether the child process started at all before this error.
    pub fn process_started(&self) -> bool {
        matches!(
            self,
            RelayError::ProcessFailed { .. }
                | RelayError::PartialOutput { .. }
                | RelayError::ProcessCrashed { .. }
                | RelayError::TimedOut { .. }
        )
    }
}

/// Convenience result type.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_distinguish_start_and_run_failures() {
        let not_started = RelayError::ExecutableNotFound("llama-cli".into());
        let failed = RelayError::ProcessFailed { code: 1 };
        assert_ne!(not_started.exit_code(), failed.exit_code());
        assert!(!not_started.process_started());
        assert!(failed.process_started());
    }

    #[test]
    fn test_timeout_message() {
        let err = RelayError::TimedOut {
            after: Duration::from_millis(1500),
            lines_forwarded: 3,
        };
        assert_eq!(
            err.to_string(),
            "Process timed out after 1.5s (3 lines forwarded)"
        );
    }

    #[test]
    fn test_process_state_display() {
        assert_eq!(ProcessState::NotStarted.to_string(), "not-started");
        assert_eq!(
            ProcessState::Exited { code: Some(0) }.to_string(),
            "exited (0)"
        );
    }
}
