//! Error types for the daemon factory

use saltern_process::{ProcessError, ProcessResult};
use thiserror::Error;

/// Daemon startup and lifecycle errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Every startup attempt failed its readiness checks
    #[error("The {daemon_id} daemon did not start after {attempts} attempts{}",
        .last_result.as_ref().map(|r| format!(". Last output:\n{r}")).unwrap_or_default())]
    NotStarted {
        daemon_id: String,
        attempts: usize,
        /// Captured output of the final failed attempt, when available
        last_result: Option<ProcessResult>,
    },

    /// Event readiness checks were configured without an event listener
    #[error("The {daemon_id} daemon has event readiness checks but no event listener was provided")]
    ListenerRequired { daemon_id: String },

    /// The underlying process could not be managed
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Result type for daemon operations
pub type Result<T> = std::result::Result<T, DaemonError>;
