//! Error types for process supervision

use std::io;

use thiserror::Error;

use crate::result::ProcessResult;

/// Process supervision errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The program could not be resolved to an existing executable
    #[error("The script {program:?} does not exist or could not be found on PATH")]
    ScriptNotFound { program: String },

    /// Failed to spawn the process
    #[error("Failed to spawn process: {0}")]
    Spawn(#[from] io::Error),

    /// A run-to-completion invocation exceeded its deadline.
    ///
    /// The underlying process tree was terminated before this error was
    /// raised; whatever output had been captured travels with it.
    #[error("Timed out after {seconds} seconds\n{result}")]
    Timeout { seconds: u64, result: ProcessResult },

    /// A setup-time subprocess step exited non-zero
    #[error("{context}\n{result}")]
    Failed {
        context: String,
        result: ProcessResult,
    },

    /// The handle was never started
    #[error("The process was never started")]
    NotStarted,

    /// Failed to read back captured output
    #[error("Failed to read captured process output: {0}")]
    Capture(io::Error),
}

impl ProcessError {
    /// The partial result carried by `Timeout`/`Failed`, if any
    pub fn result(&self) -> Option<&ProcessResult> {
        match self {
            Self::Timeout { result, .. } | Self::Failed { result, .. } => Some(result),
            _ => None,
        }
    }
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
