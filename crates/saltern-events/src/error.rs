//! Error types for the event listener service

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Event listener and wire protocol errors
#[derive(Debug, Error)]
pub enum EventError {
    /// The receiver failed to signal readiness in time
    #[error("The event listener failed to signal readiness within {0:?}")]
    NotStarted(Duration),

    /// The listener is stopped; stopped is a terminal state
    #[error("The event listener has been stopped and cannot be restarted")]
    Stopped,

    /// I/O failure on the event endpoint
    #[error("Event endpoint I/O failure: {0}")]
    Io(#[from] io::Error),

    /// An event frame that could not be decoded
    #[error("Malformed event frame: {0}")]
    Malformed(String),

    /// An event frame that could not be encoded
    #[error("Failed to encode event frame: {0}")]
    Encode(String),

    /// A listener address that could not be parsed
    #[error("Invalid event listener address {0:?}")]
    Address(String),
}

/// Result type for event operations
pub type Result<T> = std::result::Result<T, EventError>;
