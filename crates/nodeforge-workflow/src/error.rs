//! Error types for step and workflow execution
//!
//! Every expected failure of a step ends up as a [`StepError`]. Its
//! [`ErrorKind`] tells callers which phase failed without having to match
//! on message text.

use crate::poller::PollError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Discriminant for the phase in which a step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Download,
    Installation,
    Configuration,
    Cleanup,
    IllegalArgument,
    IllegalState,
    Timeout,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Download => "download",
            ErrorKind::Installation => "installation",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Cleanup => "cleanup",
            ErrorKind::IllegalArgument => "illegal argument",
            ErrorKind::IllegalState => "illegal state",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Error type for step execution and rollback
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StepError {
    /// Fetching an artifact failed
    #[error("download failed: {0}")]
    Download(String),

    /// Putting a resource in place failed
    #[error("installation failed: {0}")]
    Installation(String),

    /// Writing or removing configuration failed
    #[error("configuration failed: {0}")]
    Configuration(String),

    /// Removing temporary or installed artifacts failed
    #[error("cleanup failed: {0}")]
    Cleanup(String),

    /// Bad input to a builder
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// A precondition was violated
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A bounded wait expired
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The run was cancelled
    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    /// Build an error of the given kind.
    ///
    /// `Timeout` carries no duration here; use [`StepError::Timeout`]
    /// directly when one is known.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Download => StepError::Download(message),
            ErrorKind::Installation => StepError::Installation(message),
            ErrorKind::Configuration => StepError::Configuration(message),
            ErrorKind::Cleanup => StepError::Cleanup(message),
            ErrorKind::IllegalArgument => StepError::IllegalArgument(message),
            ErrorKind::IllegalState => StepError::IllegalState(message),
            ErrorKind::Timeout => StepError::Timeout(Duration::ZERO),
            ErrorKind::Cancelled => StepError::Cancelled,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Download(_) => ErrorKind::Download,
            StepError::Installation(_) => ErrorKind::Installation,
            StepError::Configuration(_) => ErrorKind::Configuration,
            StepError::Cleanup(_) => ErrorKind::Cleanup,
            StepError::IllegalArgument(_) => ErrorKind::IllegalArgument,
            StepError::IllegalState(_) => ErrorKind::IllegalState,
            StepError::Timeout(_) => ErrorKind::Timeout,
            StepError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<PollError> for StepError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::Timeout(after) => StepError::Timeout(after),
            PollError::Cancelled => StepError::Cancelled,
        }
    }
}

/// Result type for step operations
pub type Result<T> = std::result::Result<T, StepError>;

/// Error type for workflow persistence
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// State store error
    #[error("state store error: {0}")]
    StateStore(String),

    /// Snapshot does not match the workflow it is restored into
    #[error("snapshot for '{found}' cannot be restored into workflow '{expected}'")]
    SnapshotMismatch { expected: String, found: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
