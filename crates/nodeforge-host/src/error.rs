//! Error types for host bindings

use nodeforge_workflow::PollError;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for host operations
#[derive(Debug, Error)]
pub enum HostError {
    /// The program could not be started
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran and exited unsuccessfully
    #[error("'{command}' exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// The operation was cancelled
    #[error("{0} was cancelled")]
    Cancelled(String),

    /// Filesystem error
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status
    #[error("GET {url} returned {status}")]
    HttpStatus { url: String, status: u16 },

    /// Downloaded artifact did not match its expected digest
    #[error("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    Checksum {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Output of a command could not be understood
    #[error("unexpected output from '{command}': {reason}")]
    Parse { command: String, reason: String },

    /// A readiness wait did not succeed
    #[error("wait failed: {0}")]
    Poll(#[from] PollError),

    /// Failure injected by a fake binding
    #[error("injected failure in {0}")]
    Injected(String),
}

impl HostError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HostError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            HostError::Cancelled(_) | HostError::Poll(PollError::Cancelled)
        )
    }
}

/// Result type for host operations
pub type Result<T> = std::result::Result<T, HostError>;
