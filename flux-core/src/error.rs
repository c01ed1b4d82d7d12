/*!
Error types for the flux core engine.
*/

use flux_retry::RetryableError;
use thiserror::Error;

/// Result type used throughout the flux core.
pub type Result<T> = std::result::Result<T, FluxError>;

/// Errors that can occur during snapshot, purge and transfer operations.
#[derive(Error, Debug)]
pub enum FluxError {
    /// I/O errors while talking to a subprocess or pipe
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors for reports
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or incomplete configuration, raised before any side effect
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dataset or snapshot does not exist
    #[error("Dataset not found: {0}")]
    NotFound(String),

    /// Storage backend failures (enumerate, create, destroy, property lookup)
    #[error("Backend error: {0}")]
    Backend(String),

    /// A snapshot's creation time could not be resolved
    #[error("Cannot resolve creation time of {name}: {reason}")]
    Timestamp { name: String, reason: String },

    /// Spawning or streaming into the remote receiver failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote receiver exited unsuccessfully
    #[error("Remote receive on {target} exited with {status}")]
    ExitStatus { target: String, status: String },

    /// One or more datasets failed during a batch run
    #[error("{} dataset(s) failed: {}", failed.len(), failed.join("; "))]
    Batch { failed: Vec<String> },
}

impl FluxError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new backend error
    pub fn backend<S: Into<String>>(msg: S) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(name: S) -> Self {
        Self::NotFound(name.into())
    }

    /// Create a new timestamp resolution error
    pub fn timestamp<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Self::Timestamp {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl RetryableError for FluxError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            FluxError::Io(_) | FluxError::Transport(_) | FluxError::ExitStatus { .. }
        )
    }
}
