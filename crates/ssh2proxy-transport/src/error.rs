use std::time::Duration;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("Failed to open channel to {target}: {reason}")]
    Channel { target: String, reason: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled by shutdown")]
    Cancelled,

    #[error("Reconnect already in progress")]
    Reconnecting,

    #[error("Failed to reconnect after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: usize, last_error: String },

    #[error("Transport connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True when the operation stopped because the shutdown signal fired
    pub fn is_shutdown(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
