//! Grid-specific error types

use thiserror::Error;

/// Errors that can occur in grid engine operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GridError {
    /// Transient network failure or adapter timeout. Retried.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The exchange refused the order parameters. Never retried.
    #[error("Order rejected: {0}")]
    Rejection(String),

    #[error("Reconciliation mismatch: {0}")]
    ReconciliationMismatch(String),

    #[error("Invalid grid configuration: {0}")]
    FatalConfig(String),

    #[error("Protection invariant violated: {0}")]
    ProtectionInvariantViolation(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Operation not supported by exchange adapter: {0}")]
    Unsupported(String),

    #[error("Event channel closed: {0}")]
    ChannelClosed(String),

    /// Stop-loss closed the grid out below the APR threshold
    #[error("Stopped out: {0}")]
    StoppedOut(String),

    #[error("Position anomaly: {0}")]
    PositionAnomaly(String),
}

impl GridError {
    /// Whether the retry wrapper may try the operation again
    pub fn is_retryable(&self) -> bool {
        matches!(self, GridError::Connectivity(_))
    }

    /// Errors that must halt order placement instead of being logged and skipped
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GridError::FatalConfig(_)
                | GridError::ProtectionInvariantViolation(_)
                | GridError::StoppedOut(_)
                | GridError::PositionAnomaly(_)
        )
    }
}

impl From<config::ConfigError> for GridError {
    fn from(err: config::ConfigError) -> Self {
        GridError::FatalConfig(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for GridError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        GridError::Connectivity(format!("adapter call timed out: {}", err))
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;
