// Error types for event tracking and fanout

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for eventline operations
pub type Result<T> = std::result::Result<T, EventlineError>;

/// Errors that can occur while tracking events or running fanout
#[derive(Debug, Error)]
pub enum EventlineError {
    /// Input or state transition rejected before anything was written
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Referenced record does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    /// Synchronous reaction to a freshly created event failed
    #[error("Event reaction failed: {0}")]
    Reaction(String),

    /// Storage backend error
    #[error("Store error: {0}")]
    Store(String),

    /// Outbound webhook delivery error
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// The task was reclaimed after this worker claimed it
    #[error("Claim lost on task {0}")]
    ClaimLost(Uuid),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EventlineError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        EventlineError::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        EventlineError::NotFound { kind, id }
    }

    /// Create a reaction error
    pub fn reaction(msg: impl Into<String>) -> Self {
        EventlineError::Reaction(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        EventlineError::Store(msg.into())
    }

    /// Create a delivery error
    pub fn delivery(msg: impl Into<String>) -> Self {
        EventlineError::Delivery(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        EventlineError::Configuration(msg.into())
    }

    /// Whether the error was raised by validation (caller mistake, not retryable)
    pub fn is_validation(&self) -> bool {
        matches!(self, EventlineError::Validation(_))
    }

    pub fn is_claim_lost(&self) -> bool {
        matches!(self, EventlineError::ClaimLost(_))
    }
}
