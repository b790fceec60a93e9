//! Shared error types for the Recall system.

use thiserror::Error;

/// Top-level error type for the Recall system.
#[derive(Error, Debug)]
pub enum RecallError {
    /// A referenced memory, relationship or workflow does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What kind of entity was looked up.
        kind: &'static str,
        /// The id that was looked up.
        id: String,
    },

    /// Another workflow already holds the workspace's active pointer.
    #[error("Workflow already active: {0}")]
    AlreadyActive(String),

    /// The action needs an active workflow and none is active.
    #[error("No active workflow")]
    NoActiveWorkflow,

    /// The entity is in an invalid state for the requested operation.
    #[error("Invalid state '{current}' for operation '{operation}'")]
    InvalidState {
        /// The current state of the entity.
        current: String,
        /// The operation that was attempted.
        operation: String,
    },

    /// Malformed input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A storage substrate call failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An embedding provider failed or produced a malformed vector.
    #[error("Provider error: {0}")]
    Provider(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RecallError {
    /// Shorthand for a [`RecallError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Alias for Result with RecallError.
pub type RecallResult<T> = Result<T, RecallError>;
