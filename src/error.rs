//! Error types shared by the store boundary and the sync components.

use thiserror::Error;

/// Errors reported by a [`crate::store::Store`] implementation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// Transient network or backend failure
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// No document at the given path
    #[error("Document not found: {0}")]
    NotFound(String),

    /// A create-if-absent write found an existing document
    #[error("Document already exists: {0}")]
    AlreadyExists(String),

    /// A conditional update saw a different value than expected
    #[error("Precondition failed on {path}: field {field}")]
    PreconditionFailed { path: String, field: String },

    /// Stored data did not match the expected record shape
    #[error("Malformed document {path}: {reason}")]
    Malformed { path: String, reason: String },
}

/// Errors surfaced to callers of the chat components.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChatError {
    /// Empty message content, malformed identifier and similar
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Caller lacks the ownership the operation needs
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Transient store or network failure
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Conversation, message or identity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Anything else the store reported
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl ChatError {
    /// Whether retrying the same call later might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::Unavailable(_))
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => ChatError::Unavailable(reason),
            StoreError::NotFound(path) => ChatError::NotFound(path),
            other => ChatError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
