//! Error types for queue storage.

use std::io;

use thiserror::Error;

use crate::types::MessageId;

/// Storage-layer failure, surfaced to every caller of a [`crate::QueueStore`].
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Message not found: {0}")]
    NotFound(MessageId),

    /// The message is owned by an unexpired claim.
    #[error("Message {0} is being delivered")]
    Claimed(MessageId),

    #[error("Queue validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Queue capacity exceeded: {0} messages")]
    CapacityExceeded(usize),

    #[error("Timed out waiting for queue lock at {0}")]
    LockTimeout(String),

    /// Internal error (lock poisoning, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Corrupted queue record {path}: {reason}")]
    Corrupted { path: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Queue path is not a directory: {0}")]
    NotDirectory(String),

    #[error("Invalid queue path: {0}")]
    InvalidPath(String),
}

impl QueueError {
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<bincode::error::EncodeError> for QueueError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Serialization(e.into())
    }
}

impl From<bincode::error::DecodeError> for QueueError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Serialization(e.into())
    }
}

impl<T> From<std::sync::PoisonError<T>> for QueueError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
