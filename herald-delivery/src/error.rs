//! Typed error handling for delivery operations.
//!
//! Provider failures are split into:
//! - Permanent failures: the address or content can never succeed, the
//!   message is dead-lettered without touching its error count
//! - Temporary failures: network or provider-side trouble, counted against
//!   the retry threshold

use herald_queue::{MessageId, QueueError, UserId};
use thiserror::Error;

/// Outcome of a failed [`crate::Provider::send`] call.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),
}

#[derive(Debug, Error)]
pub enum PermanentError {
    /// The provider rejected the recipient address.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// The provider refused the message content.
    #[error("Message rejected: {0}")]
    MessageRejected(String),

    /// The provider refused our credentials or identity.
    #[error("Not authorised: {0}")]
    NotAuthorised(String),
}

#[derive(Debug, Error)]
pub enum TemporaryError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The provider asked us to come back later.
    #[error("Server busy: {0}")]
    ServerBusy(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// No definitive answer within the send timeout.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The provider answered with something we could not interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<std::io::Error> for DeliveryError {
    fn from(error: std::io::Error) -> Self {
        Self::Temporary(TemporaryError::Io(error))
    }
}

/// Misconfigured provider or dead-letter sink. Never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Unknown provider '{name}', registered providers: {available}")]
    UnknownProvider { name: String, available: String },

    #[error("Unknown dead-letter sink '{name}', registered sinks: {available}")]
    UnknownSink { name: String, available: String },

    #[error("{component}: missing required setting '{key}'")]
    MissingSetting { component: String, key: String },

    #[error("{component}: invalid value for '{key}': {reason}")]
    InvalidSetting {
        component: String,
        key: String,
        reason: String,
    },

    #[error("Invalid dispatcher configuration: {0}")]
    Dispatcher(String),
}

/// Failure to map a queued message to a final address.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The recipient can never be resolved: user gone, no usable address.
    #[error("Unresolved recipient: {0}")]
    Unresolved(String),

    /// The user directory itself failed; a later attempt may succeed.
    #[error("User directory unavailable: {0}")]
    Directory(String),
}

impl ResolveError {
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Unresolved(_))
    }
}

/// Failure reported by a [`crate::UserDirectory`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("User {0} not found")]
    NotFound(UserId),

    #[error("{0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupted dead-letter store {path}: {reason}")]
    Corrupted { path: String, reason: String },

    #[error("Dead-letter record not found: {0}")]
    NotFound(MessageId),

    /// The shared lock on the sink's storage could not be taken.
    #[error("Dead-letter lock error: {0}")]
    Lock(#[from] QueueError),
}

impl DeadLetterError {
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for DeadLetterError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Errors surfaced to operators by [`crate::ReplayService`].
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Message {0} not found")]
    NotFound(MessageId),

    #[error("Message {0} has already been sent")]
    AlreadySent(MessageId),

    #[error("Message {0} is being delivered right now, try again shortly")]
    InFlight(MessageId),

    #[error("Invalid page: {0}")]
    InvalidPage(String),

    #[error("No message ids given")]
    NoIds,

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Dead-letter error: {0}")]
    DeadLetter(#[from] DeadLetterError),

    #[error("User directory unavailable: {0}")]
    Directory(String),
}
