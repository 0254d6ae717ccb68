use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ClaimToken, MessageId, Recipient, RecipientClass};

/// A message waiting for, or having completed, delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: MessageId,
    pub recipient: Recipient,
    /// Fully rendered RFC 822 message, headers included.
    pub body: String,
    /// Consecutive failed attempts. Frozen once `sent_at` is set.
    pub error_count: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Earliest time the dispatcher may pick the message up again.
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl QueuedMessage {
    #[must_use]
    pub const fn new(id: MessageId, recipient: Recipient, body: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            recipient,
            body,
            error_count: 0,
            created_at,
            sent_at: None,
            last_error: None,
            next_attempt_at: None,
        }
    }

    #[must_use]
    pub const fn is_sent(&self) -> bool {
        self.sent_at.is_some()
    }

    #[must_use]
    pub const fn class(&self) -> RecipientClass {
        self.recipient.class()
    }

    /// Failed at least once and not yet delivered.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.sent_at.is_none() && self.error_count > 0
    }

    #[must_use]
    pub const fn is_exhausted(&self, retry_threshold: u32) -> bool {
        self.error_count >= retry_threshold
    }

    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// Time-bounded ownership of a message by one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: ClaimToken,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    #[must_use]
    pub fn is_held_by(&self, token: ClaimToken) -> bool {
        self.token == token
    }
}

/// A message handed to a dispatcher together with the token it must present
/// to record the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub message: QueuedMessage,
    pub lease: Lease,
}

impl Claim {
    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.message.id
    }

    #[must_use]
    pub const fn token(&self) -> ClaimToken {
        self.lease.token
    }
}

/// A retryable failure reported by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub error: String,
    pub retry_at: Option<DateTime<Utc>>,
    /// Keep the lease after recording, so the row stays owned while the
    /// caller dead-letters it.
    pub hold_claim: bool,
}

impl Failure {
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            retry_at: None,
            hold_claim: false,
        }
    }

    #[must_use]
    pub const fn retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.retry_at = Some(at);
        self
    }

    #[must_use]
    pub const fn holding_claim(mut self) -> Self {
        self.hold_claim = true;
        self
    }
}

/// Result of a claimant's write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write took effect.
    Applied,
    /// The row was already in the requested state.
    Unchanged,
    /// The token no longer owns the row, or the row is gone. Ignored.
    Stale,
}
