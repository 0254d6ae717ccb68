use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    Result,
    message::{Claim, Failure, QueuedMessage, WriteOutcome},
    types::{ClaimToken, MessageId, Recipient, RecipientClass, UserId},
};

/// Parameters of a [`QueueStore::claim_pending`] call.
#[derive(Debug, Clone)]
pub struct ClaimRequest<'a> {
    pub limit: usize,
    /// Ids already in flight in the caller's process.
    pub exclude: &'a [MessageId],
    /// How long the claim stays valid before another caller may take over.
    pub lease: Duration,
    /// Rows with at least this many errors are left for dead-lettering.
    pub retry_threshold: u32,
}

/// Lifecycle projection selected by a [`QueueFilter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageState {
    #[default]
    Any,
    /// Not sent, no errors yet.
    Pending,
    /// Not sent, at least one error.
    Failed,
    Sent,
}

/// Inclusive time bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeWindow {
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| at >= from) && self.to.is_none_or(|to| at <= to)
    }

    #[must_use]
    pub const fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

/// Read-only projection used by the replay interface.
///
/// The window applies to `sent_at` for sent messages and to `created_at`
/// otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueFilter {
    pub state: MessageState,
    pub class: Option<RecipientClass>,
    pub user: Option<UserId>,
    pub window: TimeWindow,
}

impl QueueFilter {
    #[must_use]
    pub fn matches(&self, message: &QueuedMessage) -> bool {
        let state = match self.state {
            MessageState::Any => true,
            MessageState::Pending => !message.is_sent() && message.error_count == 0,
            MessageState::Failed => message.is_failed(),
            MessageState::Sent => message.is_sent(),
        };

        let timestamp = message.sent_at.unwrap_or(message.created_at);

        state
            && self.class.is_none_or(|class| message.class() == class)
            && self.user.is_none_or(|user| message.recipient.user_id() == Some(user))
            && self.window.contains(timestamp)
    }
}

/// The durable source of truth for queued messages.
///
/// Every backend must guarantee that `claim_pending` never hands the same id
/// to two callers while the first claim is unexpired, and that writes
/// presenting a token which no longer owns the row have no effect.
#[async_trait]
pub trait QueueStore: Send + Sync + std::fmt::Debug {
    /// Insert a new message with `error_count = 0` and no `sent_at`.
    async fn enqueue(&self, recipient: Recipient, body: String) -> Result<MessageId>;

    /// Claim up to `request.limit` deliverable messages, oldest first.
    async fn claim_pending(&self, request: ClaimRequest<'_>) -> Result<Vec<Claim>>;

    /// Record a successful delivery. Repeat calls are `Unchanged`.
    async fn mark_sent(&self, id: MessageId, token: ClaimToken) -> Result<WriteOutcome>;

    /// Record a retryable failure, returning the new error count, or `None`
    /// when the token is stale.
    async fn record_failure(
        &self,
        id: MessageId,
        token: ClaimToken,
        failure: Failure,
    ) -> Result<Option<u32>>;

    /// Drop a claim without counting an error.
    async fn release(&self, id: MessageId, token: ClaimToken) -> Result<WriteOutcome>;

    /// Claim up to `request.limit` unsent messages that have reached
    /// `request.retry_threshold` and are not owned by any attempt. Used to
    /// dead-letter messages whose escalation was interrupted.
    async fn claim_exhausted(&self, request: ClaimRequest<'_>) -> Result<Vec<Claim>>;

    /// Remove a message only while `token` still owns it. `None` when the
    /// claim was lost or the message is gone.
    async fn remove_claimed(&self, id: MessageId, token: ClaimToken) -> Result<Option<QueuedMessage>>;

    /// Remove a message regardless of its state.
    async fn delete(&self, id: MessageId) -> Result<QueuedMessage>;

    /// Remove a message only if no unexpired claim owns it.
    async fn take(&self, id: MessageId) -> Result<QueuedMessage>;

    async fn get(&self, id: MessageId) -> Result<QueuedMessage>;

    /// All messages matching `filter`, in id order.
    async fn list(&self, filter: &QueueFilter) -> Result<Vec<QueuedMessage>>;

    /// Undelivered messages with at least one recorded failure.
    async fn list_failed(&self, filter: &QueueFilter) -> Result<Vec<QueuedMessage>> {
        let filter = QueueFilter {
            state: MessageState::Failed,
            ..filter.clone()
        };
        self.list(&filter).await
    }

    async fn list_sent(&self, filter: &QueueFilter) -> Result<Vec<QueuedMessage>> {
        let filter = QueueFilter {
            state: MessageState::Sent,
            ..filter.clone()
        };
        self.list(&filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(recipient: Recipient) -> QueuedMessage {
        QueuedMessage::new(MessageId::new(1), recipient, String::new(), Utc::now())
    }

    #[test]
    fn filter_by_state() {
        let mut msg = message(Recipient::direct("a@example.com"));
        let failed = QueueFilter {
            state: MessageState::Failed,
            ..QueueFilter::default()
        };
        assert!(!failed.matches(&msg));

        msg.error_count = 1;
        assert!(failed.matches(&msg));

        msg.sent_at = Some(Utc::now());
        assert!(!failed.matches(&msg));
    }

    #[test]
    fn filter_by_class_and_user() {
        let msg = message(Recipient::user(42));
        let users = QueueFilter {
            class: Some(RecipientClass::User),
            user: Some(UserId::new(42)),
            ..QueueFilter::default()
        };
        assert!(users.matches(&msg));

        let other = QueueFilter {
            user: Some(UserId::new(7)),
            ..QueueFilter::default()
        };
        assert!(!other.matches(&msg));
        assert!(!users.matches(&message(Recipient::user(0))));
    }

    #[test]
    fn window_is_inclusive() {
        let at = Utc::now();
        let window = TimeWindow {
            from: Some(at),
            to: Some(at),
        };
        assert!(window.contains(at));
        assert!(!window.contains(at + chrono::Duration::milliseconds(1)));
        assert!(TimeWindow::default().is_unbounded());
    }
}
