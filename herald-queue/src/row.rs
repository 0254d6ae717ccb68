//! Claim state machine shared by every backend.
//!
//! A [`Row`] is what a backend persists: the message plus the lease of the
//! attempt currently working on it. Backends load rows, apply one of the
//! transitions below under their own mutual exclusion, and write the rows
//! back. Keeping the rules here means the memory and file stores cannot
//! disagree about claimability or stale writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    message::{Claim, Failure, Lease, QueuedMessage, WriteOutcome},
    types::{ClaimToken, MessageId},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub message: QueuedMessage,
    pub lease: Option<Lease>,
}

impl Row {
    #[must_use]
    pub const fn new(message: QueuedMessage) -> Self {
        Self {
            message,
            lease: None,
        }
    }

    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.message.id
    }

    /// Whether an attempt currently owns the row.
    #[must_use]
    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.lease.is_some_and(|lease| !lease.is_expired(now))
    }

    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>, retry_threshold: u32) -> bool {
        !self.message.is_sent()
            && !self.message.is_exhausted(retry_threshold)
            && self.message.is_due(now)
            && !self.is_claimed(now)
    }

    /// Exhausted, unsent and not owned by anyone: waiting to be dead-lettered.
    #[must_use]
    pub fn is_escalatable(&self, now: DateTime<Utc>, retry_threshold: u32) -> bool {
        !self.message.is_sent() && self.message.is_exhausted(retry_threshold) && !self.is_claimed(now)
    }

    /// Take a fresh lease, replacing any expired one.
    pub fn claim(&mut self, now: DateTime<Utc>, ttl: chrono::Duration) -> Claim {
        let lease = Lease {
            token: ClaimToken::generate(),
            expires_at: now + ttl,
        };
        self.lease = Some(lease);

        Claim {
            message: self.message.clone(),
            lease,
        }
    }

    /// Whether `token` is the current lease, expired or not.
    #[must_use]
    pub fn owned_by(&self, token: ClaimToken) -> bool {
        self.lease.is_some_and(|lease| lease.is_held_by(token))
    }

    pub fn mark_sent(&mut self, token: ClaimToken, now: DateTime<Utc>) -> WriteOutcome {
        if self.message.is_sent() {
            return WriteOutcome::Unchanged;
        }

        if !self.owned_by(token) {
            return WriteOutcome::Stale;
        }

        self.message.sent_at = Some(now);
        self.message.next_attempt_at = None;
        self.lease = None;
        WriteOutcome::Applied
    }

    /// Returns the new error count, or `None` when the write is stale.
    pub fn record_failure(&mut self, token: ClaimToken, failure: Failure) -> Option<u32> {
        if self.message.is_sent() || !self.owned_by(token) {
            return None;
        }

        self.message.error_count = self.message.error_count.saturating_add(1);
        self.message.last_error = Some(failure.error);
        self.message.next_attempt_at = failure.retry_at;
        if !failure.hold_claim {
            self.lease = None;
        }
        Some(self.message.error_count)
    }

    pub fn release(&mut self, token: ClaimToken) -> WriteOutcome {
        if !self.owned_by(token) {
            return WriteOutcome::Stale;
        }

        self.lease = None;
        WriteOutcome::Applied
    }
}

/// Which rows a claim call may hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Due for a delivery attempt.
    Deliverable,
    /// Exhausted and waiting for dead-lettering.
    Exhausted,
}

/// Pick at most `limit` rows matching `selection`, oldest first.
///
/// Returns indices into `rows` ordered by `(created_at, id)`.
pub fn select_claimable(
    rows: &[&Row],
    selection: Selection,
    now: DateTime<Utc>,
    retry_threshold: u32,
    exclude: &[MessageId],
    limit: usize,
) -> Vec<usize> {
    let mut eligible: Vec<usize> = rows
        .iter()
        .enumerate()
        .filter(|(_, row)| {
            let wanted = match selection {
                Selection::Deliverable => row.is_claimable(now, retry_threshold),
                Selection::Exhausted => row.is_escalatable(now, retry_threshold),
            };
            wanted && !exclude.contains(&row.id())
        })
        .map(|(index, _)| index)
        .collect();

    eligible.sort_by_key(|&index| (rows[index].message.created_at, rows[index].id()));
    eligible.truncate(limit);
    eligible
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::Recipient;

    fn row(id: u64, created_offset_secs: i64) -> Row {
        let created = DateTime::from_timestamp(1_700_000_000 + created_offset_secs, 0).unwrap_or_default();
        Row::new(QueuedMessage::new(
            MessageId::new(id),
            Recipient::direct("a@example.com"),
            "To: a@example.com\r\n\r\nhi".to_string(),
            created,
        ))
    }

    #[test]
    fn claim_blocks_until_lease_expires() {
        let now = Utc::now();
        let mut row = row(1, 0);
        assert!(row.is_claimable(now, 5));

        let claim = row.claim(now, Duration::seconds(30));
        assert!(!row.is_claimable(now, 5));
        assert!(row.is_claimable(now + Duration::seconds(31), 5));
        assert_eq!(claim.id(), MessageId::new(1));
    }

    #[test]
    fn mark_sent_is_idempotent_and_token_checked() {
        let now = Utc::now();
        let mut row = row(1, 0);
        let stale = row.claim(now, Duration::seconds(30)).token();
        let live = row.claim(now + Duration::seconds(60), Duration::seconds(30)).token();

        assert_eq!(row.mark_sent(stale, now), WriteOutcome::Stale);
        assert!(row.message.sent_at.is_none());

        assert_eq!(row.mark_sent(live, now), WriteOutcome::Applied);
        assert_eq!(row.mark_sent(live, now), WriteOutcome::Unchanged);
        assert_eq!(row.message.sent_at, Some(now));
        assert!(row.lease.is_none());
    }

    #[test]
    fn failure_increments_and_releases() {
        let now = Utc::now();
        let mut row = row(1, 0);
        let token = row.claim(now, Duration::seconds(30)).token();

        let retry_at = now + Duration::seconds(60);
        let count = row.record_failure(token, Failure::new("421 busy").retry_at(retry_at));
        assert_eq!(count, Some(1));
        assert_eq!(row.message.last_error.as_deref(), Some("421 busy"));
        assert!(row.lease.is_none());

        // Not due yet, then due.
        assert!(!row.is_claimable(now, 5));
        assert!(row.is_claimable(retry_at, 5));

        // The released token cannot write again.
        assert_eq!(row.record_failure(token, Failure::new("again")), None);
        assert_eq!(row.message.error_count, 1);
    }

    #[test]
    fn sent_rows_freeze_error_count() {
        let now = Utc::now();
        let mut row = row(1, 0);
        let token = row.claim(now, Duration::seconds(30)).token();
        row.mark_sent(token, now);

        assert_eq!(row.record_failure(token, Failure::new("late")), None);
        assert_eq!(row.message.error_count, 0);
        assert!(!row.is_claimable(now, 5));
    }

    #[test]
    fn exhausted_rows_are_not_claimable() {
        let now = Utc::now();
        let mut row = row(1, 0);
        for _ in 0..3 {
            let token = row.claim(now, Duration::seconds(30)).token();
            row.record_failure(token, Failure::new("timeout"));
        }

        assert!(!row.is_claimable(now, 3));
        assert!(row.is_claimable(now, 4));
    }

    #[test]
    fn release_keeps_error_count() {
        let now = Utc::now();
        let mut row = row(1, 0);
        let token = row.claim(now, Duration::seconds(30)).token();

        assert_eq!(row.release(token), WriteOutcome::Applied);
        assert_eq!(row.release(token), WriteOutcome::Stale);
        assert_eq!(row.message.error_count, 0);
        assert!(row.is_claimable(now, 5));
    }

    #[test]
    fn selection_is_fifo_with_id_tiebreak() {
        let rows = [row(3, 10), row(1, 20), row(2, 10), row(4, 0)];
        let refs: Vec<&Row> = rows.iter().collect();

        let picked = select_claimable(&refs, Selection::Deliverable, Utc::now(), 5, &[MessageId::new(4)], 2);
        let ids: Vec<u64> = picked.into_iter().map(|i| rows[i].id().get()).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn exhausting_failure_can_keep_the_lease() {
        let now = Utc::now();
        let mut row = row(1, 0);
        let token = row.claim(now, Duration::seconds(30)).token();

        let count = row.record_failure(token, Failure::new("421 busy").holding_claim());
        assert_eq!(count, Some(1));
        assert!(row.is_claimed(now));
        assert!(row.owned_by(token));
        assert!(!row.is_escalatable(now, 1));

        assert_eq!(row.release(token), WriteOutcome::Applied);
        assert!(row.is_escalatable(now, 1));
        assert!(!row.is_claimable(now, 1));
    }

    #[test]
    fn exhausted_selection_skips_deliverable_rows() {
        let now = Utc::now();
        let mut exhausted = row(1, 0);
        exhausted.message.error_count = 3;
        let rows = [exhausted, row(2, 0)];
        let refs: Vec<&Row> = rows.iter().collect();

        assert_eq!(select_claimable(&refs, Selection::Exhausted, now, 3, &[], 10), vec![0]);
        assert_eq!(select_claimable(&refs, Selection::Deliverable, now, 3, &[], 10), vec![1]);
    }
}
