use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::Utc;
use herald_common::audit;

use crate::{
    QueueError, Result,
    message::{Claim, Failure, QueuedMessage, WriteOutcome},
    row::{Row, Selection, select_claimable},
    store::{ClaimRequest, QueueFilter, QueueStore},
    types::{ClaimToken, MessageId, Recipient},
};

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<MessageId, Row>,
    last_id: u64,
}

/// In-memory queue store
///
/// Rows live in a `BTreeMap` behind a single mutex, so every operation is
/// atomic with respect to every other. Intended for tests and for
/// deployments where losing the queue on restart is acceptable.
///
/// # Capacity Management
/// An optional capacity bounds the number of stored rows (sent rows
/// included). `enqueue` fails with [`QueueError::CapacityExceeded`] once it
/// is reached.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    table: Arc<Mutex<Table>>,
    capacity: Option<usize>,
}

impl MemoryQueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Number of stored rows. Recovers the data if the lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .rows
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn claim(&self, request: &ClaimRequest<'_>, selection: Selection) -> Result<Vec<Claim>> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(request.lease)
            .map_err(|e| QueueError::Internal(format!("Invalid claim lease: {e}")))?;

        let mut table = self.table.lock()?;
        let ids: Vec<MessageId> = {
            let rows: Vec<&Row> = table.rows.values().collect();
            select_claimable(&rows, selection, now, request.retry_threshold, request.exclude, request.limit)
                .into_iter()
                .map(|index| rows[index].id())
                .collect()
        };

        Ok(ids
            .into_iter()
            .filter_map(|id| table.rows.get_mut(&id).map(|row| row.claim(now, ttl)))
            .collect())
    }

    fn with_row<T>(&self, id: MessageId, f: impl FnOnce(&mut Row) -> T) -> Result<Option<T>> {
        let mut table = self.table.lock()?;
        Ok(table.rows.get_mut(&id).map(f))
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, recipient: Recipient, body: String) -> Result<MessageId> {
        let mut table = self.table.lock()?;

        if let Some(capacity) = self.capacity
            && table.rows.len() >= capacity
        {
            return Err(QueueError::CapacityExceeded(capacity));
        }

        table.last_id += 1;
        let id = MessageId::new(table.last_id);
        audit::log_enqueued(id.get(), &recipient.to_string(), body.len());
        table
            .rows
            .insert(id, Row::new(QueuedMessage::new(id, recipient, body, Utc::now())));

        Ok(id)
    }

    async fn claim_pending(&self, request: ClaimRequest<'_>) -> Result<Vec<Claim>> {
        self.claim(&request, Selection::Deliverable)
    }

    async fn mark_sent(&self, id: MessageId, token: ClaimToken) -> Result<WriteOutcome> {
        let now = Utc::now();
        Ok(self
            .with_row(id, |row| row.mark_sent(token, now))?
            .unwrap_or(WriteOutcome::Stale))
    }

    async fn record_failure(
        &self,
        id: MessageId,
        token: ClaimToken,
        failure: Failure,
    ) -> Result<Option<u32>> {
        Ok(self
            .with_row(id, |row| row.record_failure(token, failure))?
            .flatten())
    }

    async fn release(&self, id: MessageId, token: ClaimToken) -> Result<WriteOutcome> {
        Ok(self
            .with_row(id, |row| row.release(token))?
            .unwrap_or(WriteOutcome::Stale))
    }

    async fn claim_exhausted(&self, request: ClaimRequest<'_>) -> Result<Vec<Claim>> {
        self.claim(&request, Selection::Exhausted)
    }

    async fn remove_claimed(&self, id: MessageId, token: ClaimToken) -> Result<Option<QueuedMessage>> {
        let mut table = self.table.lock()?;
        if !table.rows.get(&id).is_some_and(|row| row.owned_by(token)) {
            return Ok(None);
        }
        Ok(table.rows.remove(&id).map(|row| row.message))
    }

    async fn delete(&self, id: MessageId) -> Result<QueuedMessage> {
        self.table
            .lock()?
            .rows
            .remove(&id)
            .map(|row| row.message)
            .ok_or(QueueError::NotFound(id))
    }

    async fn take(&self, id: MessageId) -> Result<QueuedMessage> {
        let mut table = self.table.lock()?;
        match table.rows.get(&id) {
            None => Err(QueueError::NotFound(id)),
            Some(row) if row.is_claimed(Utc::now()) => Err(QueueError::Claimed(id)),
            Some(_) => table
                .rows
                .remove(&id)
                .map(|row| row.message)
                .ok_or(QueueError::NotFound(id)),
        }
    }

    async fn get(&self, id: MessageId) -> Result<QueuedMessage> {
        self.table
            .lock()?
            .rows
            .get(&id)
            .map(|row| row.message.clone())
            .ok_or(QueueError::NotFound(id))
    }

    async fn list(&self, filter: &QueueFilter) -> Result<Vec<QueuedMessage>> {
        Ok(self
            .table
            .lock()?
            .rows
            .values()
            .filter(|row| filter.matches(&row.message))
            .map(|row| row.message.clone())
            .collect())
    }
}
