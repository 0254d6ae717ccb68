use std::collections::BTreeMap;

use async_trait::async_trait;
use herald_queue::MessageId;
use parking_lot::RwLock;

use super::{DeadLetterRecord, DeadLetterSink};
use crate::error::DeadLetterError;

/// Process-local dead letters, lost on restart.
#[derive(Debug, Default)]
pub struct MemoryDeadLetters {
    records: RwLock<BTreeMap<MessageId, DeadLetterRecord>>,
}

impl MemoryDeadLetters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    fn name(&self) -> &str {
        "memory"
    }

    async fn record(&self, record: DeadLetterRecord) -> Result<(), DeadLetterError> {
        self.records.write().insert(record.id(), record);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn get(&self, id: MessageId) -> Result<DeadLetterRecord, DeadLetterError> {
        self.records
            .read()
            .get(&id)
            .cloned()
            .ok_or(DeadLetterError::NotFound(id))
    }

    async fn remove(&self, id: MessageId) -> Result<DeadLetterRecord, DeadLetterError> {
        self.records
            .write()
            .remove(&id)
            .ok_or(DeadLetterError::NotFound(id))
    }
}
