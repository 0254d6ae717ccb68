use async_trait::async_trait;
use herald_common::internal;
use herald_queue::MessageId;

use super::{DeadLetterRecord, DeadLetterSink};
use crate::error::DeadLetterError;

/// Writes dead letters to the log only. Nothing is retained for replay.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDeadLetters;

#[async_trait]
impl DeadLetterSink for LogDeadLetters {
    fn name(&self) -> &str {
        "log"
    }

    async fn record(&self, record: DeadLetterRecord) -> Result<(), DeadLetterError> {
        internal!(
            level = WARN,
            id = %record.id(),
            recipient = %record.message.recipient,
            reason = %record.reason,
            error_count = record.message.error_count,
            error = %record.last_error,
            "Message dead-lettered"
        );
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        Ok(Vec::new())
    }

    async fn get(&self, id: MessageId) -> Result<DeadLetterRecord, DeadLetterError> {
        Err(DeadLetterError::NotFound(id))
    }

    async fn remove(&self, id: MessageId) -> Result<DeadLetterRecord, DeadLetterError> {
        Err(DeadLetterError::NotFound(id))
    }
}
