use std::{sync::atomic::Ordering, time::Instant};

use herald_common::{audit, internal};
use herald_queue::{Claim, ClaimToken, Failure, WriteOutcome};

use super::{Dispatcher, Outcome};
use crate::{
    dead_letter::{DeadLetterReason, DeadLetterRecord},
    error::{DeliveryError, ResolveError, TemporaryError},
};

impl Dispatcher {
    /// Run one attempt and give up the in-flight entry afterwards.
    pub(super) async fn attempt(&self, claim: Claim) -> Outcome {
        let id = claim.id();
        let outcome = self.deliver(&claim).await;
        self.inner.in_flight.remove(&id);
        outcome
    }

    #[tracing::instrument(level = "trace", skip_all, fields(id = %claim.id()))]
    async fn deliver(&self, claim: &Claim) -> Outcome {
        let message = &claim.message;

        let timeout = self.inner.config.send_timeout();
        let resolved = match tokio::time::timeout(timeout, self.inner.resolver.resolve(message)).await {
            Ok(Ok(resolved)) => resolved,
            Ok(Err(e)) if e.is_permanent() => {
                return self
                    .dead_letter(claim, DeadLetterReason::Unresolved, e.to_string())
                    .await;
            }
            Ok(Err(e)) => return self.retry(claim, e.to_string()).await,
            Err(_) => {
                let e = ResolveError::Directory(format!("Lookup timed out after {}s", timeout.as_secs()));
                return self.retry(claim, e.to_string()).await;
            }
        };

        let provider = self.inner.provider.name();
        audit::log_delivery_attempt(
            claim.id().get(),
            provider,
            &resolved.address,
            message.error_count.saturating_add(1),
        );

        let started = Instant::now();
        let result = tokio::time::timeout(
            timeout,
            self.inner.provider.send(&resolved.address, &message.body),
        )
        .await
        .unwrap_or_else(|_| {
            Err(TemporaryError::Timeout(format!("No response within {}s", timeout.as_secs())).into())
        });

        match result {
            Ok(()) => match self.inner.store.mark_sent(claim.id(), claim.token()).await {
                Ok(WriteOutcome::Applied | WriteOutcome::Unchanged) => {
                    audit::log_delivery_success(
                        claim.id().get(),
                        provider,
                        &resolved.address,
                        started.elapsed().as_millis(),
                    );
                    Outcome::Sent
                }
                Ok(WriteOutcome::Stale) => {
                    internal!(
                        level = WARN,
                        id = %claim.id(),
                        "Delivered but the claim was lost, the send is not recorded"
                    );
                    Outcome::Stale
                }
                Err(e) => {
                    internal!(level = ERROR, id = %claim.id(), error = %e, "Delivered but unable to mark as sent");
                    Outcome::Failed
                }
            },
            Err(DeliveryError::Permanent(e)) => {
                self.dead_letter(claim, DeadLetterReason::Permanent, e.to_string())
                    .await
            }
            Err(DeliveryError::Temporary(e)) => self.retry(claim, e.to_string()).await,
        }
    }

    /// Count the failure and escalate once the threshold is reached.
    ///
    /// The failure that exhausts the budget keeps the claim, so nothing else
    /// can take the message while it is moved to the dead-letter sink.
    async fn retry(&self, claim: &Claim, error: String) -> Outcome {
        let policy = &self.inner.config.retry;
        let next_count = claim.message.error_count.saturating_add(1);
        let hold = policy.is_exhausted(next_count);
        let mut failure = Failure::new(error.clone()).retry_at(policy.next_retry_at(next_count));
        if hold {
            failure = failure.holding_claim();
        }

        let count = match self
            .inner
            .store
            .record_failure(claim.id(), claim.token(), failure)
            .await
        {
            Ok(Some(count)) => count,
            Ok(None) => {
                internal!(level = DEBUG, id = %claim.id(), "Failure not recorded, claim was lost");
                return Outcome::Stale;
            }
            Err(e) => {
                internal!(level = ERROR, id = %claim.id(), error = %e, "Unable to record delivery failure");
                return Outcome::Failed;
            }
        };

        audit::log_delivery_retry(claim.id().get(), &error, count, policy.retry_threshold);
        if !policy.is_exhausted(count) {
            if hold {
                self.release(claim.id(), claim.token()).await;
            }
            return Outcome::Retried;
        }

        let mut exhausted = claim.message.clone();
        exhausted.error_count = count;
        let record = DeadLetterRecord::new(exhausted, DeadLetterReason::Exhausted, error);
        match self.escalate(claim.token(), record).await {
            Outcome::Failed => {
                // Left in the queue for the next sweep.
                self.release(claim.id(), claim.token()).await;
                self.inner.sweep_needed.store(true, Ordering::SeqCst);
                Outcome::Failed
            }
            outcome => outcome,
        }
    }

    /// Escalate a message whose claim is still held. A failed escalation
    /// gives the claim back so the message is attempted again.
    async fn dead_letter(&self, claim: &Claim, reason: DeadLetterReason, error: String) -> Outcome {
        let record = DeadLetterRecord::new(claim.message.clone(), reason, error);
        match self.escalate(claim.token(), record).await {
            Outcome::Failed => {
                if self.release(claim.id(), claim.token()).await {
                    Outcome::Released
                } else {
                    Outcome::Failed
                }
            }
            outcome => outcome,
        }
    }

    /// Write the dead-letter record, then remove the message from the queue
    /// while `token` still owns it.
    ///
    /// When the claim was lost in the meantime (an operator deleted or
    /// replayed the message) the record is withdrawn again and the attempt
    /// ends as [`Outcome::Stale`].
    pub(super) async fn escalate(&self, token: ClaimToken, record: DeadLetterRecord) -> Outcome {
        let id = record.id();
        let sink = self.inner.dead_letters.name();
        let reason = record.reason;
        let error = record.last_error.clone();

        if let Err(e) = self.inner.dead_letters.record(record).await {
            internal!(level = ERROR, %id, sink, error = %e, "Unable to write dead-letter record");
            return Outcome::Failed;
        }

        match self.inner.store.remove_claimed(id, token).await {
            Ok(Some(_)) => {
                audit::log_dead_lettered(id.get(), sink, reason.as_str(), &error);
                Outcome::DeadLettered
            }
            Ok(None) => {
                internal!(level = WARN, %id, sink, "Claim lost before escalation finished, withdrawing dead-letter record");
                if let Err(e) = self.inner.dead_letters.remove(id).await {
                    internal!(level = ERROR, %id, sink, error = %e, "Unable to withdraw dead-letter record");
                }
                Outcome::Stale
            }
            Err(e) => {
                internal!(level = ERROR, %id, error = %e, "Dead-lettered but unable to remove from queue");
                Outcome::Failed
            }
        }
    }
}
