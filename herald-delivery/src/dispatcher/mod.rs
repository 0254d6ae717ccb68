//! The delivery worker loop.
//!
//! Each cycle claims due messages as delivery slots free up, resolves their
//! addresses, hands them to the provider and writes the outcome back with
//! the claim token. Permanent failures and exhausted retry budgets move the message to
//! the dead-letter sink.

mod attempt;
mod config;
mod report;

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::DashMap;
use herald_common::{Signal, internal};
use herald_queue::{Claim, ClaimRequest, ClaimToken, MessageId, QueueError, QueueStore, WriteOutcome};
use tokio::{sync::broadcast, task::JoinSet, time::MissedTickBehavior};

pub use self::{
    config::DispatcherConfig,
    report::{CycleReport, Outcome},
};
use crate::{
    dead_letter::{DeadLetterReason, DeadLetterRecord, DeadLetterSink},
    error::ConfigurationError,
    provider::Provider,
    resolver::AddressResolver,
};

#[derive(Debug)]
struct Inner {
    config: DispatcherConfig,
    store: Arc<dyn QueueStore>,
    provider: Arc<dyn Provider>,
    dead_letters: Arc<dyn DeadLetterSink>,
    resolver: AddressResolver,
    /// Claims held by attempts in this process.
    in_flight: DashMap<MessageId, ClaimToken>,
    /// Exhausted messages may be sitting in the queue without a dead-letter
    /// record.
    sweep_needed: AtomicBool,
}

/// Cheap to clone; clones share the in-flight table.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// # Errors
    /// When `config` fails [`DispatcherConfig::validate`].
    pub fn new(
        config: DispatcherConfig,
        store: Arc<dyn QueueStore>,
        provider: Arc<dyn Provider>,
        dead_letters: Arc<dyn DeadLetterSink>,
        resolver: AddressResolver,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        internal!(
            level = INFO,
            provider = provider.name(),
            dead_letters = dead_letters.name(),
            workers = config.workers,
            batch_size = config.batch_size,
            retry_threshold = config.retry.retry_threshold,
            "Dispatcher configured"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                provider,
                dead_letters,
                resolver,
                in_flight: DashMap::new(),
                // Pick up anything a previous process exhausted but never escalated.
                sweep_needed: AtomicBool::new(true),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Ids currently being attempted by this process.
    #[must_use]
    pub fn in_flight(&self) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self.inner.in_flight.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Deliver up to `batch_size` messages and run every attempt to
    /// completion.
    ///
    /// Messages are claimed only when a delivery slot is free, so no claim
    /// waits behind other attempts while its lease runs down. Individual
    /// message failures are recorded on the message and counted in the
    /// report; only a failure of the first claim is returned as an error.
    ///
    /// # Errors
    /// The queue store could not be read or the claim could not be written.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn run_cycle(&self) -> Result<CycleReport, QueueError> {
        let mut report = CycleReport::default();

        if self.inner.sweep_needed.swap(false, Ordering::SeqCst) {
            self.sweep_exhausted(&mut report).await;
        }

        let mut remaining = self.inner.config.batch_size;
        let mut drained = false;
        let mut tasks = JoinSet::new();
        let mut running = HashMap::new();

        loop {
            let free = self
                .inner
                .config
                .max_concurrent_deliveries
                .saturating_sub(tasks.len())
                .min(remaining);

            if free > 0 && !drained {
                match self.claim(free).await {
                    Ok(claims) => {
                        drained = claims.len() < free;
                        remaining -= claims.len();
                        report.claimed += claims.len();

                        for claim in claims {
                            let owner = (claim.id(), claim.token());
                            self.inner.in_flight.insert(owner.0, owner.1);
                            let this = self.clone();
                            let handle = tasks.spawn(async move { this.attempt(claim).await });
                            running.insert(handle.id(), owner);
                        }
                    }
                    Err(e) if report.claimed == 0 => return Err(e),
                    Err(e) => {
                        internal!(level = WARN, error = %e, "Unable to claim more messages this cycle");
                        drained = true;
                    }
                }
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };

            match joined {
                Ok((task, outcome)) => {
                    running.remove(&task);
                    report.record(outcome);
                }
                Err(e) => {
                    if let Some((id, token)) = running.remove(&e.id()) {
                        internal!(level = ERROR, %id, error = %e, "Delivery attempt did not complete");
                        self.inner.in_flight.remove(&id);
                        self.release(id, token).await;
                    }
                    report.record(Outcome::Failed);
                }
            }
        }

        Ok(report)
    }

    async fn claim(&self, limit: usize) -> Result<Vec<Claim>, QueueError> {
        let exclude = self.in_flight();
        self.inner
            .store
            .claim_pending(ClaimRequest {
                limit,
                exclude: &exclude,
                lease: self.inner.config.claim_ttl(),
                retry_threshold: self.inner.config.retry.retry_threshold,
            })
            .await
    }

    /// Poll until `shutdown` fires.
    ///
    /// ## Graceful Shutdown
    ///
    /// On [`Signal::Shutdown`] each worker stops claiming, waits up to
    /// `shutdown_timeout_secs` for its current cycle and then abandons it.
    /// Claims of abandoned attempts are released without counting an error.
    pub async fn serve(&self, shutdown: broadcast::Receiver<Signal>) {
        internal!(level = INFO, workers = self.inner.config.workers, "Dispatcher starting");

        let mut workers = JoinSet::new();
        for worker in 0..self.inner.config.workers {
            let this = self.clone();
            let shutdown = shutdown.resubscribe();
            workers.spawn(async move { this.work(worker, shutdown).await });
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                internal!(level = ERROR, error = %e, "Dispatcher worker ended abnormally");
            }
        }

        let released = self.release_in_flight().await;
        internal!(level = INFO, released, "Dispatcher shutdown complete");
    }

    async fn work(&self, worker: usize, mut shutdown: broadcast::Receiver<Signal>) {
        let mut timer = tokio::time::interval(self.inner.config.poll_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let cycle = self.run_cycle();
                    tokio::pin!(cycle);

                    tokio::select! {
                        result = &mut cycle => Self::log_cycle(worker, result),
                        signal = shutdown.recv() => {
                            internal!(level = INFO, worker, ?signal, "Worker stopping, waiting for in-flight deliveries");
                            match tokio::time::timeout(self.inner.config.shutdown_timeout(), cycle).await {
                                Ok(result) => Self::log_cycle(worker, result),
                                Err(_) => internal!(
                                    level = WARN,
                                    worker,
                                    "Shutdown timeout exceeded, abandoning in-flight deliveries"
                                ),
                            }
                            return;
                        }
                    }
                }
                signal = shutdown.recv() => {
                    internal!(level = INFO, worker, ?signal, "Worker stopping");
                    return;
                }
            }
        }
    }

    fn log_cycle(worker: usize, result: Result<CycleReport, QueueError>) {
        match result {
            Ok(report) if report.is_idle() => internal!(worker, "Nothing to deliver"),
            Ok(report) => internal!(level = INFO, worker, %report, "Dispatcher cycle complete"),
            Err(e) => internal!(level = ERROR, worker, error = %e, "Dispatcher cycle failed, retrying next poll"),
        }
    }

    /// Give back every claim still held by this process.
    pub async fn release_in_flight(&self) -> usize {
        let held: Vec<(MessageId, ClaimToken)> = self
            .inner
            .in_flight
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();

        let mut released = 0;
        for (id, token) in held {
            self.inner.in_flight.remove(&id);
            if self.release(id, token).await {
                released += 1;
            }
        }
        released
    }

    async fn release(&self, id: MessageId, token: ClaimToken) -> bool {
        match self.inner.store.release(id, token).await {
            Ok(WriteOutcome::Applied | WriteOutcome::Unchanged) => {
                internal!(level = DEBUG, %id, "Released claim");
                true
            }
            Ok(WriteOutcome::Stale) => false,
            Err(e) => {
                internal!(level = ERROR, %id, error = %e, "Failed to release claim");
                false
            }
        }
    }

    /// Escalate exhausted messages left in the queue by an earlier failure
    /// to write their dead-letter record.
    async fn sweep_exhausted(&self, report: &mut CycleReport) {
        let exclude = self.in_flight();
        let claims = match self
            .inner
            .store
            .claim_exhausted(ClaimRequest {
                limit: self.inner.config.batch_size,
                exclude: &exclude,
                lease: self.inner.config.claim_ttl(),
                retry_threshold: self.inner.config.retry.retry_threshold,
            })
            .await
        {
            Ok(claims) => claims,
            Err(e) => {
                internal!(level = ERROR, error = %e, "Unable to scan for exhausted messages");
                self.inner.sweep_needed.store(true, Ordering::SeqCst);
                return;
            }
        };

        // A full batch may mean more are waiting.
        if claims.len() == self.inner.config.batch_size {
            self.inner.sweep_needed.store(true, Ordering::SeqCst);
        }

        let mut claims = claims.into_iter();
        for claim in claims.by_ref() {
            let (id, token) = (claim.id(), claim.token());
            let error = claim.message.last_error.clone().unwrap_or_default();
            let record = DeadLetterRecord::new(claim.message, DeadLetterReason::Exhausted, error);

            match self.escalate(token, record).await {
                Outcome::Failed => {
                    internal!(level = WARN, %id, "Exhausted message left in queue, will retry escalation");
                    self.inner.sweep_needed.store(true, Ordering::SeqCst);
                    self.release(id, token).await;
                    break;
                }
                outcome => report.record(outcome),
            }
        }
        for rest in claims {
            self.release(rest.id(), rest.token()).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use herald_queue::{MemoryQueueStore, Recipient};

    use super::*;
    use crate::{
        dead_letter::MemoryDeadLetters, provider::LogProvider, resolver::StaticUserDirectory,
    };

    fn dispatcher(store: Arc<MemoryQueueStore>) -> Dispatcher {
        Dispatcher::new(
            DispatcherConfig::default(),
            store,
            Arc::new(LogProvider),
            Arc::new(MemoryDeadLetters::new()),
            AddressResolver::new(Arc::new(StaticUserDirectory::default())),
        )
        .expect("dispatcher")
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = Dispatcher::new(
            DispatcherConfig {
                workers: 0,
                ..DispatcherConfig::default()
            },
            Arc::new(MemoryQueueStore::new()),
            Arc::new(LogProvider),
            Arc::new(MemoryDeadLetters::new()),
            AddressResolver::new(Arc::new(StaticUserDirectory::default())),
        )
        .expect_err("invalid");
        assert!(matches!(err, ConfigurationError::Dispatcher(_)));
    }

    #[tokio::test]
    async fn empty_queue_is_idle() {
        let report = dispatcher(Arc::new(MemoryQueueStore::new()))
            .run_cycle()
            .await
            .expect("cycle");
        assert!(report.is_idle());
    }

    #[tokio::test]
    async fn log_provider_delivers() {
        let store = Arc::new(MemoryQueueStore::new());
        let id = store
            .enqueue(Recipient::direct("x@example.com"), "Subject: hi\r\n\r\n".into())
            .await
            .expect("enqueue");

        let dispatcher = dispatcher(store.clone());
        let report = dispatcher.run_cycle().await.expect("cycle");

        assert_eq!(report.sent, 1);
        assert!(store.get(id).await.expect("get").is_sent());
        assert!(dispatcher.in_flight().is_empty());
    }
}
