//! Shared fixtures for the delivery integration tests
#![allow(dead_code, clippy::expect_used)]

pub mod mock_server;

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use herald_delivery::{
    AddressResolver, DeliveryError, Dispatcher, DispatcherConfig, LookupError, MemoryDeadLetters,
    PermanentError, Provider, RetryPolicy, StaticUserDirectory, TemporaryError, UserDirectory,
    UserRecord,
};
use herald_queue::{MemoryQueueStore, UserId};
use parking_lot::Mutex;

/// What [`ScriptedProvider`] does on one call.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Deliver,
    Temporary,
    Permanent,
    /// Never answer; the dispatcher's send timeout has to fire.
    Hang,
    /// Deliver after a pause.
    Delay(Duration),
}

/// Plays back a list of results, then keeps repeating the last one.
#[derive(Debug)]
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    sent: Mutex<Vec<(String, String)>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        let steps: VecDeque<Step> = steps.into_iter().collect();
        let fallback = steps.back().copied().unwrap_or(Step::Deliver);
        Self {
            steps: Mutex::new(steps),
            fallback,
            sent: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(step: Step) -> Self {
        Self::new([step])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(address, body)` of every successful call.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, address: &str, body: &str) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().pop_front().unwrap_or(self.fallback);
        match step {
            Step::Deliver => {
                self.sent.lock().push((address.to_string(), body.to_string()));
                Ok(())
            }
            Step::Temporary => Err(TemporaryError::ServerBusy("421 try again later".into()).into()),
            Step::Permanent => Err(PermanentError::InvalidRecipient("550 no such user".into()).into()),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            Step::Delay(pause) => {
                tokio::time::sleep(pause).await;
                self.sent.lock().push((address.to_string(), body.to_string()));
                Ok(())
            }
        }
    }
}

/// Counts lookups and can be switched into an outage or made to hang.
#[derive(Debug)]
pub struct CountingDirectory {
    inner: StaticUserDirectory,
    lookups: AtomicUsize,
    down: parking_lot::RwLock<bool>,
    hanging: parking_lot::RwLock<bool>,
}

impl CountingDirectory {
    pub fn new(users: impl IntoIterator<Item = UserRecord>) -> Self {
        Self {
            inner: StaticUserDirectory::new(users),
            lookups: AtomicUsize::new(0),
            down: parking_lot::RwLock::new(false),
            hanging: parking_lot::RwLock::new(false),
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn set_down(&self, down: bool) {
        *self.down.write() = down;
    }

    pub fn set_hanging(&self, hanging: bool) {
        *self.hanging.write() = hanging;
    }
}

#[async_trait]
impl UserDirectory for CountingDirectory {
    async fn get_user(&self, id: UserId) -> Result<UserRecord, LookupError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if *self.down.read() {
            return Err(LookupError::Unavailable("directory offline".into()));
        }
        let hanging = *self.hanging.read();
        if hanging {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.inner.get_user(id).await
    }
}

pub fn user(id: u64, email: &str) -> UserRecord {
    UserRecord {
        id: UserId::new(id),
        username: format!("user{id}"),
        email: Some(email.to_string()),
        language: None,
        roles: Vec::new(),
    }
}

pub fn body(to: &str, subject: &str) -> String {
    format!("To: {to}\r\nSubject: {subject}\r\n\r\nHello from herald\r\n")
}

/// Config that retries immediately and polls quickly.
pub fn config(threshold: u32) -> DispatcherConfig {
    DispatcherConfig {
        poll_interval_secs: 1,
        claim_ttl_secs: 60,
        send_timeout_secs: 1,
        shutdown_timeout_secs: 1,
        retry: RetryPolicy::default().with_threshold(threshold).without_backoff(),
        ..DispatcherConfig::default()
    }
}

pub struct Harness {
    pub store: Arc<MemoryQueueStore>,
    pub dead_letters: Arc<MemoryDeadLetters>,
    pub provider: Arc<ScriptedProvider>,
    pub directory: Arc<CountingDirectory>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new(config: DispatcherConfig, provider: ScriptedProvider, users: Vec<UserRecord>) -> Self {
        let store = Arc::new(MemoryQueueStore::new());
        let dead_letters = Arc::new(MemoryDeadLetters::new());
        let provider = Arc::new(provider);
        let directory = Arc::new(CountingDirectory::new(users));
        let dispatcher = Dispatcher::new(
            config,
            store.clone(),
            provider.clone(),
            dead_letters.clone(),
            AddressResolver::new(directory.clone()),
        )
        .expect("dispatcher");

        Self {
            store,
            dead_letters,
            provider,
            directory,
            dispatcher,
        }
    }

    pub fn resolver(&self) -> AddressResolver {
        AddressResolver::new(self.directory.clone())
    }
}
