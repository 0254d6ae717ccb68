use std::sync::{Arc, LazyLock};

use herald_common::{
    Signal,
    audit::{self, AuditConfig},
    internal, logging,
};
use herald_delivery::{
    AddressResolver, ConfigurationError, DeadLetterConfig, DeadLetterRegistry, DeadLetterSink,
    Dispatcher, DispatcherConfig, Provider, ProviderConfig, ProviderRegistry, ReplayService,
    StaticUserDirectory, UserRecord,
};
use herald_queue::{QueueConfig, QueueStore};
use serde::Deserialize;
use tokio::sync::broadcast;

/// The whole configuration file.
///
/// ```ron
/// Herald (
///     queue: File(path: "/var/spool/herald"),
///     provider: (name: "smtp", settings: { "host": "relay.example.com", "from": "noreply@example.com" }),
///     dead_letter: (sink: "file", settings: { "path": "/var/spool/herald/dead-letter.mbox" }),
///     dispatcher: (workers: 2, retry: (retry_threshold: 5)),
///     users: [(id: 42, username: "alice", email: Some("alice@example.com"))],
/// )
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct Herald {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(alias = "dlq", default)]
    pub dead_letter: DeadLetterConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Accounts served by the built-in static user directory.
    #[serde(default)]
    pub users: Vec<UserRecord>,
    #[serde(default)]
    pub audit: AuditConfig,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                internal!(level = WARN, "Forced shutdown, unfinished claims expire on their own");
                break;
            }
        }
    }

    Ok(())
}

/// Everything built from one configuration, shared by the daemon and the
/// operator tool.
#[derive(Debug, Clone)]
pub struct Services {
    pub store: Arc<dyn QueueStore>,
    pub provider: Arc<dyn Provider>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub resolver: AddressResolver,
    pub dispatcher: DispatcherConfig,
}

impl Services {
    /// # Errors
    /// The dispatcher section failed validation.
    pub fn dispatcher(&self) -> Result<Dispatcher, ConfigurationError> {
        Dispatcher::new(
            self.dispatcher.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.provider),
            Arc::clone(&self.dead_letters),
            self.resolver.clone(),
        )
    }

    #[must_use]
    pub fn replay(&self) -> ReplayService {
        ReplayService::new(
            Arc::clone(&self.store),
            Arc::clone(&self.dead_letters),
            self.resolver.clone(),
        )
    }
}

impl Herald {
    /// Build the configured stores, provider and sink.
    ///
    /// # Errors
    /// Unknown or misconfigured provider or sink, or a queue that cannot be
    /// opened.
    pub fn open(
        self,
        providers: &ProviderRegistry,
        sinks: &DeadLetterRegistry,
    ) -> anyhow::Result<Services> {
        audit::init(self.audit);

        let provider = providers.provider_from_config(&self.provider)?;
        let dead_letters = sinks.sink_from_config(&self.dead_letter)?;
        let store = self.queue.into_store()?;
        let resolver = AddressResolver::new(Arc::new(StaticUserDirectory::new(self.users)));

        Ok(Services {
            store,
            provider,
            dead_letters,
            resolver,
            dispatcher: self.dispatcher,
        })
    }

    /// Run the dispatcher until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// This function will return an error if the configuration cannot be
    /// turned into running services.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        let providers = ProviderRegistry::with_defaults();
        let sinks = DeadLetterRegistry::with_defaults();
        let services = self.open(&providers, &sinks)?;
        let dispatcher = services.dispatcher()?;

        internal!(
            level = INFO,
            provider = services.provider.name(),
            dead_letters = services.dead_letters.name(),
            "Controller running"
        );

        let ret = tokio::select! {
            () = dispatcher.serve(SHUTDOWN_BROADCAST.subscribe()) => Ok(()),
            r = shutdown() => r,
        };

        internal!(level = INFO, "Shutting down...");

        ret
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use herald_delivery::RetryPolicy;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let herald: Herald = ron::from_str("Herald()").expect("parse");

        assert_eq!(herald.queue, QueueConfig::default());
        assert_eq!(herald.provider.name, "log");
        assert_eq!(herald.dead_letter.sink, "file");
        assert_eq!(herald.dispatcher, DispatcherConfig::default());
        assert!(herald.users.is_empty());
        assert!(herald.audit.enabled);
    }

    #[test]
    fn full_config_parses() {
        let herald: Herald = ron::from_str(
            r#"Herald(
                queue: Memory(capacity: Some(10)),
                provider: (name: "smtp", settings: { "host": "relay.example.com", "from": "noreply@example.com" }),
                dlq: (sink: "memory"),
                dispatcher: (workers: 2, retry: (retry_threshold: 3)),
                users: [(id: 42, username: "alice", email: Some("alice@example.com"), language: Some(1), roles: ["admin"])],
                audit: (redact_recipients: true),
            )"#,
        )
        .expect("parse");

        assert_eq!(herald.queue, QueueConfig::Memory { capacity: Some(10) });
        assert_eq!(herald.provider.settings.get("host"), Some("relay.example.com"));
        assert_eq!(herald.dead_letter.sink, "memory");
        assert_eq!(herald.dispatcher.workers, 2);
        assert_eq!(herald.dispatcher.retry, RetryPolicy::default().with_threshold(3));
        assert_eq!(herald.users[0].address(), Some("alice@example.com"));
        assert!(herald.audit.redact_recipients);
    }

    #[test]
    fn unknown_provider_fails_to_open() {
        let herald = Herald {
            queue: QueueConfig::Memory { capacity: None },
            provider: ProviderConfig {
                name: "carrier-pigeon".into(),
                ..ProviderConfig::default()
            },
            ..Herald::default()
        };

        let err = herald
            .open(&ProviderRegistry::with_defaults(), &DeadLetterRegistry::with_defaults())
            .expect_err("unknown provider");
        assert!(err.to_string().contains("carrier-pigeon"));
    }
}
