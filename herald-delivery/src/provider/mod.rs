//! Pluggable delivery backends.
//!
//! A [`ProviderRegistry`] maps a configured name to a constructor. The
//! registry is built once at start-up and handed to whoever needs to turn a
//! [`ProviderConfig`] into a live [`Provider`].

mod jmap;
mod log;
mod sendmail;
mod smtp;

use std::{fmt, sync::Arc};

use ahash::AHashMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use self::{
    jmap::JmapProvider, log::LogProvider, sendmail::SendmailProvider, smtp::SmtpProvider,
};
use crate::{
    error::{ConfigurationError, DeliveryError},
    settings::Settings,
};

/// One delivery attempt for a resolved address.
#[async_trait]
pub trait Provider: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Deliver `body` to `address`.
    ///
    /// Errors are retried by the dispatcher unless they are
    /// [`DeliveryError::Permanent`].
    async fn send(&self, address: &str, body: &str) -> Result<(), DeliveryError>;
}

pub type ProviderConstructor =
    Arc<dyn Fn(&Settings) -> Result<Arc<dyn Provider>, ConfigurationError> + Send + Sync>;

/// Which provider to build, and with what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub settings: Settings,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "log".to_string(),
            settings: Settings::default(),
        }
    }
}

/// Name to constructor map. Re-registering a name replaces the earlier entry.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    constructors: AHashMap<String, ProviderConstructor>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

impl ProviderRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `smtp`, `sendmail`, `jmap` and `log`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register("smtp", |settings| Ok(Arc::new(SmtpProvider::from_settings(settings)?)))
            .register("sendmail", |settings| {
                Ok(Arc::new(SendmailProvider::from_settings(settings)?))
            })
            .register("jmap", |settings| Ok(Arc::new(JmapProvider::from_settings(settings)?)))
            .register("log", |settings| Ok(Arc::new(LogProvider::from_settings(settings))));
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&Settings) -> Result<Arc<dyn Provider>, ConfigurationError> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
        self
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Build the provider named by `config`.
    ///
    /// # Errors
    /// [`ConfigurationError::UnknownProvider`] for an unregistered name, or
    /// whatever the constructor reports for bad settings.
    pub fn provider_from_config(
        &self,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn Provider>, ConfigurationError> {
        let constructor = self.constructors.get(config.name.as_str()).ok_or_else(|| {
            ConfigurationError::UnknownProvider {
                name: config.name.clone(),
                available: self.names().join(", "),
            }
        })?;

        constructor(&config.settings)
    }
}
