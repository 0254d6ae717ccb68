//! Terminal storage for messages the dispatcher gave up on.
//!
//! Records are keyed by message id. Writing a record for an id that is
//! already present replaces it, so a message appears at most once however
//! many times escalation is retried.

mod dir;
mod log;
mod mbox;
mod memory;

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use ahash::AHashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_queue::{MessageId, QueuedMessage};
use serde::{Deserialize, Serialize};

pub use self::{
    dir::DirectoryDeadLetters, log::LogDeadLetters, mbox::MboxDeadLetters,
    memory::MemoryDeadLetters,
};
use crate::{
    error::{ConfigurationError, DeadLetterError},
    settings::Settings,
};

/// Why a message left the live queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterReason {
    /// The retry threshold was reached.
    Exhausted,
    /// The provider refused the message outright.
    Permanent,
    /// No deliverable address could be found.
    Unresolved,
}

impl DeadLetterReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::Permanent => "permanent",
            Self::Unresolved => "unresolved",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeadLetterReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exhausted" => Ok(Self::Exhausted),
            "permanent" => Ok(Self::Permanent),
            "unresolved" => Ok(Self::Unresolved),
            other => Err(format!("Unknown dead-letter reason '{other}'")),
        }
    }
}

/// A copy of a message as it was when escalated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub message: QueuedMessage,
    pub reason: DeadLetterReason,
    pub last_error: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// The copy carries `last_error` and loses any retry schedule.
    #[must_use]
    pub fn new(mut message: QueuedMessage, reason: DeadLetterReason, last_error: impl Into<String>) -> Self {
        let last_error = last_error.into();
        message.last_error = Some(last_error.clone());
        message.next_attempt_at = None;

        Self {
            message,
            reason,
            last_error,
            dead_lettered_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.message.id
    }
}

/// Where dead-lettered messages go.
#[async_trait]
pub trait DeadLetterSink: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Store `record`, replacing any record with the same id.
    async fn record(&self, record: DeadLetterRecord) -> Result<(), DeadLetterError>;

    /// Every retained record, in id order.
    async fn list(&self) -> Result<Vec<DeadLetterRecord>, DeadLetterError>;

    async fn get(&self, id: MessageId) -> Result<DeadLetterRecord, DeadLetterError>;

    /// Remove and return the record for `id`.
    async fn remove(&self, id: MessageId) -> Result<DeadLetterRecord, DeadLetterError>;
}

pub type SinkConstructor =
    Arc<dyn Fn(&Settings) -> Result<Arc<dyn DeadLetterSink>, ConfigurationError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    pub sink: String,
    #[serde(default)]
    pub settings: Settings,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            sink: "file".to_string(),
            settings: Settings::default(),
        }
    }
}

/// Name to constructor map for dead-letter sinks.
#[derive(Clone, Default)]
pub struct DeadLetterRegistry {
    constructors: AHashMap<String, SinkConstructor>,
}

impl fmt::Debug for DeadLetterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterRegistry")
            .field("sinks", &self.names())
            .finish()
    }
}

impl DeadLetterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `file` (mbox), `dir` (one JSON file per record), `memory` and `log`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register("file", |settings| Ok(Arc::new(MboxDeadLetters::from_settings(settings)?)))
            .register("dir", |settings| {
                Ok(Arc::new(DirectoryDeadLetters::from_settings(settings)?))
            })
            .register("memory", |_| Ok(Arc::new(MemoryDeadLetters::new())))
            .register("log", |_| Ok(Arc::new(LogDeadLetters)));
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&Settings) -> Result<Arc<dyn DeadLetterSink>, ConfigurationError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
        self
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// # Errors
    /// [`ConfigurationError::UnknownSink`] for an unregistered name, or the
    /// constructor's own error.
    pub fn sink_from_config(
        &self,
        config: &DeadLetterConfig,
    ) -> Result<Arc<dyn DeadLetterSink>, ConfigurationError> {
        let constructor = self.constructors.get(config.sink.as_str()).ok_or_else(|| {
            ConfigurationError::UnknownSink {
                name: config.sink.clone(),
                available: self.names().join(", "),
            }
        })?;

        constructor(&config.settings)
    }
}

/// `path` setting, or `default`. Must be absolute.
fn path_setting(component: &str, settings: &Settings, default: &str) -> Result<PathBuf, ConfigurationError> {
    let path = PathBuf::from(settings.get("path").unwrap_or(default));
    if path.is_absolute() {
        Ok(path)
    } else {
        Err(ConfigurationError::InvalidSetting {
            component: component.to_string(),
            key: "path".to_string(),
            reason: format!("{} is not an absolute path", path.display()),
        })
    }
}

/// Write `contents` next to `path` and rename it into place.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), DeadLetterError> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".tmp_{name}_{}", ulid::Ulid::new()));

    tokio::fs::write(&temp, contents).await?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}
