use std::{path::PathBuf, sync::Arc, time::Duration};

use serde::Deserialize;

use crate::{
    Result,
    backends::{FileQueueStore, MemoryQueueStore},
    store::QueueStore,
};

const fn default_lock_timeout_secs() -> u64 {
    10
}

const fn default_stale_lock_secs() -> u64 {
    60
}

fn default_path() -> PathBuf {
    PathBuf::from("/var/spool/herald")
}

/// Selects the queue backend.
///
/// File-backed queue:
/// ```ron
/// Herald (
///     queue: File(path: "/var/spool/herald"),
/// )
/// ```
///
/// Memory-backed queue, optionally bounded:
/// ```ron
/// Herald (
///     queue: Memory(capacity: Some(1000)),
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum QueueConfig {
    File {
        #[serde(default = "default_path")]
        path: PathBuf,
        /// Seconds a mutation waits for the directory lock
        #[serde(default = "default_lock_timeout_secs")]
        lock_timeout_secs: u64,
        /// Age in seconds after which a lock left by a crashed process is broken
        #[serde(default = "default_stale_lock_secs")]
        stale_lock_secs: u64,
    },
    Memory {
        #[serde(default)]
        capacity: Option<usize>,
    },
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::File {
            path: default_path(),
            lock_timeout_secs: default_lock_timeout_secs(),
            stale_lock_secs: default_stale_lock_secs(),
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::File { path, .. } => Some(path),
            Self::Memory { .. } => None,
        }
    }

    /// Build the configured store, preparing the directory for the file backend.
    ///
    /// # Errors
    /// Fails if the file backend's path is unsafe or its directory cannot be
    /// prepared.
    pub fn into_store(self) -> Result<Arc<dyn QueueStore>> {
        match self {
            Self::File {
                path,
                lock_timeout_secs,
                stale_lock_secs,
            } => {
                let store = FileQueueStore::new(path)?
                    .with_lock_timeout(Duration::from_secs(lock_timeout_secs))
                    .with_stale_lock_after(Duration::from_secs(stale_lock_secs));
                store.init()?;
                Ok(Arc::new(store))
            }
            Self::Memory { capacity } => Ok(Arc::new(
                capacity.map_or_else(MemoryQueueStore::new, MemoryQueueStore::with_capacity),
            )),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_file_variant_with_defaults() {
        let config: QueueConfig = ron::from_str(r#"File(path: "/var/spool/herald")"#).expect("parse");
        assert_eq!(config, QueueConfig::default());
    }

    #[test]
    fn parses_memory_variant() {
        let config: QueueConfig = ron::from_str("Memory(capacity: Some(5))").expect("parse");
        assert_eq!(config, QueueConfig::Memory { capacity: Some(5) });
        assert!(config.path().is_none());

        let unbounded: QueueConfig = ron::from_str("Memory()").expect("parse");
        assert_eq!(unbounded, QueueConfig::Memory { capacity: None });
    }

    #[test]
    fn unsafe_paths_are_rejected_when_building() {
        let config: QueueConfig = ron::from_str(r#"File(path: "/proc/herald")"#).expect("parse");
        assert!(config.into_store().is_err());
    }

    #[test]
    fn file_store_is_initialised() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("queue");
        let config = QueueConfig::File {
            path: path.clone(),
            lock_timeout_secs: 1,
            stale_lock_secs: 1,
        };

        config.into_store().expect("store");
        assert!(path.is_dir());
    }
}
