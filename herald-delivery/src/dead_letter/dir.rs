use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use herald_queue::{LockFile, MessageId};
use tokio::{fs, sync::Mutex};

use super::{DeadLetterRecord, DeadLetterSink, path_setting, write_atomic};
use crate::{
    error::{ConfigurationError, DeadLetterError},
    settings::Settings,
};

const COMPONENT: &str = "dir";
const DEFAULT_PATH: &str = "/var/spool/herald/dead-letter";
const EXTENSION: &str = "json";
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const STALE_LOCK: Duration = Duration::from_secs(60);

/// One pretty-printed JSON file per record, named after the message id.
#[derive(Debug, Clone)]
pub struct DirectoryDeadLetters {
    path: PathBuf,
    local: Arc<Mutex<()>>,
}

impl DirectoryDeadLetters {
    /// # Errors
    /// When `path` is set to a relative path.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigurationError> {
        Ok(Self::new(path_setting(COMPONENT, settings, DEFAULT_PATH)?))
    }

    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            local: Arc::default(),
        }
    }

    fn record_path(&self, id: MessageId) -> PathBuf {
        self.path.join(format!("{:020}.{EXTENSION}", id.get()))
    }

    async fn lock(&self) -> Result<LockFile, DeadLetterError> {
        fs::create_dir_all(&self.path).await?;
        Ok(LockFile::acquire(&self.local, self.path.join(".lock"), LOCK_TIMEOUT, STALE_LOCK).await?)
    }

    async fn read(&self, path: PathBuf) -> Result<DeadLetterRecord, DeadLetterError> {
        let contents = fs::read(&path).await?;
        serde_json::from_slice(&contents).map_err(|e| DeadLetterError::Corrupted {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl DeadLetterSink for DirectoryDeadLetters {
    fn name(&self) -> &str {
        COMPONENT
    }

    async fn record(&self, record: DeadLetterRecord) -> Result<(), DeadLetterError> {
        let _lock = self.lock().await?;
        let contents = serde_json::to_vec_pretty(&record)?;
        write_atomic(&self.record_path(record.id()), &contents).await
    }

    async fn list(&self) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        let mut entries = match fs::read_dir(&self.path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') && path.extension().is_some_and(|ext| ext == EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            match self.read(path).await {
                Ok(record) => records.push(record),
                // Removed between the listing and the read.
                Err(DeadLetterError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn get(&self, id: MessageId) -> Result<DeadLetterRecord, DeadLetterError> {
        match self.read(self.record_path(id)).await {
            Err(DeadLetterError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DeadLetterError::NotFound(id))
            }
            other => other,
        }
    }

    async fn remove(&self, id: MessageId) -> Result<DeadLetterRecord, DeadLetterError> {
        let _lock = self.lock().await?;
        let record = self.get(id).await?;
        fs::remove_file(self.record_path(id)).await?;
        Ok(record)
    }
}
