use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use herald_common::{audit, internal};
use tokio::{fs, sync::Mutex};

use crate::{
    QueueError, Result, SerializationError, ValidationError,
    lockfile::LockFile,
    message::{Claim, Failure, QueuedMessage, WriteOutcome},
    row::{Row, Selection, select_claimable},
    store::{ClaimRequest, QueueFilter, QueueStore},
    types::{ClaimToken, MessageId, Recipient},
};

const ROW_EXTENSION: &str = "msg";
const TEMP_PREFIX: &str = ".tmp_";
const SEQUENCE_FILE: &str = "queue.seq";
const LOCK_FILE: &str = ".lock";

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_STALE_LOCK: Duration = Duration::from_secs(60);

/// File-based queue store
///
/// Each message is one bincode-encoded file named after its zero-padded id
/// (`00000000000000000042.msg`), so a directory listing sorts by id. The
/// record holds the message and the lease of the attempt working on it.
///
/// # Atomicity
/// Records and the id sequence are written to a `.tmp_` file and renamed
/// into place, so readers never observe a partial record. Temp files left by
/// a crash are removed by [`FileQueueStore::init`].
///
/// # Concurrency
/// Mutations run under an in-process mutex and a `.lock` file created with
/// `O_EXCL`, so several processes (the daemon and `heraldctl`) can share one
/// directory. A lock file older than `stale_lock_secs` is assumed to belong
/// to a crashed process and is broken. Reads take no lock.
#[derive(Debug, Clone)]
pub struct FileQueueStore {
    path: PathBuf,
    lock_timeout: Duration,
    stale_lock_after: Duration,
    local: Arc<Mutex<()>>,
}

impl Default for FileQueueStore {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/spool/herald"),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            stale_lock_after: DEFAULT_STALE_LOCK,
            local: Arc::default(),
        }
    }
}

impl FileQueueStore {
    /// Create a store rooted at `path`. Call [`FileQueueStore::init`] before use.
    ///
    /// # Errors
    /// Returns [`ValidationError::InvalidPath`] for relative paths, paths with
    /// `..` components and system directories.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        Self::validate_path(&path)?;

        Ok(Self {
            path,
            ..Self::default()
        })
    }

    fn validate_path(path: &Path) -> std::result::Result<(), ValidationError> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(ValidationError::InvalidPath(format!(
                "Queue path cannot contain '..' components: {}",
                path.display()
            )));
        }

        if !path.is_absolute() {
            return Err(ValidationError::InvalidPath(format!(
                "Queue path must be absolute: {}",
                path.display()
            )));
        }

        let sensitive_prefixes = [
            "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
        ];

        if let Some(prefix) = sensitive_prefixes.iter().find(|p| path.starts_with(p)) {
            return Err(ValidationError::InvalidPath(format!(
                "Queue path cannot be in system directory {prefix}: {}",
                path.display()
            )));
        }

        Ok(())
    }

    /// How long a mutation waits for the lock file before failing.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Age after which a lock file is considered abandoned.
    #[must_use]
    pub const fn with_stale_lock_after(mut self, age: Duration) -> Self {
        self.stale_lock_after = age;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the queue directory if needed and remove temp files left by
    /// interrupted writes.
    ///
    /// # Errors
    /// Fails if the directory cannot be created or the path is not a directory.
    pub fn init(&self) -> Result<()> {
        internal!("Initialising queue at {}", self.path.display());

        if !self.path.try_exists()? {
            internal!("{} does not exist, creating...", self.path.display());
            std::fs::create_dir_all(&self.path)?;
        } else if !self.path.is_dir() {
            return Err(ValidationError::NotDirectory(self.path.display().to_string()).into());
        }

        let mut cleaned = 0;
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(level = INFO, "Cleaned up {cleaned} orphaned temp files from queue");
        }

        Ok(())
    }

    fn row_path(&self, id: MessageId) -> PathBuf {
        self.path.join(format!("{:020}.{ROW_EXTENSION}", id.get()))
    }

    fn parse_row_name(name: &str) -> Option<MessageId> {
        name.strip_suffix(ROW_EXTENSION)?
            .strip_suffix('.')?
            .parse()
            .ok()
    }

    async fn write_atomic(&self, name: &str, contents: &[u8]) -> Result<()> {
        let temp = self.path.join(format!("{TEMP_PREFIX}{name}"));
        fs::write(&temp, contents).await?;
        fs::rename(&temp, self.path.join(name)).await?;
        Ok(())
    }

    async fn read_row(&self, id: MessageId) -> Result<Option<Row>> {
        let path = self.row_path(id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (row, _): (Row, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;

        if row.id() != id {
            return Err(SerializationError::Corrupted {
                path: path.display().to_string(),
                reason: format!("record holds message {}", row.id()),
            }
            .into());
        }

        Ok(Some(row))
    }

    async fn write_row(&self, row: &Row) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(row, bincode::config::standard())?;
        let name = format!("{:020}.{ROW_EXTENSION}", row.id().get());
        self.write_atomic(&name, &bytes).await
    }

    async fn remove_row(&self, id: MessageId) -> Result<()> {
        fs::remove_file(self.row_path(id)).await?;
        Ok(())
    }

    async fn row_ids(&self) -> Result<Vec<MessageId>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            if let Some(id) = Self::parse_row_name(&name) {
                ids.push(id);
            }
        }

        ids.sort_unstable();
        Ok(ids)
    }

    /// Rows are read one by one, so a row deleted mid-scan is skipped.
    async fn rows(&self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for id in self.row_ids().await? {
            if let Some(row) = self.read_row(id).await? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    async fn next_id(&self) -> Result<MessageId> {
        let last = match fs::read_to_string(self.path.join(SEQUENCE_FILE)).await {
            Ok(text) => text.trim().parse::<u64>().map_err(|e| SerializationError::Corrupted {
                path: SEQUENCE_FILE.to_string(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => self
                .row_ids()
                .await?
                .last()
                .map_or(0, |id| id.get()),
            Err(e) => return Err(e.into()),
        };

        let next = last + 1;
        self.write_atomic(SEQUENCE_FILE, next.to_string().as_bytes())
            .await?;
        Ok(MessageId::new(next))
    }

    async fn lock(&self) -> Result<LockFile> {
        LockFile::acquire(
            &self.local,
            self.path.join(LOCK_FILE),
            self.lock_timeout,
            self.stale_lock_after,
        )
        .await
    }

    async fn claim(&self, request: &ClaimRequest<'_>, selection: Selection) -> Result<Vec<Claim>> {
        let ttl = chrono::Duration::from_std(request.lease)
            .map_err(|e| QueueError::Internal(format!("Invalid claim lease: {e}")))?;

        let _lock = self.lock().await?;
        let now = Utc::now();
        let mut rows = self.rows().await?;

        let picked = {
            let refs: Vec<&Row> = rows.iter().collect();
            select_claimable(&refs, selection, now, request.retry_threshold, request.exclude, request.limit)
        };

        let mut claims = Vec::with_capacity(picked.len());
        for index in picked {
            let row = &mut rows[index];
            let claim = row.claim(now, ttl);
            self.write_row(row).await?;
            claims.push(claim);
        }

        Ok(claims)
    }

    /// Apply `f` to one row under the store lock, writing it back afterwards.
    async fn update_row<T>(&self, id: MessageId, f: impl FnOnce(&mut Row) -> T + Send) -> Result<Option<T>> {
        let _lock = self.lock().await?;

        let Some(mut row) = self.read_row(id).await? else {
            return Ok(None);
        };

        let before = row.clone();
        let result = f(&mut row);
        if row != before {
            self.write_row(&row).await?;
        }

        Ok(Some(result))
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn enqueue(&self, recipient: Recipient, body: String) -> Result<MessageId> {
        let _lock = self.lock().await?;

        let id = self.next_id().await?;
        let row = Row::new(QueuedMessage::new(id, recipient, body, Utc::now()));
        self.write_row(&row).await?;
        audit::log_enqueued(id.get(), &row.message.recipient.to_string(), row.message.body.len());

        Ok(id)
    }

    async fn claim_pending(&self, request: ClaimRequest<'_>) -> Result<Vec<Claim>> {
        self.claim(&request, Selection::Deliverable).await
    }

    async fn mark_sent(&self, id: MessageId, token: ClaimToken) -> Result<WriteOutcome> {
        let now = Utc::now();
        Ok(self
            .update_row(id, |row| row.mark_sent(token, now))
            .await?
            .unwrap_or(WriteOutcome::Stale))
    }

    async fn record_failure(
        &self,
        id: MessageId,
        token: ClaimToken,
        failure: Failure,
    ) -> Result<Option<u32>> {
        Ok(self
            .update_row(id, |row| row.record_failure(token, failure))
            .await?
            .flatten())
    }

    async fn release(&self, id: MessageId, token: ClaimToken) -> Result<WriteOutcome> {
        Ok(self
            .update_row(id, |row| row.release(token))
            .await?
            .unwrap_or(WriteOutcome::Stale))
    }

    async fn claim_exhausted(&self, request: ClaimRequest<'_>) -> Result<Vec<Claim>> {
        self.claim(&request, Selection::Exhausted).await
    }

    async fn remove_claimed(&self, id: MessageId, token: ClaimToken) -> Result<Option<QueuedMessage>> {
        let _lock = self.lock().await?;
        let Some(row) = self.read_row(id).await? else {
            return Ok(None);
        };
        if !row.owned_by(token) {
            return Ok(None);
        }
        self.remove_row(id).await?;
        Ok(Some(row.message))
    }

    async fn delete(&self, id: MessageId) -> Result<QueuedMessage> {
        let _lock = self.lock().await?;
        let row = self.read_row(id).await?.ok_or(QueueError::NotFound(id))?;
        self.remove_row(id).await?;
        Ok(row.message)
    }

    async fn take(&self, id: MessageId) -> Result<QueuedMessage> {
        let _lock = self.lock().await?;
        let row = self.read_row(id).await?.ok_or(QueueError::NotFound(id))?;
        if row.is_claimed(Utc::now()) {
            return Err(QueueError::Claimed(id));
        }
        self.remove_row(id).await?;
        Ok(row.message)
    }

    async fn get(&self, id: MessageId) -> Result<QueuedMessage> {
        self.read_row(id)
            .await?
            .map(|row| row.message)
            .ok_or(QueueError::NotFound(id))
    }

    async fn list(&self, filter: &QueueFilter) -> Result<Vec<QueuedMessage>> {
        Ok(self
            .rows()
            .await?
            .into_iter()
            .map(|row| row.message)
            .filter(|message| filter.matches(message))
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn store() -> (tempfile::TempDir, FileQueueStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileQueueStore::new(dir.path()).expect("store");
        store.init().expect("init");
        (dir, store)
    }

    #[test]
    fn rejects_unsafe_paths() {
        assert!(FileQueueStore::new("relative/queue").is_err());
        assert!(FileQueueStore::new("/var/spool/../etc").is_err());
        assert!(FileQueueStore::new("/etc/herald").is_err());
        assert!(FileQueueStore::new("/var/spool/herald").is_ok());
    }

    #[test]
    fn init_removes_temp_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(".tmp_00000000000000000001.msg"), b"partial").expect("write");

        let store = FileQueueStore::new(dir.path()).expect("store");
        store.init().expect("init");

        assert_eq!(std::fs::read_dir(dir.path()).expect("read").count(), 0);
    }

    #[test]
    fn row_names_round_trip() {
        let (_dir, store) = store();
        let path = store.row_path(MessageId::new(42));
        let name = path.file_name().expect("name").to_string_lossy().to_string();
        assert_eq!(name, "00000000000000000042.msg");
        assert_eq!(FileQueueStore::parse_row_name(&name), Some(MessageId::new(42)));
        assert_eq!(FileQueueStore::parse_row_name("queue.seq"), None);
    }

    #[tokio::test]
    async fn lock_is_released_on_drop() {
        let (_dir, store) = store();
        {
            let _lock = store.lock().await.expect("lock");
            assert!(store.path().join(LOCK_FILE).exists());
        }
        assert!(!store.path().join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn stale_lock_is_broken() {
        let (dir, _) = store();
        let store = FileQueueStore::new(dir.path())
            .expect("store")
            .with_stale_lock_after(Duration::ZERO)
            .with_lock_timeout(Duration::from_millis(50));

        std::fs::write(dir.path().join(LOCK_FILE), b"").expect("write");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let id = store
            .enqueue(Recipient::direct("a@example.com"), String::new())
            .await
            .expect("enqueue");
        assert_eq!(id, MessageId::new(1));
    }

    #[tokio::test]
    async fn held_lock_times_out() {
        let (dir, _) = store();
        let store = FileQueueStore::new(dir.path())
            .expect("store")
            .with_lock_timeout(Duration::from_millis(20));

        std::fs::write(dir.path().join(LOCK_FILE), b"").expect("write");

        let err = store
            .enqueue(Recipient::direct("a@example.com"), String::new())
            .await
            .expect_err("locked");
        assert!(matches!(err, QueueError::LockTimeout(_)));
    }
}
