use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use herald_common::internal;
use tokio::{
    fs,
    sync::{Mutex, OwnedMutexGuard},
};
use ulid::Ulid;

use crate::{QueueError, Result};

/// Exclusive access to a directory shared between processes.
///
/// Holds an in-process mutex and a lock file created with `O_EXCL`; dropping
/// the value releases both. A lock file older than `stale_after` is assumed
/// to belong to a crashed process and is removed.
///
/// The file holds a token unique to this holder, so a holder whose lock was
/// broken as stale never removes the lock of whoever took it over.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    token: String,
    _local: OwnedMutexGuard<()>,
}

impl LockFile {
    /// Wait up to `timeout` for the lock at `path`.
    ///
    /// # Errors
    /// [`QueueError::LockTimeout`] when another holder keeps the lock past
    /// `timeout`, [`QueueError::Io`] when the lock file cannot be created.
    pub async fn acquire(
        local: &Arc<Mutex<()>>,
        path: PathBuf,
        timeout: Duration,
        stale_after: Duration,
    ) -> Result<Self> {
        let local = Arc::clone(local).lock_owned().await;
        let deadline = Instant::now() + timeout;

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => {
                    let token = Ulid::new().to_string();
                    if let Err(e) = fs::write(&path, &token).await {
                        let _ = fs::remove_file(&path).await;
                        return Err(e.into());
                    }
                    return Ok(Self {
                        path,
                        token,
                        _local: local,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path, stale_after).await {
                        internal!(level = WARN, "Breaking stale lock {}", path.display());
                        let _ = fs::remove_file(&path).await;
                        continue;
                    }

                    if Instant::now() >= deadline {
                        return Err(QueueError::LockTimeout(path.display().to_string()));
                    }

                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .await
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > stale_after)
}

impl Drop for LockFile {
    fn drop(&mut self) {
        match std::fs::read_to_string(&self.path) {
            Ok(owner) if owner == self.token => {
                let _ = std::fs::remove_file(&self.path);
            }
            Ok(_) => internal!(level = WARN, "Lock {} was taken over, leaving it in place", self.path.display()),
            Err(_) => {}
        }
    }
}
