//! Advisory lock file for the file-backed store.
//!
//! A `<data>.lock` file co-located with the database serializes all
//! mutating operations across processes. Acquisition is create-exclusive
//! with bounded polling; the guard removes the file on drop. A lock file
//! whose owner died is reclaimed once it ages past the stale threshold.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use colloquy_core::error::TranscriptError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STALE_AFTER: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
}

/// Held lock; releasing is dropping.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl LockFile {
    /// Lock file co-located with the data file (`<data>.lock`).
    pub fn for_data_file(data_path: &Path) -> Self {
        let mut os = data_path.as_os_str().to_os_string();
        os.push(".lock");
        Self { path: PathBuf::from(os) }
    }

    /// Acquire the lock, polling until `timeout` elapses.
    pub async fn acquire(&self, timeout: Duration) -> Result<LockGuard, TranscriptError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.try_acquire().await {
                Ok(Some(guard)) => return Ok(guard),
                Ok(None) => {}
                Err(err) => return Err(TranscriptError::Unavailable(err)),
            }

            self.reclaim_if_stale().await;

            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(path = %self.path.display(), "lock_timeout");
                return Err(TranscriptError::Transient(format!(
                    "failed to acquire lock {} within {timeout:?}",
                    self.path.display()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Non-blocking acquirability probe: take and immediately release.
    /// Used by health checks only.
    pub async fn probe(&self) -> Result<(), String> {
        match self.try_acquire().await {
            Ok(Some(_guard)) => Ok(()),
            Ok(None) => Err(format!("lock {} is held", self.path.display())),
            Err(err) => Err(err),
        }
    }

    async fn try_acquire(&self) -> Result<Option<LockGuard>, String> {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(_file) => Ok(Some(LockGuard {
                path: self.path.clone(),
            })),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(format!("cannot create lock {}: {err}", self.path.display())),
        }
    }

    /// Remove a lock file that outlived any plausible critical section.
    async fn reclaim_if_stale(&self) {
        let Ok(meta) = tokio::fs::metadata(&self.path).await else {
            return;
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok());
        if age.is_some_and(|age| age > STALE_AFTER) {
            tracing::warn!(path = %self.path.display(), "stale_lock_reclaimed");
            let _ = tokio::fs::remove_file(&self.path).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_lock() -> (tempfile::TempDir, LockFile) {
        let dir = tempfile::tempdir().expect("temp dir");
        let lock = LockFile::for_data_file(&dir.path().join("conv.db"));
        (dir, lock)
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let (_dir, lock) = temp_lock();

        let guard = lock.acquire(Duration::from_secs(1)).await.expect("acquire");
        assert!(lock.probe().await.is_err(), "held lock must fail the probe");

        drop(guard);
        lock.probe().await.expect("released lock probes ok");
    }

    #[tokio::test]
    async fn contended_acquire_times_out_as_transient() {
        let (_dir, lock) = temp_lock();
        let _guard = lock.acquire(Duration::from_secs(1)).await.expect("first");

        let second = lock.acquire(Duration::from_millis(120)).await;
        assert!(matches!(second, Err(TranscriptError::Transient(_))));
    }

    #[tokio::test]
    async fn waiter_gets_lock_once_holder_releases() {
        let (_dir, lock) = temp_lock();
        let guard = lock.acquire(Duration::from_secs(1)).await.expect("first");

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(guard);

        waiter.await.expect("join").expect("second acquire");
    }
}
