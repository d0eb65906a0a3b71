//! Per-resource advisory locks
//!
//! Every lifecycle transition holds an exclusive `flock` on
//! `<lock_dir>/rid-<RID>.lock` for its whole duration. The lock is released
//! when the guard drops, on every exit path.

use crate::domain::Rid;
use crate::error::{Error, Result};
use backoff::ExponentialBackoff;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Scoped exclusive lock on one resource
pub struct RidLock {
    rid: Rid,
    path: PathBuf,
    _guard: Flock<File>,
}

impl RidLock {
    /// Acquire the lock, polling until `timeout` elapses
    pub async fn acquire(lock_dir: &Path, rid: Rid, timeout: Duration) -> Result<Self> {
        fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("{}.lock", rid.dir_name()));

        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            max_elapsed_time: Some(timeout),
            ..ExponentialBackoff::default()
        };

        let lock_path = path.clone();
        let attempt = move || {
            let path = lock_path.clone();
            async move {
                let file = OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|e| backoff::Error::permanent(Error::Io(e)))?;
                match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                    Ok(guard) => Ok(guard),
                    Err((_, Errno::EWOULDBLOCK)) => {
                        Err(backoff::Error::transient(Error::LockContention { rid, path }))
                    }
                    Err((_, errno)) => {
                        Err(backoff::Error::permanent(Error::Io(io::Error::from(errno))))
                    }
                }
            }
        };

        let guard = backoff::future::retry(policy, attempt).await?;
        debug!(%rid, lock = %path.display(), "Resource lock acquired");
        Ok(Self {
            rid,
            path,
            _guard: guard,
        })
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RidLock {
    fn drop(&mut self) {
        debug!(rid = %self.rid, "Resource lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn rid(n: u32) -> Rid {
        Rid::new(n).unwrap()
    }

    #[tokio::test]
    async fn test_exclusive_per_rid() {
        let dir = TempDir::new().unwrap();
        let held = RidLock::acquire(dir.path(), rid(1501), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(held.path().ends_with("rid-1501.lock"));

        let err = RidLock::acquire(dir.path(), rid(1501), Duration::from_millis(200))
            .await
            .err()
            .unwrap();
        assert_matches!(err, Error::LockContention { .. });
        assert!(err.is_retryable());

        // Other resources are independent
        let other = RidLock::acquire(dir.path(), rid(1502), Duration::from_millis(200)).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let held = RidLock::acquire(dir.path(), rid(1501), Duration::from_secs(1))
            .await
            .unwrap();

        let waiter = {
            let lock_dir = dir.path().to_path_buf();
            tokio::spawn(async move {
                RidLock::acquire(&lock_dir, rid(1501), Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(held);

        let reacquired = waiter.await.unwrap().unwrap();
        assert_eq!(reacquired.rid(), rid(1501));
    }
}
