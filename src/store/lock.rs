//! Filesystem-level advisory locks.
//!
//! A lock is a zero-byte sentinel at `<file>.lock`, created exclusively.
//! Waiters retry with jittered sleeps and reap locks whose mtime exceeds a
//! per-lock randomized deadline, so a crashed holder cannot block a file
//! forever. There is no fairness guarantee; concurrent waiters compete
//! freely.
//!
//! Multi-lock acquisition sorts the requested names lexicographically and
//! acquires in that order. The total order across all callers rules out
//! cyclic wait, hence deadlocks.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

use crate::error::{Result, StoreError};

use super::Store;

impl Store {
    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir().join(format!("{name}.lock"))
    }

    /// Atomically creates the lock file for `name`, retrying until it
    /// succeeds. When this returns, the caller owns the lock until
    /// [`Store::unlock`].
    pub fn lock(&self, name: &str) -> Result<()> {
        let lock_path = self.lock_path(name);
        self.create_parent_if_missing(&lock_path)?;
        let deadline = Duration::from_secs(600 + rand::thread_rng().gen_range(0..60));
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&lock_path)
            {
                Ok(f) => {
                    drop(f);
                    log::debug!("locked {name}");
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    self.try_remove_stale_lock(&lock_path, deadline);
                    let jitter = rand::thread_rng().gen_range(0..100);
                    std::thread::sleep(Duration::from_millis(100 + jitter));
                }
                Err(e) => return Err(StoreError::io(format!("lock {name}"), e)),
            }
        }
    }

    /// Removes the lock file for `name`.
    pub fn unlock(&self, name: &str) -> Result<()> {
        std::fs::remove_file(self.lock_path(name))
            .map_err(|e| StoreError::io(format!("unlock {name}"), e))?;
        log::debug!("unlocked {name}");
        Ok(())
    }

    /// Locks multiple files without risking deadlock against other callers
    /// locking an overlapping set: names are acquired in sorted order, and a
    /// failure releases everything already held.
    pub fn lock_many<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        let mut sorted: Vec<&str> = names.iter().map(AsRef::as_ref).collect();
        sorted.sort_unstable();
        let mut held: Vec<&str> = Vec::with_capacity(sorted.len());
        for name in sorted {
            if let Err(e) = self.lock(name) {
                let _ = self.unlock_many(&held);
                return Err(e);
            }
            held.push(name);
        }
        Ok(())
    }

    /// Releases locks taken by [`Store::lock_many`], in reverse sorted order.
    pub fn unlock_many<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        let mut sorted: Vec<&str> = names.iter().map(AsRef::as_ref).collect();
        sorted.sort_unstable();
        for name in sorted.into_iter().rev() {
            self.unlock(name)?;
        }
        Ok(())
    }

    fn try_remove_stale_lock(&self, lock_path: &std::path::Path, deadline: Duration) {
        let Ok(meta) = std::fs::metadata(lock_path) else {
            return;
        };
        let Ok(modified) = meta.modified() else {
            return;
        };
        if modified.elapsed().is_ok_and(|age| age > deadline)
            && std::fs::remove_file(lock_path).is_ok()
        {
            log::error!("removed stale lock {}", lock_path.display());
        }
    }
}
