//! Backups of multi-file updates and crash recovery.
//!
//! Before a multi-file commit writes anything, every target file is copied
//! (hard-linked when the filesystem allows) to `<file>.bck-<timestamp>`, and
//! a pending-op record listing the files is written at
//! `pending/<timestamp>` through the regular container codec. On success the
//! backups and the record are deleted; on failure the backups are renamed
//! back over the targets.
//!
//! A record still present when the store is constructed marks a transaction
//! abandoned by a crashed process; construction rolls it back after a grace
//! period that keeps a still-live transaction from being stolen.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

use super::{fan_out, Store};

/// Grace period before a pending operation is considered abandoned.
const RECOVERY_GRACE: Duration = Duration::from_secs(5);

/// On-disk record of an in-flight multi-file update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PendingOp {
    /// Unix nanoseconds at backup time; also names the backup files.
    pub(crate) ts: u64,
    /// Store-relative names of the files being updated.
    pub(crate) files: Vec<String>,
}

/// A set of backup files plus their pending-op record.
pub(crate) struct BackupSet<'s> {
    store: &'s Store,
    op: PendingOp,
    pending: String,
}

pub(crate) fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_nanos() as u64
}

impl<'s> BackupSet<'s> {
    /// Backs up `files` and records the pending operation. Files that do not
    /// exist yet have nothing to back up and are skipped.
    pub(crate) fn create(store: &'s Store, files: Vec<String>) -> Result<BackupSet<'s>> {
        let op = PendingOp {
            ts: unix_nanos(),
            files,
        };
        let pending = format!("pending/{}", op.ts);
        let set = BackupSet { store, op, pending };

        let errors = set.for_each_file(|backup, file| copy_file(&backup, &file));
        if !errors.is_empty() {
            let _ = set.delete();
            return Err(StoreError::aggregate(errors));
        }
        if let Err(e) = store.save_pending(&set.pending, &set.op) {
            let _ = set.delete();
            return Err(e);
        }
        Ok(set)
    }

    /// Rebuilds the handle for a pending record found on disk.
    pub(crate) fn resume(store: &'s Store, pending: String, op: PendingOp) -> BackupSet<'s> {
        BackupSet { store, op, pending }
    }

    /// Puts every backed-up file back in place, then removes the record.
    pub(crate) fn restore(&self) -> Result<()> {
        let errors = self.for_each_file(|backup, file| {
            std::fs::rename(&backup, &file)
                .map_err(|e| StoreError::io(format!("restore {}", file.display()), e))
        });
        if !errors.is_empty() {
            return Err(StoreError::aggregate(errors));
        }
        self.remove_pending()
    }

    /// Discards the backups after a successful commit, then removes the
    /// record.
    pub(crate) fn delete(&self) -> Result<()> {
        let errors = self.for_each_file(|backup, file| {
            std::fs::remove_file(&backup)
                .map_err(|e| StoreError::io(format!("remove backup of {}", file.display()), e))
        });
        if !errors.is_empty() {
            return Err(StoreError::aggregate(errors));
        }
        self.remove_pending()
    }

    pub(crate) fn ts(&self) -> u64 {
        self.op.ts
    }

    /// Runs `f(backup_path, file_path)` for every file concurrently,
    /// collecting all failures except not-found (a file with no backup is
    /// not an error at any stage).
    fn for_each_file(
        &self,
        f: impl Fn(std::path::PathBuf, std::path::PathBuf) -> Result<()> + Sync,
    ) -> Vec<StoreError> {
        let results = fan_out(&self.op.files, |name| {
            let file = self.store.dir().join(name);
            let backup = self.store.dir().join(format!("{name}.bck-{}", self.op.ts));
            f(backup, file)
        });
        results
            .into_iter()
            .filter_map(std::result::Result::err)
            .filter(|e| !e.is_not_found())
            .collect()
    }

    fn remove_pending(&self) -> Result<()> {
        match std::fs::remove_file(self.store.dir().join(&self.pending)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io("remove pending record", e)),
        }
    }
}

/// Hard-links `src` to `dst`, falling back to an exclusive byte copy on
/// filesystems without hard links.
fn copy_file(dst: &Path, src: &Path) -> Result<()> {
    if std::fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }
    let mut input = std::fs::File::open(src)
        .map_err(|e| StoreError::io(format!("open {}", src.display()), e))?;
    let mut output = {
        use std::os::unix::fs::OpenOptionsExt;
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(dst)
            .map_err(|e| StoreError::io(format!("create {}", dst.display()), e))?
    };
    std::io::copy(&mut input, &mut output)
        .map_err(|e| StoreError::io(format!("copy {}", src.display()), e))?;
    Ok(())
}

impl Store {
    /// Rolls back transactions abandoned by a crashed process. Called during
    /// store construction; any failure aborts it.
    pub(crate) fn rollback_pending_ops(&self) -> Result<()> {
        let pending_dir = self.dir().join("pending");
        let entries = match std::fs::read_dir(&pending_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::io("read pending directory", e)),
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort_unstable();

        for name in names {
            let rel = format!("pending/{name}");
            let op: PendingOp = self.read_data_file(&rel)?;

            // A record younger than the grace period may belong to a live
            // transaction; wait it out before stealing it.
            let abandoned_at = UNIX_EPOCH + Duration::from_nanos(op.ts) + RECOVERY_GRACE;
            if let Ok(wait) = abandoned_at.duration_since(SystemTime::now()) {
                std::thread::sleep(wait);
            }

            let files = op.files.clone();
            let ts = op.ts;
            BackupSet::resume(self, rel, op).restore()?;
            log::info!("rolled back pending operation {ts} {files:?}");
            // The abandoned files were most likely still locked.
            let _ = self.unlock_many(&files);
        }
        Ok(())
    }
}
