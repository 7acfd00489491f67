//! The transactional encrypted file store.
//!
//! A [`Store`] persists application objects as self-describing container
//! files under a root directory. Writes are atomic (temp file + rename),
//! reads verify the container framing, and read-modify-write cycles go
//! through [`Store::open_for_update`] / [`Store::open_many_for_update`],
//! which combine file locking, concurrent reads, backups, and
//! commit/rollback semantics. Multi-file updates left behind by a crashed
//! process are rolled back when the store is constructed.
//!
//! With a master key every file is encrypted under a fresh wrapped subkey
//! and padded to blur its size; without one the same container framing is
//! written in the clear.

mod backup;
pub(crate) mod blob;
pub(crate) mod container;
mod lock;

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::crypto::{EncryptionKey, MasterKey};
use crate::error::{Result, StoreError};

pub use blob::BlobReader;
pub use container::{ContainerWriter, Encoding};

use container::{
    file_context, open_container, open_write_stream, F_COMPRESSED, F_ENCRYPTED, F_PADDED,
    MAX_PADDING_DATA,
};

/// An object that marshals itself to bytes, stored with the `Binary`
/// encoding.
pub trait BinaryRecord: Sized {
    /// Encodes the object.
    fn to_bytes(&self) -> Result<Vec<u8>>;
    /// Decodes an object previously encoded with
    /// [`BinaryRecord::to_bytes`].
    fn from_bytes(bytes: &[u8]) -> Result<Self>;
}

/// An object that can participate in a transactional update.
///
/// Implemented for every `serde` type; the blanket implementation reads and
/// writes through the store's default encoding.
pub trait TxnValue: Send + Sync {
    /// Replaces `self` with the object stored under `name`.
    fn load_from(&mut self, store: &Store, name: &str) -> Result<()>;
    /// Writes `self` to `name`.
    fn store_to(&self, store: &Store, name: &str) -> Result<()>;
}

impl<T> TxnValue for T
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn load_from(&mut self, store: &Store, name: &str) -> Result<()> {
        *self = store.read_data_file(name)?;
        Ok(())
    }

    fn store_to(&self, store: &Store, name: &str) -> Result<()> {
        store.save_data_file(name, self)
    }
}

// =============================================================================
// Store
// =============================================================================

/// Atomically reads, writes, and updates encrypted files under a root
/// directory.
pub struct Store {
    dir: PathBuf,
    master_key: Option<MasterKey>,
    compress: bool,
    default_encoding: Encoding,
}

impl Store {
    /// Opens a store rooted at `dir`.
    ///
    /// The master key encrypts and decrypts the per-file subkeys; without
    /// one, files are stored in the clear. Construction rolls back any
    /// multi-file update abandoned by a crashed process; a rollback failure
    /// aborts construction.
    pub fn new(dir: impl AsRef<Path>, master_key: Option<MasterKey>) -> Result<Store> {
        let store = Store {
            dir: dir.as_ref().to_path_buf(),
            master_key,
            compress: false,
            default_encoding: Encoding::Json,
        };
        store.rollback_pending_ops()?;
        Ok(store)
    }

    /// The root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Compresses data files written after this call.
    pub fn set_compression(&mut self, on: bool) {
        self.compress = on;
    }

    /// Switches the default object encoding between indented JSON (the
    /// default) and self-describing tagged binary.
    pub fn use_tagged_encoding(&mut self, on: bool) {
        self.default_encoding = if on { Encoding::Tagged } else { Encoding::Json };
    }

    /// Hex-encoded keyed hash of `s`, for deriving opaque file names.
    ///
    /// # Panics
    ///
    /// Panics if the store has no master key.
    pub fn hash_string(&self, s: &str) -> String {
        let key = self
            .master_key()
            .expect("hash_string requires a master key");
        hex::encode(key.hash(s.as_bytes()))
    }

    pub(crate) fn master_key(&self) -> Option<&EncryptionKey> {
        self.master_key.as_deref()
    }

    pub(crate) fn full_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub(crate) fn create_parent_if_missing(&self, path: &Path) -> Result<()> {
        use std::os::unix::fs::DirBuilderExt;
        let parent = path.parent().unwrap_or(&self.dir);
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)
            .map_err(|e| StoreError::io(format!("create {}", parent.display()), e))
    }

    // -------------------------------------------------------------------------
    // Reading and writing data files
    // -------------------------------------------------------------------------

    /// Reads the object stored under `name` (JSON or tagged binary
    /// encoding).
    pub fn read_data_file<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let mut container = open_container(self.master_key(), name, &self.full_path(name))?;
        let payload = container.read_payload()?;
        match container.encoding {
            Encoding::Json => serde_json::from_slice(&payload).map_err(|e| {
                log::debug!("json decode of {name}: {e}");
                StoreError::serialization(e)
            }),
            Encoding::Tagged => ciborium::de::from_reader(payload.as_slice()).map_err(|e| {
                log::debug!("tagged decode of {name}: {e}");
                StoreError::serialization(e)
            }),
            other => Err(StoreError::WrongEncoding(other as u8)),
        }
    }

    /// Reads a file stored with the `Binary` encoding.
    pub fn read_binary_file<T: BinaryRecord>(&self, name: &str) -> Result<T> {
        let mut container = open_container(self.master_key(), name, &self.full_path(name))?;
        if container.encoding != Encoding::Binary {
            return Err(StoreError::WrongEncoding(container.encoding as u8));
        }
        T::from_bytes(&container.read_payload()?)
    }

    /// Reads a file stored with the `Raw` encoding.
    pub fn read_raw_file(&self, name: &str) -> Result<Vec<u8>> {
        let mut container = open_container(self.master_key(), name, &self.full_path(name))?;
        if container.encoding != Encoding::Raw {
            return Err(StoreError::WrongEncoding(container.encoding as u8));
        }
        container.read_payload()
    }

    /// Atomically replaces the object stored under `name`.
    ///
    /// The caller is responsible for serializing writers; see
    /// [`Store::open_for_update`] for the locked read-modify-write cycle.
    pub fn save_data_file<T: Serialize + ?Sized>(&self, name: &str, obj: &T) -> Result<()> {
        self.save_encoded(name, self.default_encoding, obj)
    }

    /// Atomically replaces `name` with an object using its own binary
    /// marshalling.
    pub fn save_binary_file<T: BinaryRecord>(&self, name: &str, obj: &T) -> Result<()> {
        let bytes = obj.to_bytes()?;
        self.replace_file(name, Encoding::Binary, |w| {
            w.write_all(&bytes).map_err(StoreError::from)
        })
    }

    /// Atomically replaces `name` with raw bytes.
    pub fn save_raw_file(&self, name: &str, data: &[u8]) -> Result<()> {
        self.replace_file(name, Encoding::Raw, |w| {
            w.write_all(data).map_err(StoreError::from)
        })
    }

    /// Creates `name` with an initial value, so a later update cycle finds
    /// it. Fails if the file already exists.
    pub fn create_empty_file<T: Serialize>(&self, name: &str, empty: &T) -> Result<()> {
        let flags = self.flags_for(self.default_encoding);
        let path = self.full_path(name);
        self.create_parent_if_missing(&path)?;
        let mut w = open_write_stream(
            self.master_key(),
            &path,
            flags,
            file_context(name),
            MAX_PADDING_DATA,
        )?;
        self.encode_default(&mut w, self.default_encoding, empty)?;
        w.close()
    }

    fn save_encoded<T: Serialize + ?Sized>(
        &self,
        name: &str,
        encoding: Encoding,
        obj: &T,
    ) -> Result<()> {
        self.replace_file(name, encoding, |w| self.encode_default(w, encoding, obj))
    }

    fn encode_default<T: Serialize + ?Sized>(
        &self,
        w: &mut ContainerWriter,
        encoding: Encoding,
        obj: &T,
    ) -> Result<()> {
        match encoding {
            Encoding::Json => {
                serde_json::to_writer_pretty(&mut *w, obj).map_err(StoreError::serialization)
            }
            Encoding::Tagged => {
                ciborium::ser::into_writer(obj, &mut *w).map_err(StoreError::serialization)
            }
            other => Err(StoreError::InvalidArgument(format!(
                "objects cannot be saved with the {other:?} encoding"
            ))),
        }
    }

    /// Writes a new container to `<name>.tmp-<nanos>` and atomically renames
    /// it over `name`.
    fn replace_file(
        &self,
        name: &str,
        encoding: Encoding,
        emit: impl FnOnce(&mut ContainerWriter) -> Result<()>,
    ) -> Result<()> {
        let tmp = format!("{name}.tmp-{}", backup::unix_nanos());
        let tmp_path = self.full_path(&tmp);
        self.create_parent_if_missing(&tmp_path)?;
        let mut w = open_write_stream(
            self.master_key(),
            &tmp_path,
            self.flags_for(encoding),
            file_context(name),
            MAX_PADDING_DATA,
        )?;
        if let Err(e) = emit(&mut w) {
            drop(w);
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }
        w.close()?;
        std::fs::rename(&tmp_path, self.full_path(name))
            .map_err(|e| StoreError::io(format!("rename {tmp}"), e))
    }

    pub(crate) fn flags_for(&self, encoding: Encoding) -> u8 {
        let mut flags = encoding as u8;
        if self.master_key.is_some() {
            flags |= F_ENCRYPTED | F_PADDED;
        }
        // Raw payloads are never compressed.
        if self.compress && encoding != Encoding::Raw {
            flags |= F_COMPRESSED;
        }
        flags
    }

    /// Writes the pending-op record; always JSON so recovery does not depend
    /// on the configured default encoding.
    pub(crate) fn save_pending<T: Serialize>(&self, name: &str, op: &T) -> Result<()> {
        self.save_encoded(name, Encoding::Json, op)
    }

    // -------------------------------------------------------------------------
    // Updates
    // -------------------------------------------------------------------------

    /// Opens `file` for a locked read-modify-write cycle.
    ///
    /// The current value is loaded into `obj`. Mutate it, then call
    /// [`Update::commit`] with the object to write it back, or
    /// [`Update::rollback`] to discard the changes. Dropping the update
    /// releases the lock without writing.
    pub fn open_for_update<T: TxnValue>(&self, file: &str, obj: &mut T) -> Result<Update<'_>> {
        self.open_many_for_update(&[file], &mut [obj as &mut dyn TxnValue])
    }

    /// Like [`Store::open_for_update`], for several files at once.
    ///
    /// All files are locked (in a deadlock-free total order) and read
    /// concurrently into `objects`, one task per file. On commit either
    /// every file reflects its new value or, after any failure, every file
    /// keeps its old value: with more than one file a backup of the prior
    /// contents is taken first and restored if any write fails.
    pub fn open_many_for_update<'s>(
        &'s self,
        files: &[&str],
        objects: &mut [&mut dyn TxnValue],
    ) -> Result<Update<'s>> {
        if files.len() != objects.len() {
            return Err(StoreError::InvalidArgument(format!(
                "{} files but {} objects",
                files.len(),
                objects.len()
            )));
        }
        self.lock_many(files)?;

        let results: Vec<Result<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = files
                .iter()
                .zip(objects.iter_mut())
                .map(|(name, obj)| scope.spawn(move || obj.load_from(self, name)))
                .collect();
            handles.into_iter().map(join_unwind).collect()
        });
        let errors: Vec<StoreError> = results.into_iter().filter_map(Result::err).collect();
        if !errors.is_empty() {
            let _ = self.unlock_many(files);
            return Err(StoreError::aggregate(errors));
        }

        Ok(Update {
            store: self,
            files: files.iter().map(ToString::to_string).collect(),
            state: UpdateState::Open,
        })
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("dir", &self.dir)
            .field("encrypted", &self.master_key.is_some())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Update
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateState {
    Open,
    Committed,
    RolledBack,
}

/// An in-progress update of one or more locked files.
///
/// Exactly one of [`Update::commit`] or [`Update::rollback`] finishes the
/// update; later calls report [`StoreError::AlreadyCommitted`] or
/// [`StoreError::AlreadyRolledBack`]. An update dropped while open releases
/// its locks without writing.
#[must_use = "an update holds file locks until committed or rolled back"]
pub struct Update<'s> {
    store: &'s Store,
    files: Vec<String>,
    state: UpdateState,
}

impl Update<'_> {
    /// Writes `objects` to the locked files and releases the locks.
    ///
    /// `objects` must correspond to the files the update was opened with, in
    /// the same order. With more than one file, the prior contents are
    /// backed up first; if any write fails the backup is restored, so the
    /// files never mix old and new values.
    pub fn commit(&mut self, objects: &[&dyn TxnValue]) -> Result<()> {
        match self.state {
            UpdateState::Committed => return Err(StoreError::AlreadyCommitted),
            UpdateState::RolledBack => return Err(StoreError::AlreadyRolledBack),
            UpdateState::Open => {}
        }
        if objects.len() != self.files.len() {
            return Err(StoreError::InvalidArgument(format!(
                "{} files but {} objects",
                self.files.len(),
                objects.len()
            )));
        }

        let backup = if self.files.len() > 1 {
            match backup::BackupSet::create(self.store, self.files.clone()) {
                Ok(b) => Some(b),
                Err(e) => {
                    self.state = UpdateState::RolledBack;
                    let _ = self.store.unlock_many(&self.files);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let store = self.store;
        let results: Vec<Result<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .files
                .iter()
                .zip(objects.iter())
                .map(|(name, obj)| scope.spawn(move || obj.store_to(store, name)))
                .collect();
            handles.into_iter().map(join_unwind).collect()
        });
        let errors: Vec<StoreError> = results.into_iter().filter_map(Result::err).collect();

        if errors.is_empty() {
            if let Some(b) = backup {
                if let Err(e) = b.delete() {
                    log::error!("deleting backup after commit: {e}");
                }
            }
            self.state = UpdateState::Committed;
            self.store.unlock_many(&self.files)
        } else {
            if let Some(b) = backup {
                if let Err(e) = b.restore() {
                    log::error!("restoring backup after failed commit: {e}");
                }
            }
            self.state = UpdateState::RolledBack;
            let _ = self.store.unlock_many(&self.files);
            Err(StoreError::aggregate(errors))
        }
    }

    /// Releases the locks without writing.
    ///
    /// Reports [`StoreError::RolledBack`] to confirm that no data was
    /// written; that is the expected result of a clean rollback.
    pub fn rollback(&mut self) -> Result<()> {
        match self.state {
            UpdateState::Committed => return Err(StoreError::AlreadyCommitted),
            UpdateState::RolledBack => return Err(StoreError::AlreadyRolledBack),
            UpdateState::Open => {}
        }
        self.state = UpdateState::RolledBack;
        self.store.unlock_many(&self.files)?;
        Err(StoreError::RolledBack)
    }
}

impl Drop for Update<'_> {
    fn drop(&mut self) {
        if self.state == UpdateState::Open {
            let _ = self.store.unlock_many(&self.files);
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn join_unwind<T>(handle: std::thread::ScopedJoinHandle<'_, T>) -> T {
    match handle.join() {
        Ok(v) => v,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Runs `f` over `items` concurrently, one task per item, and joins all
/// results.
pub(crate) fn fan_out<T, F>(items: &[T], f: F) -> Vec<Result<()>>
where
    T: Sync,
    F: Fn(&T) -> Result<()> + Sync,
{
    std::thread::scope(|scope| {
        let handles: Vec<_> = items.iter().map(|item| scope.spawn(|| f(item))).collect();
        handles.into_iter().map(join_unwind).collect()
    })
}
