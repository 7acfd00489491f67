//! # krin
//!
//! An encrypted object store: arbitrary application objects persisted as
//! self-describing, authenticated-encrypted files on a local filesystem,
//! with atomic multi-file updates and crash recovery. For applications that
//! need confidentiality at rest for configuration and small-to-medium blobs
//! without operating a database.
//!
//! ## Layout
//!
//! - [`crypto`] — master keys, per-file subkeys, small-data encryption, and
//!   chunked seekable AEAD streams.
//! - [`store`] — the container codec, the lock manager, transactional
//!   updates with backup/rollback, crash recovery, and the blob API.
//!
//! ## Example
//!
//! ```no_run
//! use krin::{Algorithm, KeyOptions, MasterKey, Store};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Default, Serialize, Deserialize)]
//! struct Config {
//!     name: String,
//! }
//!
//! fn main() -> krin::Result<()> {
//!     let key = MasterKey::create(Algorithm::Aes256, &KeyOptions::default())?;
//!     key.save(b"passphrase", std::path::Path::new("/data/master.key"))?;
//!     let store = Store::new("/data/store", Some(key))?;
//!
//!     store.create_empty_file("config", &Config::default())?;
//!
//!     let mut config = Config::default();
//!     let mut update = store.open_for_update("config", &mut config)?;
//!     config.name = "production".into();
//!     update.commit(&[&config])?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]

pub mod crypto;
pub mod error;
pub mod store;

pub use crypto::{Algorithm, EncryptionKey, KeyOptions, MasterKey, TpmDevice};
pub use error::{Result, StoreError};
pub use store::{BinaryRecord, BlobReader, ContainerWriter, Store, TxnValue, Update};
