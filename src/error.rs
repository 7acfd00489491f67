//! Error types for the store and its cryptographic layer.

use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the store and the key layer.
///
/// Cryptographic failures are deliberately opaque: every parse, MAC, padding,
/// or AEAD failure collapses to [`StoreError::DecryptFailed`] or
/// [`StoreError::EncryptFailed`] so that callers cannot be used as decryption
/// oracles. The underlying causes are emitted at debug log level only.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The ciphertext could not be decrypted.
    #[error("decryption failed")]
    DecryptFailed,

    /// The plaintext could not be encrypted.
    #[error("encryption failed")]
    EncryptFailed,

    /// The master key file has an unrecognized algorithm version byte.
    #[error("unexpected algorithm")]
    UnexpectedAlgo,

    /// The update was rolled back cleanly.
    #[error("rolled back")]
    RolledBack,

    /// The update was already rolled back by a previous call.
    #[error("already rolled back")]
    AlreadyRolledBack,

    /// The update was already committed by a previous call.
    #[error("already committed")]
    AlreadyCommitted,

    /// A stream operation required a seekable source.
    #[error("input is not seekable")]
    NotSeekable,

    /// The container declared a negative padding length.
    #[error("invalid padding")]
    InvalidPadding,

    /// The file does not start with the container magic.
    #[error("wrong file type")]
    WrongMagic,

    /// The re-encrypted header inside the stream does not match the outer one.
    #[error("wrong encrypted header")]
    HeaderMismatch,

    /// The file is encrypted but the store has no master key.
    #[error("file is encrypted, but a master key was not provided")]
    NoMasterKey,

    /// The container carries an encoding the caller did not ask for.
    #[error("unexpected encoding {0:#04x}")]
    WrongEncoding(u8),

    /// The operation is not supported by this key variant.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// A caller-side contract violation (mismatched slice lengths, bad
    /// encoding choice).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An I/O operation failed.
    #[error("{context}: {source}")]
    Io {
        /// The operation that failed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Encoding or decoding an object failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// First failure of a concurrent multi-file operation, with any further
    /// failures folded into the message.
    #[error("{first} {rest:?}")]
    Aggregate {
        /// The first error observed.
        #[source]
        first: Box<StoreError>,
        /// Messages of the remaining errors.
        rest: Vec<String>,
    },
}

impl StoreError {
    /// Creates an I/O error with context.
    pub fn io<S: Into<String>>(context: S, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates a serialization error.
    pub fn serialization<E: std::fmt::Display>(err: E) -> Self {
        Self::Serialization(err.to_string())
    }

    /// Folds a non-empty list of errors into one: the first error carries the
    /// rest as appended messages.
    pub(crate) fn aggregate(mut errors: Vec<StoreError>) -> StoreError {
        if errors.len() == 1 {
            return errors.remove(0);
        }
        let first = Box::new(errors.remove(0));
        let rest = errors.iter().map(ToString::to_string).collect();
        StoreError::Aggregate { first, rest }
    }

    /// True when the error is a propagated not-found from the filesystem.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Io { source, .. }
            if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Streams surface their failures through `std::io` traits; this conversion
/// recovers a [`StoreError`] smuggled through an [`std::io::Error`], so `?`
/// in the container layer reports `DecryptFailed` rather than a generic I/O
/// failure.
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        if err.get_ref().is_some_and(|e| e.is::<StoreError>()) {
            if let Ok(inner) = err.into_inner().expect("checked above").downcast::<StoreError>() {
                return *inner;
            }
            unreachable!("downcast verified by is::<StoreError>()");
        }
        Self::Io {
            context: "i/o".to_string(),
            source: err,
        }
    }
}

/// The inverse wrapping, used by the stream `Read`/`Seek` implementations.
impl From<StoreError> for std::io::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io { source, .. } => source,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}
