//! Encryption keys and streams.
//!
//! A [`MasterKey`] is a long-lived key, normally persisted on disk sealed
//! under a passphrase. It never encrypts file contents directly: each file
//! gets a fresh subkey, wrapped by the master key and embedded at the head of
//! the file.
//!
//! [`EncryptionKey`] is the capability set shared by master keys and
//! subkeys: small-data encrypt/decrypt, keyed hashing, subkey wrap/unwrap,
//! and chunked seekable streams. It is a closed set of variants — AES-256,
//! XChaCha20-Poly1305, and TPM-wrapped — rather than a trait, so the wire
//! sizes of wrapped keys stay knowable at the container layer.

mod aes;
mod chacha;
mod material;
mod masterkey;
pub mod stream;
mod tpm;

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

pub use aes::AesKey;
pub use chacha::ChaChaKey;
pub use tpm::{TpmDevice, TpmKey};

pub(crate) use aes::AES_WRAPPED_KEY_SIZE;
pub(crate) use chacha::CHACHA_WRAPPED_KEY_SIZE;

use crate::error::{Result, StoreError};
use stream::{StreamCipher, StreamReader, StreamWriter};

/// The cryptographic algorithm backing a master key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// AES-256: CBC+HMAC-SHA-256 for small data, GCM for streams, PBKDF2 for
    /// the passphrase envelope.
    #[default]
    Aes256,
    /// XChaCha20-Poly1305 for small data, ChaCha20-Poly1305 for streams,
    /// Argon2id for the passphrase envelope.
    ChaCha20Poly1305,
    /// Like [`Algorithm::Aes256`], with the master key bound to a TPM.
    Aes256Tpm,
}

/// Options for creating or reading a master key.
#[derive(Clone, Default)]
pub struct KeyOptions {
    /// When set, a key that is reclaimed without an explicit wipe aborts the
    /// process instead of merely logging.
    pub strict_wipe: bool,
    /// TPM device, required by [`Algorithm::Aes256Tpm`] and by reading
    /// version-3 master key files.
    pub tpm: Option<Arc<dyn TpmDevice>>,
}

// =============================================================================
// EncryptionKey
// =============================================================================

/// An encryption key: one of the supported variants behind a single
/// capability surface.
pub enum EncryptionKey {
    /// AES-256-CBC + HMAC-SHA-256.
    Aes(AesKey),
    /// XChaCha20-Poly1305.
    ChaCha(ChaChaKey),
    /// RSA wrap through a TPM; streams unsupported.
    Tpm(TpmKey),
}

impl EncryptionKey {
    /// Encrypts a small blob.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Aes(k) => k.encrypt(data),
            Self::ChaCha(k) => k.encrypt(data),
            Self::Tpm(k) => k.encrypt(data),
        }
    }

    /// Decrypts data produced by [`EncryptionKey::encrypt`] under the same
    /// key.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Aes(k) => k.decrypt(data),
            Self::ChaCha(k) => k.decrypt(data),
            Self::Tpm(k) => k.decrypt(data),
        }
    }

    /// Keyed hash of `data`, 32 bytes.
    pub fn hash(&self, data: &[u8]) -> [u8; 32] {
        match self {
            Self::Aes(k) => k.hash(data),
            Self::ChaCha(k) => k.hash(data),
            Self::Tpm(k) => k.hash(data),
        }
    }

    /// Creates a fresh subkey wrapped under this key. TPM keys hand out AES
    /// subkeys so file contents can still stream.
    pub fn new_subkey(&self) -> Result<EncryptionKey> {
        Ok(match self {
            Self::Aes(k) => Self::Aes(k.new_subkey()?),
            Self::ChaCha(k) => Self::ChaCha(k.new_subkey()?),
            Self::Tpm(k) => Self::Aes(k.new_subkey()?),
        })
    }

    /// Unwraps a subkey produced by [`EncryptionKey::new_subkey`].
    pub fn decrypt_subkey(&self, wrapped: &[u8]) -> Result<EncryptionKey> {
        Ok(match self {
            Self::Aes(k) => Self::Aes(k.decrypt_subkey(wrapped)?),
            Self::ChaCha(k) => Self::ChaCha(k.decrypt_subkey(wrapped)?),
            Self::Tpm(k) => Self::Aes(k.decrypt_subkey(wrapped)?),
        })
    }

    /// On-disk size of a subkey wrapped by this key.
    pub fn wrapped_key_size(&self) -> Result<usize> {
        match self {
            Self::Aes(_) => Ok(AES_WRAPPED_KEY_SIZE),
            Self::ChaCha(_) => Ok(CHACHA_WRAPPED_KEY_SIZE),
            Self::Tpm(k) => k.wrapped_key_size(),
        }
    }

    /// Reads a wrapped subkey from `r` and unwraps it.
    pub fn read_wrapped_subkey<R: Read>(&self, r: &mut R) -> Result<EncryptionKey> {
        let mut wrapped = vec![0u8; self.wrapped_key_size()?];
        r.read_exact(&mut wrapped).map_err(|e| {
            log::debug!("read_wrapped_subkey: {e}");
            StoreError::DecryptFailed
        })?;
        self.decrypt_subkey(&wrapped)
    }

    /// Writes this subkey's wrapped form to `w`.
    ///
    /// Only subkeys carry a wrapped form; calling this on a master key is an
    /// error.
    pub fn write_wrapped_subkey<W: Write>(&self, w: &mut W) -> Result<()> {
        let wrapped = match self {
            Self::Aes(k) => k.wrapped.as_deref(),
            Self::ChaCha(k) => k.wrapped.as_deref(),
            Self::Tpm(_) => None,
        };
        let Some(wrapped) = wrapped else {
            log::debug!("write_wrapped_subkey: key has no wrapped form");
            return Err(StoreError::EncryptFailed);
        };
        w.write_all(wrapped)
            .map_err(|e| StoreError::io("write wrapped subkey", e))
    }

    /// Opens a chunked AEAD reader over `r`. `ctx` binds the stream nonces to
    /// the file the ciphertext belongs to.
    pub fn start_reader<R: Read>(&self, ctx: [u8; 4], r: R) -> Result<StreamReader<R>> {
        Ok(StreamReader::new(self.stream_cipher("stream decryption")?, ctx, r))
    }

    /// Opens a chunked AEAD writer over `w`.
    pub fn start_writer<W: Write>(&self, ctx: [u8; 4], w: W) -> Result<StreamWriter<W>> {
        Ok(StreamWriter::new(self.stream_cipher("stream encryption")?, ctx, w))
    }

    fn stream_cipher(&self, op: &'static str) -> Result<StreamCipher> {
        match self {
            Self::Aes(k) => Ok(k.stream_cipher()),
            Self::ChaCha(k) => Ok(k.stream_cipher()),
            Self::Tpm(_) => Err(StoreError::NotSupported(op)),
        }
    }

    /// Zeros the key material and disarms the drop-time wipe check.
    pub fn wipe(&mut self) {
        match self {
            Self::Aes(k) => k.material.wipe(),
            Self::ChaCha(k) => k.material.wipe(),
            Self::Tpm(k) => k.material.wipe(),
        }
    }

    fn disarm(&mut self) {
        match self {
            Self::Aes(k) => k.material.disarm(),
            Self::ChaCha(k) => k.material.disarm(),
            Self::Tpm(k) => k.material.disarm(),
        }
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            Self::Aes(_) => "Aes",
            Self::ChaCha(_) => "ChaCha",
            Self::Tpm(_) => "Tpm",
        };
        f.debug_struct("EncryptionKey")
            .field("variant", &variant)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// MasterKey
// =============================================================================

/// A long-lived key that wraps per-file subkeys, persisted on disk sealed
/// under a passphrase.
#[derive(Debug)]
pub struct MasterKey {
    key: EncryptionKey,
}

impl MasterKey {
    /// Creates a new master key.
    ///
    /// # Errors
    ///
    /// [`Algorithm::Aes256Tpm`] requires [`KeyOptions::tpm`].
    pub fn create(algo: Algorithm, options: &KeyOptions) -> Result<Self> {
        let key = match algo {
            Algorithm::Aes256 => EncryptionKey::Aes(AesKey::random(options.strict_wipe)),
            Algorithm::ChaCha20Poly1305 => {
                EncryptionKey::ChaCha(ChaChaKey::random(options.strict_wipe))
            }
            Algorithm::Aes256Tpm => {
                let device = options
                    .tpm
                    .clone()
                    .ok_or(StoreError::NotSupported("TPM algorithm without a device"))?;
                EncryptionKey::Tpm(TpmKey::create(device, options.strict_wipe)?)
            }
        };
        Ok(Self { key })
    }

    /// Creates a master key with the drop-time wipe check disarmed. Test
    /// helper; TPM keys need a device and are not supported here.
    pub fn create_for_test(algo: Algorithm) -> Result<Self> {
        if algo == Algorithm::Aes256Tpm {
            return Err(StoreError::NotSupported("test keys cannot use a TPM"));
        }
        let mut mk = Self::create(algo, &KeyOptions::default())?;
        mk.key.disarm();
        Ok(mk)
    }

    /// Reads an encrypted master key from `path` and decrypts it with
    /// `passphrase`.
    pub fn read(passphrase: &[u8], path: &Path, options: &KeyOptions) -> Result<Self> {
        Ok(Self {
            key: masterkey::read(passphrase, path, options)?,
        })
    }

    /// Encrypts the master key with `passphrase` and saves it to `path`.
    pub fn save(&self, passphrase: &[u8], path: &Path) -> Result<()> {
        masterkey::save(&self.key, passphrase, path)
    }

    /// The algorithm backing this key.
    pub fn algorithm(&self) -> Algorithm {
        match self.key {
            EncryptionKey::Aes(_) => Algorithm::Aes256,
            EncryptionKey::ChaCha(_) => Algorithm::ChaCha20Poly1305,
            EncryptionKey::Tpm(_) => Algorithm::Aes256Tpm,
        }
    }

    /// Consumes the master key, returning the underlying [`EncryptionKey`].
    pub fn into_key(self) -> EncryptionKey {
        self.key
    }
}

impl std::ops::Deref for MasterKey {
    type Target = EncryptionKey;

    fn deref(&self) -> &EncryptionKey {
        &self.key
    }
}

impl std::ops::DerefMut for MasterKey {
    fn deref_mut(&mut self) -> &mut EncryptionKey {
        &mut self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_algorithm() {
        assert_eq!(Algorithm::default(), Algorithm::Aes256);
    }

    #[test]
    fn test_subkey_round_trip_via_enum() {
        for algo in [Algorithm::Aes256, Algorithm::ChaCha20Poly1305] {
            let mk = MasterKey::create_for_test(algo).unwrap();
            let mut sub = mk.new_subkey().unwrap();

            let mut wrapped = Vec::new();
            sub.write_wrapped_subkey(&mut wrapped).unwrap();
            assert_eq!(wrapped.len(), mk.wrapped_key_size().unwrap());

            let mut sub2 = mk.read_wrapped_subkey(&mut wrapped.as_slice()).unwrap();
            let enc = sub.encrypt(b"payload").unwrap();
            assert_eq!(sub2.decrypt(&enc).unwrap(), b"payload");
            sub.wipe();
            sub2.wipe();
        }
    }

    #[test]
    fn test_master_key_has_no_wrapped_form() {
        let mk = MasterKey::create_for_test(Algorithm::Aes256).unwrap();
        let mut out = Vec::new();
        assert!(matches!(
            mk.write_wrapped_subkey(&mut out),
            Err(StoreError::EncryptFailed)
        ));
    }

    #[test]
    fn test_tpm_requires_device() {
        assert!(matches!(
            MasterKey::create(Algorithm::Aes256Tpm, &KeyOptions::default()),
            Err(StoreError::NotSupported(_))
        ));
    }

    #[test]
    fn test_cross_algorithm_decrypt_fails() {
        let aes = MasterKey::create_for_test(Algorithm::Aes256).unwrap();
        let cc = MasterKey::create_for_test(Algorithm::ChaCha20Poly1305).unwrap();
        let enc = aes.encrypt(b"data").unwrap();
        assert!(matches!(cc.decrypt(&enc), Err(StoreError::DecryptFailed)));
    }
}
