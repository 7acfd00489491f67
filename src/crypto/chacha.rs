//! ChaCha20-Poly1305 key variant.
//!
//! Small data is sealed with XChaCha20-Poly1305 under a random 24-byte
//! nonce; streams use ChaCha20-Poly1305 chunks with derived 12-byte nonces.
//! The keyed hash is BLAKE2b-256 under the auxiliary half of the key
//! material.
//!
//! Small-data layout: `version(2) || nonce(24) || sealed`.

use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Result, StoreError};

use super::material::{KeyMaterial, KEY_MATERIAL_SIZE};
use super::stream::StreamCipher;

type Blake2bMac256 = Blake2bMac<U32>;

const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;
const VERSION: u8 = 2;

/// Size of a wrapped ChaCha subkey:
/// 1 (version) + 24 (nonce) + 64 (key) + 16 (tag).
pub(crate) const CHACHA_WRAPPED_KEY_SIZE: usize = 105;

/// An XChaCha20-Poly1305 encryption key.
pub struct ChaChaKey {
    pub(crate) material: KeyMaterial,
    /// The wrapped form of this key, present on subkeys.
    pub(crate) wrapped: Option<Vec<u8>>,
}

impl ChaChaKey {
    pub(crate) fn random(strict_wipe: bool) -> Self {
        Self {
            material: KeyMaterial::random(strict_wipe),
            wrapped: None,
        }
    }

    /// Keyed hash: BLAKE2b-256 under the auxiliary half of the key.
    pub(crate) fn hash(&self, data: &[u8]) -> [u8; 32] {
        let key = self.material.unmasked();
        let mut mac = <Blake2bMac256 as Mac>::new_from_slice(&key[32..])
            .expect("BLAKE2b accepts 32-byte keys");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    pub(crate) fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let key = self.material.unmasked();
        let cipher =
            XChaCha20Poly1305::new_from_slice(&key[..32]).expect("key half is 32 bytes");
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(XNonce::from_slice(&nonce), data)
            .map_err(|_| StoreError::EncryptFailed)?;

        let mut out = Vec::with_capacity(1 + NONCE_SIZE + sealed.len());
        out.push(VERSION);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub(crate) fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 1 + NONCE_SIZE + TAG_SIZE {
            return Err(StoreError::DecryptFailed);
        }
        if data[0] != VERSION {
            log::debug!("ChaCha decrypt: unexpected version {}", data[0]);
            return Err(StoreError::DecryptFailed);
        }
        let key = self.material.unmasked();
        let cipher =
            XChaCha20Poly1305::new_from_slice(&key[..32]).expect("key half is 32 bytes");
        cipher
            .decrypt(
                XNonce::from_slice(&data[1..1 + NONCE_SIZE]),
                &data[1 + NONCE_SIZE..],
            )
            .map_err(|_| {
                log::debug!("ChaCha decrypt: authentication failed");
                StoreError::DecryptFailed
            })
    }

    /// Creates a fresh subkey wrapped under this key.
    pub(crate) fn new_subkey(&self) -> Result<ChaChaKey> {
        let mut bytes = [0u8; KEY_MATERIAL_SIZE];
        OsRng.fill_bytes(&mut bytes);
        let wrapped = self.encrypt(&bytes)?;
        Ok(ChaChaKey {
            material: KeyMaterial::from_bytes(&mut bytes, false),
            wrapped: Some(wrapped),
        })
    }

    /// Unwraps a subkey previously produced by [`ChaChaKey::new_subkey`].
    pub(crate) fn decrypt_subkey(&self, wrapped: &[u8]) -> Result<ChaChaKey> {
        if wrapped.len() != CHACHA_WRAPPED_KEY_SIZE {
            log::debug!(
                "decrypt_subkey: unexpected wrapped key size {} != {}",
                wrapped.len(),
                CHACHA_WRAPPED_KEY_SIZE
            );
            return Err(StoreError::DecryptFailed);
        }
        let plain = self.decrypt(wrapped)?;
        let mut bytes: [u8; KEY_MATERIAL_SIZE] = plain
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::DecryptFailed)?;
        Ok(ChaChaKey {
            material: KeyMaterial::from_bytes(&mut bytes, false),
            wrapped: Some(wrapped.to_vec()),
        })
    }

    pub(crate) fn stream_cipher(&self) -> StreamCipher {
        let key = self.material.unmasked();
        let cipher_key: &[u8; 32] = key[..32].try_into().expect("key half is 32 bytes");
        StreamCipher::chacha(cipher_key)
    }
}
