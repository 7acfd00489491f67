//! TPM-wrapped key variant.
//!
//! The key material is bound to a hardware key pair held by a TPM: small
//! data is RSA-encrypted by the device and signed with its RSA key
//! (PKCS#1 v1.5 over SHA-256 of the ciphertext). Data wrapped this way can
//! only ever be unwrapped by the same TPM.
//!
//! The TPM itself is an external collaborator, injected through the
//! [`TpmDevice`] trait. Subkeys produced by a TPM key are ordinary AES keys,
//! so file contents still stream through AES-GCM; stream operations on the
//! TPM key itself are rejected.
//!
//! Small-data layout: `version(3) || RSA ciphertext || signature`. The
//! signature length equals the device's modulus size.

use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Result, StoreError};

use super::aes::AesKey;
use super::material::{KeyMaterial, KEY_MATERIAL_SIZE};

const VERSION: u8 = 3;

/// Interface to a TPM-resident RSA key pair.
///
/// `context` is the opaque blob returned by [`TpmDevice::create_key`]; it is
/// persisted inside the master-key file and re-binds the same hardware key on
/// load. Implementations must return ciphertexts and signatures of exactly
/// the modulus size.
pub trait TpmDevice: Send + Sync {
    /// Creates a new key pair in the TPM and returns its context blob.
    fn create_key(&self) -> Result<Vec<u8>>;

    /// Returns the RSA modulus size of the key, in bits.
    fn modulus_bits(&self, context: &[u8]) -> Result<usize>;

    /// RSA-OAEP encrypts `plaintext` with the key bound to `context`.
    fn encrypt(&self, context: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Inverse of [`TpmDevice::encrypt`].
    fn decrypt(&self, context: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Signs a SHA-256 digest with RSA PKCS#1 v1.5.
    fn sign(&self, context: &[u8], digest: &[u8; 32]) -> Result<Vec<u8>>;

    /// Verifies a signature produced by [`TpmDevice::sign`].
    fn verify(&self, context: &[u8], digest: &[u8; 32], signature: &[u8]) -> bool;
}

/// An encryption key whose wrap primitive lives in a TPM.
pub struct TpmKey {
    pub(crate) material: KeyMaterial,
    pub(crate) device: Arc<dyn TpmDevice>,
    pub(crate) context: Vec<u8>,
}

impl TpmKey {
    /// Creates fresh key material bound to a new TPM key pair.
    pub(crate) fn create(device: Arc<dyn TpmDevice>, strict_wipe: bool) -> Result<Self> {
        let context = device.create_key()?;
        Ok(Self {
            material: KeyMaterial::random(strict_wipe),
            device,
            context,
        })
    }

    fn modulus_size(&self) -> Result<usize> {
        Ok(self.device.modulus_bits(&self.context)? / 8)
    }

    /// Keyed hash: HMAC-SHA-256 under the MAC half of the key material, same
    /// construction as the AES variant.
    pub(crate) fn hash(&self, data: &[u8]) -> [u8; 32] {
        use hmac::{Hmac, Mac};
        let key = self.material.unmasked();
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&key[32..]).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    pub(crate) fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let ct = self.device.encrypt(&self.context, data).map_err(|e| {
            log::debug!("TPM encrypt: {e}");
            StoreError::EncryptFailed
        })?;
        let digest: [u8; 32] = Sha256::digest(&ct).into();
        let sig = self.device.sign(&self.context, &digest).map_err(|e| {
            log::debug!("TPM sign: {e}");
            StoreError::EncryptFailed
        })?;
        let mut out = Vec::with_capacity(1 + ct.len() + sig.len());
        out.push(VERSION);
        out.extend_from_slice(&ct);
        out.extend_from_slice(&sig);
        Ok(out)
    }

    pub(crate) fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let sig_size = self.modulus_size()?;
        if data.len() < 1 + sig_size {
            return Err(StoreError::DecryptFailed);
        }
        if data[0] != VERSION {
            log::debug!("TPM decrypt: unexpected version {}", data[0]);
            return Err(StoreError::DecryptFailed);
        }
        let ct = &data[1..data.len() - sig_size];
        let sig = &data[data.len() - sig_size..];
        let digest: [u8; 32] = Sha256::digest(ct).into();
        if !self.device.verify(&self.context, &digest, sig) {
            return Err(StoreError::DecryptFailed);
        }
        self.device.decrypt(&self.context, ct).map_err(|e| {
            log::debug!("TPM decrypt: {e}");
            StoreError::DecryptFailed
        })
    }

    /// Size of a wrapped subkey: modulus-sized ciphertext plus a
    /// modulus-sized signature plus the version byte.
    pub(crate) fn wrapped_key_size(&self) -> Result<usize> {
        Ok(2 * self.modulus_size()? + 1)
    }

    /// Creates a fresh AES subkey wrapped by the TPM.
    pub(crate) fn new_subkey(&self) -> Result<AesKey> {
        let mut bytes = [0u8; KEY_MATERIAL_SIZE];
        OsRng.fill_bytes(&mut bytes);
        let wrapped = self.encrypt(&bytes)?;
        Ok(AesKey {
            material: KeyMaterial::from_bytes(&mut bytes, false),
            wrapped: Some(wrapped),
        })
    }

    /// Unwraps a subkey previously produced by [`TpmKey::new_subkey`].
    pub(crate) fn decrypt_subkey(&self, wrapped: &[u8]) -> Result<AesKey> {
        let expected = self.wrapped_key_size()?;
        if wrapped.len() != expected {
            log::debug!(
                "decrypt_subkey: unexpected wrapped key size {} != {expected}",
                wrapped.len()
            );
            return Err(StoreError::DecryptFailed);
        }
        let plain = self.decrypt(wrapped)?;
        let mut bytes: [u8; KEY_MATERIAL_SIZE] = plain
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::DecryptFailed)?;
        Ok(AesKey {
            material: KeyMaterial::from_bytes(&mut bytes, false),
            wrapped: Some(wrapped.to_vec()),
        })
    }
}
