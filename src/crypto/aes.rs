//! AES-256 key variant.
//!
//! Small data is encrypted with AES-256-CBC and authenticated with
//! HMAC-SHA-256 (encrypt-then-MAC over the ciphertext); streams use
//! AES-256-GCM chunks. The first 32 bytes of the key material drive the
//! cipher, the last 32 the HMAC.
//!
//! Small-data layout: `version(1) || IV(16) || ciphertext || MAC(32)`.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{Result, StoreError};

use super::material::{KeyMaterial, KEY_MATERIAL_SIZE};
use super::stream::StreamCipher;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const BLOCK_SIZE: usize = 16;
const IV_SIZE: usize = 16;
const MAC_SIZE: usize = 32;
const VERSION: u8 = 1;

/// Size of a wrapped AES subkey:
/// 1 (version) + 16 (IV) + 80 (64-byte key, PKCS#7 padded) + 32 (MAC).
pub(crate) const AES_WRAPPED_KEY_SIZE: usize = 129;

/// An AES-256-CBC + HMAC-SHA-256 encryption key.
pub struct AesKey {
    pub(crate) material: KeyMaterial,
    /// The wrapped form of this key, present on subkeys so it can be written
    /// at the head of the file it protects.
    pub(crate) wrapped: Option<Vec<u8>>,
}

impl AesKey {
    pub(crate) fn random(strict_wipe: bool) -> Self {
        Self {
            material: KeyMaterial::random(strict_wipe),
            wrapped: None,
        }
    }

    /// Keyed hash: HMAC-SHA-256 under the MAC half of the key.
    pub(crate) fn hash(&self, data: &[u8]) -> [u8; MAC_SIZE] {
        let key = self.material.unmasked();
        let mut mac = HmacSha256::new_from_slice(&key[32..]).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    pub(crate) fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let key = self.material.unmasked();
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);

        // PKCS#7: always at least one byte of padding. The padded plaintext
        // is encrypted in place, so no unmasked copy of it survives.
        let pad = BLOCK_SIZE - data.len() % BLOCK_SIZE;
        let mut buf = Zeroizing::new(Vec::with_capacity(data.len() + pad));
        buf.extend_from_slice(data);
        buf.extend(std::iter::repeat(pad as u8).take(pad));
        let len = buf.len();
        Aes256CbcEnc::new_from_slices(&key[..32], &iv)
            .expect("key and IV sizes are fixed")
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map_err(|e| {
                log::debug!("AES-CBC encrypt: {e}");
                StoreError::EncryptFailed
            })?;

        let mut out = Vec::with_capacity(1 + IV_SIZE + buf.len() + MAC_SIZE);
        out.push(VERSION);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&buf);
        out.extend_from_slice(&self.hash(&buf));
        Ok(out)
    }

    pub(crate) fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty()
            || (data.len() - 1) % BLOCK_SIZE != 0
            || data.len() - 1 < IV_SIZE + MAC_SIZE
        {
            return Err(StoreError::DecryptFailed);
        }
        if data[0] != VERSION {
            log::debug!("AES decrypt: unexpected version {}", data[0]);
            return Err(StoreError::DecryptFailed);
        }
        let iv = &data[1..1 + IV_SIZE];
        let ct = &data[1 + IV_SIZE..data.len() - MAC_SIZE];
        let mac = &data[data.len() - MAC_SIZE..];
        if !bool::from(mac.ct_eq(&self.hash(ct))) {
            return Err(StoreError::DecryptFailed);
        }

        let key = self.material.unmasked();
        let mut buf = ct.to_vec();
        Aes256CbcDec::new_from_slices(&key[..32], iv)
            .expect("key and IV sizes are fixed")
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|e| {
                log::debug!("AES-CBC decrypt: {e}");
                StoreError::DecryptFailed
            })?;

        let pad = *buf.last().ok_or(StoreError::DecryptFailed)? as usize;
        if pad > BLOCK_SIZE || pad > buf.len() {
            return Err(StoreError::DecryptFailed);
        }
        if buf[buf.len() - pad..].iter().any(|&b| b as usize != pad) {
            return Err(StoreError::DecryptFailed);
        }
        buf.truncate(buf.len() - pad);
        Ok(buf)
    }

    /// Creates a fresh subkey wrapped under this key.
    pub(crate) fn new_subkey(&self) -> Result<AesKey> {
        let mut bytes = [0u8; KEY_MATERIAL_SIZE];
        OsRng.fill_bytes(&mut bytes);
        let wrapped = self.encrypt(&bytes)?;
        Ok(AesKey {
            material: KeyMaterial::from_bytes(&mut bytes, false),
            wrapped: Some(wrapped),
        })
    }

    /// Unwraps a subkey previously produced by [`AesKey::new_subkey`].
    pub(crate) fn decrypt_subkey(&self, wrapped: &[u8]) -> Result<AesKey> {
        if wrapped.len() != AES_WRAPPED_KEY_SIZE {
            log::debug!(
                "decrypt_subkey: unexpected wrapped key size {} != {}",
                wrapped.len(),
                AES_WRAPPED_KEY_SIZE
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

    pub(crate) fn stream_cipher(&self) -> StreamCipher {
        let key = self.material.unmasked();
        let cipher_key: &[u8; 32] = key[..32].try_into().expect("key half is 32 bytes");
        StreamCipher::aes(cipher_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> AesKey {
        let mut key = AesKey::random(false);
        key.material.disarm();
        key
    }

    #[test]
    fn test_encrypt_decrypt_all_lengths() {
        let key = test_key();
        let msg = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
        for i in 1..=msg.len() {
            let enc = key.encrypt(&msg[..i]).unwrap();
            assert_ne!(&enc[..], &msg[..i]);
            let dec = key.decrypt(&enc).unwrap();
            assert_eq!(&dec, &msg[..i], "length {i}");
        }
    }

    #[test]
    fn test_ciphertext_layout() {
        let key = test_key();
        let enc = key.encrypt(b"x").unwrap();
        assert_eq!(enc[0], VERSION);
        // 1 + IV + one padded block + MAC.
        assert_eq!(enc.len(), 1 + IV_SIZE + BLOCK_SIZE + MAC_SIZE);
    }

    #[test]
    fn test_decrypt_rejects_tamper() {
        // The MAC covers the ciphertext; flips there and in the MAC itself
        // (and a bad version byte) must all fail. The IV is deliberately not
        // covered, matching the on-disk format.
        let key = test_key();
        let enc = key.encrypt(b"sensitive bytes").unwrap();
        for i in std::iter::once(0).chain(1 + IV_SIZE..enc.len()) {
            let mut bad = enc.clone();
            bad[i] ^= 0x01;
            assert!(
                matches!(key.decrypt(&bad), Err(StoreError::DecryptFailed)),
                "flip at {i} not detected"
            );
        }
    }

    #[test]
    fn test_decrypt_rejects_wrong_key() {
        let key = test_key();
        let other = test_key();
        let enc = key.encrypt(b"data").unwrap();
        assert!(matches!(other.decrypt(&enc), Err(StoreError::DecryptFailed)));
    }

    #[test]
    fn test_decrypt_rejects_short_input() {
        let key = test_key();
        assert!(matches!(
            key.decrypt(&[1u8; 1 + IV_SIZE + MAC_SIZE]),
            Err(StoreError::DecryptFailed)
        ));
    }

    #[test]
    fn test_wrapped_subkey_size() {
        let key = test_key();
        let mut sub = key.new_subkey().unwrap();
        assert_eq!(sub.wrapped.as_ref().unwrap().len(), AES_WRAPPED_KEY_SIZE);
        sub.material.wipe();
    }

    #[test]
    fn test_subkey_round_trip() {
        let key = test_key();
        let mut sub = key.new_subkey().unwrap();
        let wrapped = sub.wrapped.clone().unwrap();
        let mut sub2 = key.decrypt_subkey(&wrapped).unwrap();
        assert_eq!(*sub.material.unmasked(), *sub2.material.unmasked());

        // A subkey encrypts and decrypts on its own.
        let enc = sub.encrypt(b"file content").unwrap();
        assert_eq!(sub2.decrypt(&enc).unwrap(), b"file content");
        sub.material.wipe();
        sub2.material.wipe();
    }

    #[test]
    fn test_subkey_wrong_size_rejected() {
        let key = test_key();
        assert!(matches!(
            key.decrypt_subkey(&[0u8; AES_WRAPPED_KEY_SIZE - 1]),
            Err(StoreError::DecryptFailed)
        ));
    }

    #[test]
    fn test_hash_is_keyed_and_deterministic() {
        let key = test_key();
        let other = test_key();
        assert_eq!(key.hash(b"input"), key.hash(b"input"));
        assert_ne!(key.hash(b"input"), key.hash(b"other"));
        assert_ne!(key.hash(b"input"), other.hash(b"input"));
    }
}
