//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use krin::{Algorithm, KeyOptions, MasterKey, Result, Store, StoreError, TpmDevice};

/// Deterministic stand-in for a TPM, honoring the real size contracts
/// (2048-bit modulus: modulus-sized ciphertexts and signatures).
pub struct FakeTpm {
    secret: [u8; 32],
}

pub const MODULUS_BYTES: usize = 256;
const MAX_PLAINTEXT: usize = MODULUS_BYTES - 66;

impl FakeTpm {
    pub fn new() -> Self {
        Self { secret: [0x5a; 32] }
    }

    fn mac(&self, data: &[u8]) -> [u8; 32] {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret).expect("any key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }
}

impl TpmDevice for FakeTpm {
    fn create_key(&self) -> Result<Vec<u8>> {
        Ok(b"fake-tpm-context".to_vec())
    }

    fn modulus_bits(&self, _context: &[u8]) -> Result<usize> {
        Ok(MODULUS_BYTES * 8)
    }

    fn encrypt(&self, _context: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() > MAX_PLAINTEXT {
            return Err(StoreError::EncryptFailed);
        }
        let mut out = vec![0u8; MODULUS_BYTES];
        out[0] = (plaintext.len() >> 8) as u8;
        out[1] = plaintext.len() as u8;
        for (i, b) in plaintext.iter().enumerate() {
            out[2 + i] = b ^ self.secret[i % 32];
        }
        Ok(out)
    }

    fn decrypt(&self, _context: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() != MODULUS_BYTES {
            return Err(StoreError::DecryptFailed);
        }
        let len = ((ciphertext[0] as usize) << 8) | ciphertext[1] as usize;
        if len > MAX_PLAINTEXT {
            return Err(StoreError::DecryptFailed);
        }
        Ok(ciphertext[2..2 + len]
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ self.secret[i % 32])
            .collect())
    }

    fn sign(&self, _context: &[u8], digest: &[u8; 32]) -> Result<Vec<u8>> {
        let mut sig = vec![0u8; MODULUS_BYTES];
        sig[..32].copy_from_slice(&self.mac(digest));
        Ok(sig)
    }

    fn verify(&self, context: &[u8], digest: &[u8; 32], signature: &[u8]) -> bool {
        self.sign(context, digest)
            .map(|s| s == signature)
            .unwrap_or(false)
    }
}

/// One master key per key family, labeled for test output.
pub fn key_families() -> Vec<(&'static str, MasterKey)> {
    vec![
        ("aes", MasterKey::create_for_test(Algorithm::Aes256).unwrap()),
        (
            "chacha",
            MasterKey::create_for_test(Algorithm::ChaCha20Poly1305).unwrap(),
        ),
        ("tpm", tpm_master_key()),
    ]
}

pub fn tpm_master_key() -> MasterKey {
    let options = KeyOptions {
        strict_wipe: false,
        tpm: Some(Arc::new(FakeTpm::new())),
    };
    MasterKey::create(Algorithm::Aes256Tpm, &options).unwrap()
}

pub fn new_store(dir: &std::path::Path, key: MasterKey) -> Store {
    Store::new(dir, Some(key)).unwrap()
}
