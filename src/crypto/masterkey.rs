//! Master-key file format.
//!
//! A master key is persisted sealed under a passphrase-derived key:
//!
//! ```text
//! offset 0: version          (1 byte; 1=AES, 2=ChaCha, 3=AES wrapped by TPM)
//! offset 1: salt             (16 bytes)
//! offset 17: cost            (u32 big-endian; PBKDF2 iterations or Argon2
//!                             time cost)
//! then:     AEAD nonce       (12 bytes for AES-GCM, 24 for XChaCha)
//! then:     sealed key material
//! ```
//!
//! Version 3 seals `u16 len || tpm-wrapped key || u16 len || tpm context`
//! instead of the raw key material; the context blob re-binds the same TPM
//! key pair on load.
//!
//! An empty passphrase drops the KDF cost to its floor. That mode is
//! deliberate (keys already protected by the platform) but such files offer
//! no brute-force resistance, which is why it is logged loudly.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{Result, StoreError};

use super::aes::AesKey;
use super::chacha::ChaChaKey;
use super::material::{KeyMaterial, KEY_MATERIAL_SIZE};
use super::tpm::TpmKey;
use super::{EncryptionKey, KeyOptions};

const SALT_SIZE: usize = 16;
const GCM_NONCE_SIZE: usize = 12;
const XCHACHA_NONCE_SIZE: usize = 24;

const PBKDF2_ITERATIONS: u32 = 200_000;
const PBKDF2_ITERATIONS_EMPTY: u32 = 10;

const ARGON2_TIME: u32 = 1;
const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
const ARGON2_MEMORY_KIB_EMPTY: u32 = 8;
const ARGON2_LANES: u32 = 4;
const ARGON2_LANES_EMPTY: u32 = 1;

fn pbkdf2_kek(passphrase: &[u8], salt: &[u8], iterations: u32) -> Zeroizing<[u8; 32]> {
    let mut kek = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase, salt, iterations, &mut *kek);
    kek
}

fn argon2_kek(passphrase: &[u8], salt: &[u8], time: u32) -> Result<Zeroizing<[u8; 32]>> {
    let (memory, lanes) = if passphrase.is_empty() {
        (ARGON2_MEMORY_KIB_EMPTY, ARGON2_LANES_EMPTY)
    } else {
        (ARGON2_MEMORY_KIB, ARGON2_LANES)
    };
    let params = argon2::Params::new(memory, time, lanes, Some(32)).map_err(|e| {
        log::debug!("argon2 params: {e}");
        StoreError::DecryptFailed
    })?;
    let argon = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    let mut kek = Zeroizing::new([0u8; 32]);
    argon
        .hash_password_into(passphrase, salt, &mut *kek)
        .map_err(|e| {
            log::debug!("argon2: {e}");
            StoreError::DecryptFailed
        })?;
    Ok(kek)
}

fn warn_if_empty(passphrase: &[u8]) {
    if passphrase.is_empty() {
        log::warn!(
            "master key file uses an empty passphrase; it offers no brute-force resistance"
        );
    }
}

// =============================================================================
// Save
// =============================================================================

pub(super) fn save(key: &EncryptionKey, passphrase: &[u8], path: &Path) -> Result<()> {
    warn_if_empty(passphrase);
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);

    let data = match key {
        EncryptionKey::Aes(k) => {
            let payload = Zeroizing::new(k.material.unmasked().to_vec());
            seal_gcm(1, passphrase, &salt, &payload)?
        }
        EncryptionKey::ChaCha(k) => {
            let payload = Zeroizing::new(k.material.unmasked().to_vec());
            seal_xchacha(passphrase, &salt, &payload)?
        }
        EncryptionKey::Tpm(k) => {
            let raw = k.material.unmasked();
            let wrapped = k.device.encrypt(&k.context, &*raw).map_err(|e| {
                log::debug!("TPM wrap of master key: {e}");
                StoreError::EncryptFailed
            })?;
            let mut payload = Vec::with_capacity(4 + wrapped.len() + k.context.len());
            payload.extend_from_slice(&(wrapped.len() as u16).to_be_bytes());
            payload.extend_from_slice(&wrapped);
            payload.extend_from_slice(&(k.context.len() as u16).to_be_bytes());
            payload.extend_from_slice(&k.context);
            seal_gcm(3, passphrase, &salt, &payload)?
        }
    };

    write_atomic(path, &data)
}

fn seal_gcm(version: u8, passphrase: &[u8], salt: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let iterations = if passphrase.is_empty() {
        PBKDF2_ITERATIONS_EMPTY
    } else {
        PBKDF2_ITERATIONS
    };
    let kek = pbkdf2_kek(passphrase, salt, iterations);
    let cipher = Aes256Gcm::new_from_slice(&*kek).expect("KEK is 32 bytes");
    let mut nonce = [0u8; GCM_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(aes_gcm::Nonce::from_slice(&nonce), payload)
        .map_err(|_| StoreError::EncryptFailed)?;

    let mut out = Vec::with_capacity(1 + SALT_SIZE + 4 + GCM_NONCE_SIZE + sealed.len());
    out.push(version);
    out.extend_from_slice(salt);
    out.extend_from_slice(&iterations.to_be_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn seal_xchacha(passphrase: &[u8], salt: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let kek = argon2_kek(passphrase, salt, ARGON2_TIME).map_err(|_| StoreError::EncryptFailed)?;
    let cipher = XChaCha20Poly1305::new_from_slice(&*kek).expect("KEK is 32 bytes");
    let mut nonce = [0u8; XCHACHA_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), payload)
        .map_err(|_| StoreError::EncryptFailed)?;

    let mut out = Vec::with_capacity(1 + SALT_SIZE + 4 + XCHACHA_NONCE_SIZE + sealed.len());
    out.push(2);
    out.extend_from_slice(salt);
    out.extend_from_slice(&ARGON2_TIME.to_be_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(parent)
        .map_err(|e| StoreError::io("create key directory", e))?;

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_nanos();
    let file_name = path
        .file_name()
        .ok_or_else(|| StoreError::InvalidArgument("key path has no file name".to_string()))?;
    let tmp = parent.join(format!("{}.tmp-{nanos}", file_name.to_string_lossy()));

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&tmp)
        .map_err(|e| StoreError::io("create key file", e))?;
    f.write_all(data)
        .and_then(|()| f.sync_all())
        .map_err(|e| StoreError::io("write key file", e))?;
    drop(f);
    fs::rename(&tmp, path).map_err(|e| StoreError::io("rename key file", e))
}

// =============================================================================
// Read
// =============================================================================

pub(super) fn read(
    passphrase: &[u8],
    path: &Path,
    options: &KeyOptions,
) -> Result<EncryptionKey> {
    let data = fs::read(path).map_err(|e| StoreError::io("read key file", e))?;
    if data.is_empty() {
        return Err(StoreError::UnexpectedAlgo);
    }
    warn_if_empty(passphrase);
    match data[0] {
        1 | 3 => read_aes_family(passphrase, &data, options),
        2 => read_chacha(passphrase, &data, options),
        v => {
            log::debug!("master key file: unexpected version {v}");
            Err(StoreError::UnexpectedAlgo)
        }
    }
}

struct Envelope<'a> {
    version: u8,
    salt: &'a [u8],
    cost: u32,
    nonce: &'a [u8],
    sealed: &'a [u8],
}

fn parse_envelope(data: &[u8], nonce_size: usize) -> Result<Envelope<'_>> {
    let header = 1 + SALT_SIZE + 4 + nonce_size;
    if data.len() < header + 16 {
        return Err(StoreError::DecryptFailed);
    }
    let cost = u32::from_be_bytes(
        data[1 + SALT_SIZE..1 + SALT_SIZE + 4]
            .try_into()
            .expect("slice is 4 bytes"),
    );
    Ok(Envelope {
        version: data[0],
        salt: &data[1..1 + SALT_SIZE],
        cost,
        nonce: &data[1 + SALT_SIZE + 4..header],
        sealed: &data[header..],
    })
}

fn read_aes_family(
    passphrase: &[u8],
    data: &[u8],
    options: &KeyOptions,
) -> Result<EncryptionKey> {
    let env = parse_envelope(data, GCM_NONCE_SIZE)?;
    if env.version == 3 && options.tpm.is_none() {
        log::debug!("master key file is TPM-bound but no device was provided");
        return Err(StoreError::DecryptFailed);
    }
    let kek = pbkdf2_kek(passphrase, env.salt, env.cost);
    let cipher = Aes256Gcm::new_from_slice(&*kek).expect("KEK is 32 bytes");
    let payload = Zeroizing::new(
        cipher
            .decrypt(aes_gcm::Nonce::from_slice(env.nonce), env.sealed)
            .map_err(|_| {
                log::debug!("master key file failed authentication");
                StoreError::DecryptFailed
            })?,
    );

    if env.version == 1 {
        let mut bytes: [u8; KEY_MATERIAL_SIZE] = payload
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::DecryptFailed)?;
        return Ok(EncryptionKey::Aes(AesKey {
            material: KeyMaterial::from_bytes(&mut bytes, options.strict_wipe),
            wrapped: None,
        }));
    }

    // Version 3: the payload holds the TPM-wrapped key and the context blob.
    let device = options.tpm.clone().expect("checked above");
    let (wrapped, rest) = read_u16_prefixed(&payload)?;
    let (context, rest) = read_u16_prefixed(rest)?;
    if !rest.is_empty() {
        return Err(StoreError::DecryptFailed);
    }
    let raw = Zeroizing::new(device.decrypt(context, wrapped).map_err(|e| {
        log::debug!("TPM unwrap of master key: {e}");
        StoreError::DecryptFailed
    })?);
    let mut bytes: [u8; KEY_MATERIAL_SIZE] = raw
        .as_slice()
        .try_into()
        .map_err(|_| StoreError::DecryptFailed)?;
    Ok(EncryptionKey::Tpm(TpmKey {
        material: KeyMaterial::from_bytes(&mut bytes, options.strict_wipe),
        device,
        context: context.to_vec(),
    }))
}

fn read_chacha(passphrase: &[u8], data: &[u8], options: &KeyOptions) -> Result<EncryptionKey> {
    let env = parse_envelope(data, XCHACHA_NONCE_SIZE)?;
    let kek = argon2_kek(passphrase, env.salt, env.cost)?;
    let cipher = XChaCha20Poly1305::new_from_slice(&*kek).expect("KEK is 32 bytes");
    let payload = Zeroizing::new(
        cipher
            .decrypt(XNonce::from_slice(env.nonce), env.sealed)
            .map_err(|_| {
                log::debug!("master key file failed authentication");
                StoreError::DecryptFailed
            })?,
    );
    let mut bytes: [u8; KEY_MATERIAL_SIZE] = payload
        .as_slice()
        .try_into()
        .map_err(|_| StoreError::DecryptFailed)?;
    Ok(EncryptionKey::ChaCha(ChaChaKey {
        material: KeyMaterial::from_bytes(&mut bytes, options.strict_wipe),
        wrapped: None,
    }))
}

fn read_u16_prefixed(data: &[u8]) -> Result<(&[u8], &[u8])> {
    if data.len() < 2 {
        return Err(StoreError::DecryptFailed);
    }
    let len = usize::from(u16::from_be_bytes([data[0], data[1]]));
    if data.len() < 2 + len {
        return Err(StoreError::DecryptFailed);
    }
    Ok((&data[2..2 + len], &data[2 + len..]))
}
