//! Raw key material, held masked in memory.
//!
//! A key is 64 bytes: the first 32 are the cipher key, the last 32 are the
//! MAC half (AES variant) or auxiliary keyed-hash material (ChaCha variant).
//! The bytes never sit in memory in the clear: they are XOR-masked with a
//! fresh random mask that lives alongside them, and every access produces a
//! short-lived unmasked copy that is zeroized on drop.
//!
//! Keys must be wiped explicitly with [`KeyMaterial::wipe`] when they are no
//! longer needed. A drop-time check replaces the original finalizer: an
//! unwiped key is reported at error level together with the backtrace of its
//! creation site, and under strict-wipe mode the failure is fatal.

use std::backtrace::Backtrace;

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

/// Size of the raw key material in bytes.
pub(crate) const KEY_MATERIAL_SIZE: usize = 64;

/// Masked key bytes plus their mask.
pub(crate) struct KeyMaterial {
    masked: [u8; KEY_MATERIAL_SIZE],
    mask: [u8; KEY_MATERIAL_SIZE],
    wiped: bool,
    strict_wipe: bool,
    /// When false, the drop-time wipe check is skipped entirely (test keys).
    armed: bool,
    origin: Backtrace,
}

impl KeyMaterial {
    /// Creates fresh random key material.
    pub(crate) fn random(strict_wipe: bool) -> Self {
        let mut bytes = [0u8; KEY_MATERIAL_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(&mut bytes, strict_wipe)
    }

    /// Takes ownership of raw key bytes, zeroing the source.
    pub(crate) fn from_bytes(bytes: &mut [u8; KEY_MATERIAL_SIZE], strict_wipe: bool) -> Self {
        let mut mask = [0u8; KEY_MATERIAL_SIZE];
        OsRng.fill_bytes(&mut mask);
        let mut masked = [0u8; KEY_MATERIAL_SIZE];
        for i in 0..KEY_MATERIAL_SIZE {
            masked[i] = bytes[i] ^ mask[i];
        }
        bytes.zeroize();
        Self {
            masked,
            mask,
            wiped: false,
            strict_wipe,
            armed: true,
            origin: Backtrace::capture(),
        }
    }

    /// Disarms the drop-time wipe check. Test keys only.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }

    /// Returns a transient unmasked copy of the key bytes.
    ///
    /// The copy is zeroized when dropped; callers must not let it outlive the
    /// operation it was produced for.
    pub(crate) fn unmasked(&self) -> Zeroizing<[u8; KEY_MATERIAL_SIZE]> {
        let mut out = Zeroizing::new([0u8; KEY_MATERIAL_SIZE]);
        for i in 0..KEY_MATERIAL_SIZE {
            out[i] = self.masked[i] ^ self.mask[i];
        }
        out
    }

    /// Zeros the key material and disarms the drop-time check.
    pub(crate) fn wipe(&mut self) {
        self.masked.zeroize();
        self.mask.zeroize();
        self.wiped = true;
    }

    pub(crate) fn is_wiped(&self) -> bool {
        self.wiped
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        if self.armed && !self.wiped {
            log::error!(
                "WIPEME: key material reclaimed without wipe; created at:\n{}",
                self.origin
            );
            if self.strict_wipe && !std::thread::panicking() {
                panic!("strict wipe: key material reclaimed without wipe");
            }
        }
        self.masked.zeroize();
        self.mask.zeroize();
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"[REDACTED]")
            .field("wiped", &self.wiped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masking_round_trip() {
        let mut bytes = [0u8; KEY_MATERIAL_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let original = bytes;
        let mut material = KeyMaterial::from_bytes(&mut bytes, false);
        material.disarm();

        // The source buffer is consumed.
        assert_eq!(bytes, [0u8; KEY_MATERIAL_SIZE]);
        // The stored form never equals the plaintext.
        assert_ne!(material.masked, original);
        assert_eq!(*material.unmasked(), original);
        material.wipe();
    }

    #[test]
    fn test_wipe_zeroes_everything() {
        let mut material = KeyMaterial::random(false);
        material.wipe();
        assert!(material.is_wiped());
        assert_eq!(material.masked, [0u8; KEY_MATERIAL_SIZE]);
        assert_eq!(material.mask, [0u8; KEY_MATERIAL_SIZE]);
        assert_eq!(*material.unmasked(), [0u8; KEY_MATERIAL_SIZE]);
    }

    #[test]
    fn test_random_keys_differ() {
        let mut a = KeyMaterial::random(false);
        let mut b = KeyMaterial::random(false);
        assert_ne!(*a.unmasked(), *b.unmasked());
        a.wipe();
        b.wipe();
    }

    #[test]
    fn test_debug_is_redacted() {
        let mut material = KeyMaterial::random(false);
        let debug = format!("{material:?}");
        assert!(debug.contains("REDACTED"));
        material.wipe();
    }
}
