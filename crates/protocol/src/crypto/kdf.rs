//! HKDF-SHA512 key derivation.
//!
//! Every key in the protocol is derived from a handshake secret with a
//! distinct `(salt, info)` pair. The labels below are the complete set; a
//! key used for the handshake is never derived with a streaming label.

use hkdf::Hkdf;
use sha2::Sha512;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{ProtocolError, Result};

/// Length of a symmetric ChaCha20-Poly1305 key.
pub const KEY_LENGTH: usize = 32;

/// A `(salt, info)` pair naming one derived key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfLabel {
    /// HKDF salt.
    pub salt: &'static [u8],
    /// HKDF info.
    pub info: &'static [u8],
}

/// Encrypts the sub-TLVs of pair-setup M3/M4.
pub const PAIR_SETUP_ENCRYPT: KdfLabel = KdfLabel {
    salt: b"Pair-Setup-Encrypt-Salt",
    info: b"Pair-Setup-Encrypt-Info",
};

/// Binds the device's signature in pair-setup M3 to the SRP session.
pub const PAIR_SETUP_CONTROLLER_SIGN: KdfLabel = KdfLabel {
    salt: b"Pair-Setup-Controller-Sign-Salt",
    info: b"Pair-Setup-Controller-Sign-Info",
};

/// Binds the receiver's signature in pair-setup M4 to the SRP session.
pub const PAIR_SETUP_ACCESSORY_SIGN: KdfLabel = KdfLabel {
    salt: b"Pair-Setup-Accessory-Sign-Salt",
    info: b"Pair-Setup-Accessory-Sign-Info",
};

/// Encrypts the sub-TLVs of pair-verify M2/M3.
pub const PAIR_VERIFY_ENCRYPT: KdfLabel = KdfLabel {
    salt: b"Pair-Verify-Encrypt-Salt",
    info: b"Pair-Verify-Encrypt-Info",
};

/// Stream key material: 32-byte key followed by a 4-byte nonce prefix.
pub const MIRROR_STREAM: KdfLabel = KdfLabel {
    salt: b"Mirror-Stream-Salt",
    info: b"Mirror-Stream-Key",
};

/// A 32-byte symmetric key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LENGTH]);

impl SessionKey {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

/// Expands `ikm` into `length` bytes of key material.
pub fn hkdf(ikm: &[u8], salt: &[u8], info: &[u8], length: usize) -> Result<Zeroizing<Vec<u8>>> {
    let hk = Hkdf::<Sha512>::new(Some(salt), ikm);
    let mut output = Zeroizing::new(vec![0u8; length]);
    hk.expand(info, &mut output).map_err(|_| {
        ProtocolError::KeyDerivation(format!("cannot expand {} bytes", length))
    })?;
    Ok(output)
}

/// Derives a 32-byte key for `label`.
pub fn derive_key(ikm: &[u8], label: KdfLabel) -> Result<SessionKey> {
    let material = hkdf(ikm, label.salt, label.info, KEY_LENGTH)?;
    let mut key = [0u8; KEY_LENGTH];
    key.copy_from_slice(&material);
    Ok(SessionKey(key))
}
