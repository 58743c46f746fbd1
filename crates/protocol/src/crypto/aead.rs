//! ChaCha20-Poly1305 sealing and opening.
//!
//! Ciphertexts carry their 16-byte Poly1305 tag appended. Nonces come in
//! two shapes:
//!
//! ```text
//! handshake:  0x00000000 || label (8 bytes, e.g. "PV-Msg02")
//! stream:     prefix (4 bytes, from HKDF) || counter (8 bytes LE)
//! ```

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::crypto::kdf::SessionKey;
use crate::error::{ProtocolError, Result};

/// Poly1305 tag length.
pub const TAG_LENGTH: usize = 16;

/// ChaCha20-Poly1305 nonce length.
pub const NONCE_LENGTH: usize = 12;

/// Builds a handshake nonce from an 8-byte message label.
pub fn label_nonce(label: &[u8; 8]) -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    nonce[4..].copy_from_slice(label);
    nonce
}

/// Builds a stream nonce from the per-session prefix and a frame counter.
pub fn counter_nonce(prefix: &[u8; 4], counter: u64) -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    nonce[..4].copy_from_slice(prefix);
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypts `plaintext`, returning ciphertext with the tag appended.
pub fn aead_seal(
    key: &SessionKey,
    nonce: &[u8; NONCE_LENGTH],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| ProtocolError::Encryption("chacha20-poly1305 seal failed".to_string()))
}

/// Verifies the tag and decrypts. No plaintext is returned unless the tag
/// verifies.
pub fn aead_open(
    key: &SessionKey,
    nonce: &[u8; NONCE_LENGTH],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_LENGTH {
        return Err(ProtocolError::Decryption(format!(
            "ciphertext of {} bytes is shorter than the tag",
            ciphertext.len()
        )));
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| ProtocolError::Decryption("authentication tag mismatch".to_string()))
}
