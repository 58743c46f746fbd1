//! Long-term Ed25519 identities.
//!
//! Both ends of a pairing own a long-term signing key. The receiver keeps
//! its secret half in a [`LongTermIdentity`]; devices that have completed
//! pair-setup are remembered by their public half, a [`PeerKey`].

use ed25519_dalek::{
    Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH,
    SECRET_KEY_LENGTH, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};

/// Length of a receiver id in bytes (SHA-256 output truncated to 6 bytes).
pub const RECEIVER_ID_LENGTH: usize = 6;

/// A 64-byte Ed25519 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; SIGNATURE_LENGTH]);

impl Signature {
    /// Creates a signature from raw bytes.
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parses a signature from a TLV value.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; SIGNATURE_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidSignature(format!(
                "expected {} bytes, got {}",
                SIGNATURE_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Returns the raw bytes of this signature.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    fn as_ed25519(&self) -> Ed25519Signature {
        Ed25519Signature::from_bytes(&self.0)
    }
}

/// The receiver's own long-term identity, including the secret key.
///
/// The signing key is zeroized when dropped.
#[derive(Clone)]
pub struct LongTermIdentity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    identifier: String,
}

impl LongTermIdentity {
    /// Generates a new random identity using the OS RNG.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Restores an identity from raw secret key bytes.
    pub fn from_secret_key_bytes(bytes: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let identifier = identifier_for(&verifying_key);
        Self {
            signing_key,
            verifying_key,
            identifier,
        }
    }

    /// Returns the secret key bytes, for persisting the identity.
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Returns the public key bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Returns the identifier sent in pairing messages, e.g. `3A:91:0C:5E:77:D2`.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Returns the public half of this identity.
    pub fn peer_key(&self) -> PeerKey {
        PeerKey(self.verifying_key)
    }

    /// Signs a message with the long-term secret key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }
}

impl std::fmt::Debug for LongTermIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongTermIdentity")
            .field("identifier", &self.identifier)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// The public long-term key of a paired peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerKey(VerifyingKey);

impl PeerKey {
    /// Parses a peer key from raw bytes.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Self> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))
    }

    /// Parses a peer key from a TLV value of unchecked length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Self::from_bytes(&arr)
    }

    /// Returns the public key bytes.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.0.to_bytes()
    }

    /// Verifies a signature made by the owner of this key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.0
            .verify(message, &signature.as_ed25519())
            .map_err(ProtocolError::from)
    }

    /// Returns a colon-separated identifier derived from this key.
    pub fn identifier(&self) -> String {
        identifier_for(&self.0)
    }
}

/// Formats the receiver id the way devices expect to see it: upper-case hex
/// pairs joined by colons, in the style of a MAC address.
fn identifier_for(key: &VerifyingKey) -> String {
    let hash = Sha256::digest(key.as_bytes());
    hash[..RECEIVER_ID_LENGTH]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identities_differ() {
        let a = LongTermIdentity::generate();
        let b = LongTermIdentity::generate();

        assert_ne!(a.public_key_bytes(), b.public_key_bytes());
        assert_ne!(a.identifier(), b.identifier());
    }

    #[test]
    fn test_restore_from_secret_bytes() {
        let original = LongTermIdentity::generate();
        let restored = LongTermIdentity::from_secret_key_bytes(&original.secret_key_bytes());

        assert_eq!(original.public_key_bytes(), restored.public_key_bytes());
        assert_eq!(original.identifier(), restored.identifier());
    }

    #[test]
    fn test_identifier_format() {
        let identity = LongTermIdentity::generate();
        let id = identity.identifier();

        // 6 groups of 2 upper-case hex chars
        assert_eq!(id.len(), 17);
        assert_eq!(id.matches(':').count(), 5);
        assert!(id
            .chars()
            .all(|c| c == ':' || c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_eq!(identity.peer_key().identifier(), id);
    }

    #[test]
    fn test_sign_and_verify_with_peer_key() {
        let identity = LongTermIdentity::generate();
        let peer = identity.peer_key();
        let signature = identity.sign(b"transcript");

        assert!(peer.verify(b"transcript", &signature).is_ok());
        assert!(peer.verify(b"tampered", &signature).is_err());
    }

    #[test]
    fn test_signature_from_wrong_key_fails() {
        let signer = LongTermIdentity::generate();
        let other = LongTermIdentity::generate();
        let signature = signer.sign(b"message");

        assert!(other.peer_key().verify(b"message", &signature).is_err());
    }

    #[test]
    fn test_corrupted_signature_fails() {
        let identity = LongTermIdentity::generate();
        let mut bytes = *identity.sign(b"message").as_bytes();
        bytes[10] ^= 0x01;

        let result = identity
            .peer_key()
            .verify(b"message", &Signature::from_bytes(bytes));
        assert!(matches!(result, Err(ProtocolError::InvalidSignature(_))));
    }

    #[test]
    fn test_from_slice_rejects_wrong_lengths() {
        assert!(matches!(
            PeerKey::from_slice(&[0u8; 31]),
            Err(ProtocolError::InvalidPublicKey(_))
        ));
        assert!(matches!(
            Signature::from_slice(&[0u8; 63]),
            Err(ProtocolError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let identity = LongTermIdentity::generate();
        let debug = format!("{:?}", identity);
        assert!(debug.contains("REDACTED"));
        assert!(debug.contains(identity.identifier()));
    }
}
