//! X25519 key agreement for pair-verify.

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtocolError, Result};

/// Length of an X25519 public key.
pub const X25519_PUBLIC_KEY_LENGTH: usize = 32;

/// A single-use X25519 key pair.
///
/// [`EphemeralKeyPair::agree`] consumes the pair so the secret can never be
/// used for a second exchange.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generates a fresh key pair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Returns the public key bytes.
    pub fn public_key_bytes(&self) -> [u8; X25519_PUBLIC_KEY_LENGTH] {
        self.public.to_bytes()
    }

    /// Performs the exchange with the peer's public key.
    pub fn agree(self, remote_public: &[u8]) -> Result<SharedSecret> {
        ecdh_agree(self, remote_public)
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &self.public.as_bytes())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Output of an X25519 exchange. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Wraps raw secret bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the secret bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// Agrees on a shared secret with the remote public key.
///
/// Rejects low-order remote points, which would force an all-zero secret.
pub fn ecdh_agree(local: EphemeralKeyPair, remote_public: &[u8]) -> Result<SharedSecret> {
    let remote: [u8; X25519_PUBLIC_KEY_LENGTH] = remote_public.try_into().map_err(|_| {
        ProtocolError::InvalidPublicKey(format!(
            "x25519 key must be {} bytes, got {}",
            X25519_PUBLIC_KEY_LENGTH,
            remote_public.len()
        ))
    })?;

    let shared = local.secret.diffie_hellman(&PublicKey::from(remote));
    if !shared.was_contributory() {
        return Err(ProtocolError::InvalidPublicKey(
            "non-contributory x25519 point".to_string(),
        ));
    }
    Ok(SharedSecret(shared.to_bytes()))
}
