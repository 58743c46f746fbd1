//! Error types for the protocol crate.

use thiserror::Error;

use crate::stream::StreamError;
use crate::tlv::TlvType;

/// Protocol error type covering pairing, verification and stream failures.
///
/// The variants fall into the categories a session cares about:
/// authentication failures (wrong PIN, bad proof, bad signature), handshake
/// failures (malformed or out-of-sequence messages), and cryptographic
/// failures of the encrypted stream. None of them are retried inside a
/// session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Encoding errors
    /// A TLV8 payload could not be parsed.
    #[error("malformed tlv: {0}")]
    MalformedTlv(String),

    /// A required TLV8 item is absent from a message.
    #[error("missing tlv item: {0:?}")]
    MissingTlvItem(TlvType),

    // Pairing errors
    /// The peer failed to prove knowledge of the pairing secret, or a
    /// signature over the handshake transcript did not verify.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A handshake message was malformed or arrived in the wrong state.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// The peer presented an identifier that has never been paired.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// AEAD open failed: the tag did not verify.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Signature verification failed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// HKDF expansion failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    // Stream errors
    /// The encrypted stream was rejected.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    // Storage errors
    /// The pairing store could not persist a device.
    #[error("pairing store error: {0}")]
    Store(String),
}

impl ProtocolError {
    /// Returns true for failures caused by a wrong secret or forged
    /// credentials rather than a malformed exchange.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            ProtocolError::Authentication(_)
                | ProtocolError::InvalidSignature(_)
                | ProtocolError::UnknownDevice(_)
                | ProtocolError::Decryption(_)
        )
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<ed25519_dalek::SignatureError> for ProtocolError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        ProtocolError::InvalidSignature(err.to_string())
    }
}

impl From<srp::types::SrpAuthError> for ProtocolError {
    fn from(err: srp::types::SrpAuthError) -> Self {
        ProtocolError::Authentication(err.to_string())
    }
}
