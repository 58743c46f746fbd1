//! Cryptographic primitives behind a narrow interface.
//!
//! Nothing here knows about pairing states or endpoints:
//!
//! - [`srp`]: SRP-6a server and client steps for pair-setup
//! - [`ecdh`]: X25519 key agreement for pair-verify
//! - [`identity`]: Ed25519 long-term identities, signing and verification
//! - [`kdf`]: HKDF-SHA512 and the labels every derived key uses
//! - [`aead`]: ChaCha20-Poly1305 seal/open
//!
//! All secret material is zeroized on drop and redacted from `Debug`.

pub mod aead;
pub mod ecdh;
pub mod identity;
pub mod kdf;
pub mod srp;

pub use aead::{aead_open, aead_seal, counter_nonce, label_nonce, NONCE_LENGTH, TAG_LENGTH};
pub use ecdh::{ecdh_agree, EphemeralKeyPair, SharedSecret, X25519_PUBLIC_KEY_LENGTH};
pub use identity::{LongTermIdentity, PeerKey, Signature};
pub use kdf::{derive_key, hkdf, KdfLabel, SessionKey, KEY_LENGTH};
pub use srp::{
    PasswordVerifier, SrpClientProof, SrpClientSession, SrpOutcome, SrpProofMaterial,
    SrpServerSession,
};
