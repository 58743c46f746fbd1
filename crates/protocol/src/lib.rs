//! # Mirrorwall Protocol Library
//!
//! Pairing, verification and stream encryption for the Mirrorwall
//! screen-mirroring receiver.
//!
//! ## Overview
//!
//! The protocol crate holds everything a receiver needs to decide whether a
//! device may mirror, and to turn its encrypted byte stream back into
//! compressed video payloads:
//!
//! - **TLV8 Codec**: The item encoding used by the pairing endpoints
//! - **Pairing State Machine**: SRP pair-setup, X25519/Ed25519 pair-verify
//! - **Stream Decryption**: Counter-ordered ChaCha20-Poly1305 frames
//! - **Cryptographic Primitives**: SRP-6a, X25519, Ed25519, HKDF, AEAD
//!
//! It performs no I/O and does no logging; the receiver crate owns both.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Compressed video payloads        │  handed to the decoder
//! ├─────────────────────────────────────────┤
//! │        Stream decryption (stream)       │  ChaCha20-Poly1305, counters
//! ├─────────────────────────────────────────┤
//! │     Pairing state machine (pairing)     │  SRP, X25519, Ed25519
//! ├─────────────────────────────────────────┤
//! │            TLV8 codec (tlv)             │  pair-setup / pair-verify bodies
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use protocol::{
//!     DecryptOutcome, LongTermIdentity, MemoryPairingStore, PairingClient, PairingMachine,
//!     PairingState, PasswordVerifier, StreamDecryptor,
//! };
//!
//! let mut receiver = PairingMachine::new(
//!     Arc::new(LongTermIdentity::generate()),
//!     Arc::new(PasswordVerifier::new(b"3939")),
//!     Arc::new(MemoryPairingStore::new()),
//! );
//! let mut device = PairingClient::new(LongTermIdentity::generate(), "living-room-tablet");
//!
//! let m2 = receiver.handle_pair_setup(&device.setup_m1()).unwrap();
//! let m4 = receiver.handle_pair_setup(&device.setup_m3(b"3939", &m2).unwrap()).unwrap();
//! device.setup_finish(&m4).unwrap();
//!
//! let m2 = receiver.handle_pair_verify(&device.verify_m1()).unwrap();
//! let m4 = receiver.handle_pair_verify(&device.verify_m3(&m2).unwrap()).unwrap();
//! device.verify_finish(&m4).unwrap();
//! assert_eq!(receiver.state(), PairingState::Verified);
//!
//! let mut decryptor = StreamDecryptor::new(receiver.start_streaming().unwrap());
//! let mut encryptor = device.stream_encryptor().unwrap();
//! let frame = encryptor.seal_frame(b"compressed frame").unwrap();
//!
//! match decryptor.decrypt_next(&frame).unwrap() {
//!     DecryptOutcome::Frame(chunk) => assert_eq!(chunk.payload, b"compressed frame"),
//!     DecryptOutcome::NeedMoreData => unreachable!(),
//! }
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: SRP, key agreement, identities, key derivation and AEAD
//! - [`tlv`]: TLV8 encoding
//! - [`pairing`]: Pairing state machine, pairing store seam, device-side client
//! - [`stream`]: Encrypted frame layout and decryption
//! - [`error`]: Error types

pub mod crypto;
pub mod error;
pub mod pairing;
pub mod stream;
pub mod tlv;

pub use crypto::{LongTermIdentity, PasswordVerifier, PeerKey, SharedSecret, Signature};
pub use error::{ProtocolError, Result};
pub use pairing::{
    MemoryPairingStore, PairingClient, PairingMachine, PairingState, PairingStore,
    MAX_IDENTIFIER_LENGTH, METHOD_PAIR_SETUP,
};
pub use stream::{
    DecryptOutcome, DecryptedChunk, StreamDecryptor, StreamEncryptor, StreamError, StreamKeys,
    FRAME_HEADER_SIZE, MAX_STREAM_FRAME_SIZE,
};
pub use tlv::{Tlv8, TlvErrorCode, TlvType};
