//! Pairing and verification state machine.
//!
//! One [`PairingMachine`] drives the handshake of one connection:
//!
//! ```text
//!                 pair-setup M1        pair-setup M3
//! AWAITING_SETUP ──────────────► SETUP_IN_PROGRESS ──────────────► AWAITING_VERIFY
//!       │                                                               │
//!       │ pair-verify M1 with a stored identifier (fast path)           │ pair-verify M1, M3
//!       └──────────────────────────────────────────────────────────────►│
//!                                                                       ▼
//!                          CLOSED ◄── STREAMING ◄──── stream start ── VERIFIED
//!
//! Any rejected message, from any non-terminal state ──► FAILED
//! ```
//!
//! A failed machine stays failed: the device has to open a new connection
//! and start over. Stream keys are derived only on the `VERIFIED ->
//! STREAMING` edge, from the pair-verify shared secret under a label no
//! handshake key uses.

pub mod client;
pub mod store;

use std::fmt;
use std::sync::Arc;

use crate::crypto::aead::{aead_open, aead_seal, label_nonce};
use crate::crypto::kdf::{
    derive_key, hkdf, KdfLabel, SessionKey, PAIR_SETUP_ACCESSORY_SIGN, PAIR_SETUP_CONTROLLER_SIGN,
    PAIR_SETUP_ENCRYPT, PAIR_VERIFY_ENCRYPT,
};
use crate::crypto::{
    EphemeralKeyPair, LongTermIdentity, PasswordVerifier, PeerKey, SharedSecret, Signature,
    SrpServerSession, X25519_PUBLIC_KEY_LENGTH,
};
use crate::error::{ProtocolError, Result};
use crate::stream::StreamKeys;
use crate::tlv::{Tlv8, TlvErrorCode, TlvType};

pub use client::PairingClient;
pub use store::{MemoryPairingStore, PairingStore};

/// `Method` value requesting pair-setup.
pub const METHOD_PAIR_SETUP: u8 = 0;

/// Longest identifier accepted from a device.
pub const MAX_IDENTIFIER_LENGTH: usize = 64;

/// Length of the signing salt mixed into pair-setup signatures.
const SIGN_SALT_LENGTH: usize = 32;

/// Connection state of one pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairingState {
    /// Fresh connection; expecting pair-setup M1 or a fast-path pair-verify M1.
    AwaitingSetup,
    /// SRP exchange started; expecting pair-setup M3.
    SetupInProgress,
    /// Device identity known; expecting pair-verify.
    AwaitingVerify,
    /// Both sides proved their long-term identity.
    Verified,
    /// Stream keys derived; encrypted frames are flowing.
    Streaming,
    /// Torn down cleanly.
    Closed,
    /// A message was rejected. Terminal.
    Failed,
}

impl PairingState {
    /// Returns true for states no message can leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, PairingState::Closed | PairingState::Failed)
    }

    /// Returns a stable lower-case name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            PairingState::AwaitingSetup => "awaiting_setup",
            PairingState::SetupInProgress => "setup_in_progress",
            PairingState::AwaitingVerify => "awaiting_verify",
            PairingState::Verified => "verified",
            PairingState::Streaming => "streaming",
            PairingState::Closed => "closed",
            PairingState::Failed => "failed",
        }
    }
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pair-verify material held between M1 and M3.
struct VerifyExchange {
    receiver_public: [u8; X25519_PUBLIC_KEY_LENGTH],
    device_public: [u8; X25519_PUBLIC_KEY_LENGTH],
    shared: SharedSecret,
    encrypt_key: SessionKey,
}

/// Receiver side of the pairing handshake for one connection.
pub struct PairingMachine {
    state: PairingState,
    identity: Arc<LongTermIdentity>,
    verifier: Arc<PasswordVerifier>,
    store: Arc<dyn PairingStore>,
    setup: Option<SrpServerSession>,
    verify: Option<VerifyExchange>,
    shared_secret: Option<SharedSecret>,
    peer_identifier: Option<String>,
    fast_path: bool,
    failure: Option<String>,
}

impl PairingMachine {
    /// Creates a machine in `AWAITING_SETUP`.
    pub fn new(
        identity: Arc<LongTermIdentity>,
        verifier: Arc<PasswordVerifier>,
        store: Arc<dyn PairingStore>,
    ) -> Self {
        Self {
            state: PairingState::AwaitingSetup,
            identity,
            verifier,
            store,
            setup: None,
            verify: None,
            shared_secret: None,
            peer_identifier: None,
            fast_path: false,
            failure: None,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> PairingState {
        self.state
    }

    /// Returns the device identifier once pair-setup or the fast path
    /// established it.
    pub fn peer_identifier(&self) -> Option<&str> {
        self.peer_identifier.as_deref()
    }

    /// Returns true if this connection skipped pair-setup.
    pub fn used_fast_path(&self) -> bool {
        self.fast_path
    }

    /// Returns why the machine failed, if it did.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Handles a `/pair-setup` message (M1 or M3).
    pub fn handle_pair_setup(&mut self, request: &Tlv8) -> Result<Tlv8> {
        self.guarded(|m| match request.state()? {
            1 => m.setup_m1(request),
            3 => m.setup_m3(request),
            other => Err(ProtocolError::Handshake(format!(
                "unexpected pair-setup message M{}",
                other
            ))),
        })
    }

    /// Handles a `/pair-verify` message (M1 or M3).
    pub fn handle_pair_verify(&mut self, request: &Tlv8) -> Result<Tlv8> {
        self.guarded(|m| match request.state()? {
            1 => m.verify_m1(request),
            3 => m.verify_m3(request),
            other => Err(ProtocolError::Handshake(format!(
                "unexpected pair-verify message M{}",
                other
            ))),
        })
    }

    /// Moves `VERIFIED -> STREAMING` and derives the stream keys.
    pub fn start_streaming(&mut self) -> Result<StreamKeys> {
        self.guarded(|m| {
            m.expect_state(PairingState::Verified, "stream start")?;
            let shared = m.shared_secret.take().ok_or_else(|| {
                ProtocolError::Handshake("verified without a shared secret".to_string())
            })?;
            let keys = StreamKeys::derive(&shared)?;
            m.state = PairingState::Streaming;
            Ok(keys)
        })
    }

    /// Moves to `CLOSED` unless already terminal, discarding key material.
    pub fn close(&mut self) {
        if !self.state.is_terminal() {
            self.state = PairingState::Closed;
        }
        self.discard_secrets();
    }

    /// Moves to `FAILED`, discarding key material.
    pub fn fail(&mut self, reason: impl fmt::Display) {
        if self.state != PairingState::Failed {
            self.failure = Some(reason.to_string());
        }
        self.state = PairingState::Failed;
        self.discard_secrets();
    }

    /// Builds the reply sent when a message is rejected.
    ///
    /// The reply says only whether authentication failed, never why.
    pub fn error_reply(request: &Tlv8, error: &ProtocolError) -> Tlv8 {
        let reply_state = request.state().map(|s| s.saturating_add(1)).unwrap_or(2);
        let code = if error.is_authentication() {
            TlvErrorCode::Authentication
        } else {
            TlvErrorCode::Unknown
        };
        Tlv8::new()
            .with_state(reply_state)
            .with(TlvType::Error, vec![code as u8])
    }

    /// Runs `step`, failing the machine if it errors. Terminal machines
    /// reject every message.
    fn guarded<T>(&mut self, step: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.state.is_terminal() {
            return Err(ProtocolError::Handshake(format!(
                "connection is {}",
                self.state
            )));
        }
        step(self).inspect_err(|e| self.fail(e))
    }

    fn expect_state(&self, expected: PairingState, what: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ProtocolError::Handshake(format!(
                "{} not allowed in state {}",
                what, self.state
            )))
        }
    }

    fn discard_secrets(&mut self) {
        self.setup = None;
        self.verify = None;
        self.shared_secret = None;
    }

    fn setup_m1(&mut self, request: &Tlv8) -> Result<Tlv8> {
        self.expect_state(PairingState::AwaitingSetup, "pair-setup M1")?;
        if let Some(method) = request.get(TlvType::Method) {
            if method != [METHOD_PAIR_SETUP] {
                return Err(ProtocolError::Handshake(format!(
                    "unsupported pairing method {:?}",
                    method
                )));
            }
        }

        let session = SrpServerSession::new(&self.verifier);
        let reply = Tlv8::new()
            .with_state(2)
            .with(TlvType::Salt, session.salt().to_vec())
            .with(TlvType::PublicKey, session.server_public().to_vec());
        self.setup = Some(session);
        self.state = PairingState::SetupInProgress;
        Ok(reply)
    }

    fn setup_m3(&mut self, request: &Tlv8) -> Result<Tlv8> {
        self.expect_state(PairingState::SetupInProgress, "pair-setup M3")?;
        let session = self
            .setup
            .take()
            .ok_or_else(|| ProtocolError::Handshake("no SRP exchange in progress".to_string()))?;

        let client_public = request.require(TlvType::PublicKey)?;
        let client_proof = request.require(TlvType::Proof)?;
        let encrypted = request.require(TlvType::EncryptedData)?;

        let outcome = session
            .srp_server_step(client_public)?
            .verify_client_proof(client_proof)?;
        let setup_key = derive_key(&outcome.session_key, PAIR_SETUP_ENCRYPT)?;

        let sub = Tlv8::decode(&aead_open(
            &setup_key,
            &label_nonce(b"PS-Msg03"),
            encrypted,
            b"",
        )?)?;
        let identifier = parse_identifier(sub.require(TlvType::Identifier)?)?;
        let device_key = PeerKey::from_slice(sub.require(TlvType::PublicKey)?)?;
        let signature = Signature::from_slice(sub.require(TlvType::Signature)?)?;

        let signed = sign_input(
            &outcome.session_key,
            PAIR_SETUP_CONTROLLER_SIGN,
            &identifier,
            &device_key.to_bytes(),
        )?;
        device_key.verify(&signed, &signature)?;
        self.store.remember(&identifier, device_key)?;

        let receiver_ltpk = self.identity.public_key_bytes();
        let receiver_info = sign_input(
            &outcome.session_key,
            PAIR_SETUP_ACCESSORY_SIGN,
            self.identity.identifier(),
            &receiver_ltpk,
        )?;
        let receiver_sub = Tlv8::new()
            .with(TlvType::Identifier, self.identity.identifier().as_bytes().to_vec())
            .with(TlvType::PublicKey, receiver_ltpk.to_vec())
            .with(
                TlvType::Signature,
                self.identity.sign(&receiver_info).as_bytes().to_vec(),
            );
        let sealed = aead_seal(
            &setup_key,
            &label_nonce(b"PS-Msg04"),
            &receiver_sub.encode(),
            b"",
        )?;

        self.peer_identifier = Some(identifier);
        self.state = PairingState::AwaitingVerify;
        Ok(Tlv8::new()
            .with_state(4)
            .with(TlvType::Proof, outcome.server_proof)
            .with(TlvType::EncryptedData, sealed))
    }

    fn verify_m1(&mut self, request: &Tlv8) -> Result<Tlv8> {
        match self.state {
            PairingState::AwaitingSetup => {
                let identifier = request.get(TlvType::Identifier).ok_or_else(|| {
                    ProtocolError::Handshake(
                        "pair-verify before pair-setup without an identifier".to_string(),
                    )
                })?;
                let identifier = parse_identifier(identifier)?;
                if self.store.lookup(&identifier).is_none() {
                    return Err(ProtocolError::UnknownDevice(identifier));
                }
                self.peer_identifier = Some(identifier);
                self.fast_path = true;
                self.state = PairingState::AwaitingVerify;
            }
            PairingState::AwaitingVerify if self.verify.is_none() => {}
            _ => {
                return Err(ProtocolError::Handshake(format!(
                    "pair-verify M1 not allowed in state {}",
                    self.state
                )))
            }
        }

        let device_public: [u8; X25519_PUBLIC_KEY_LENGTH] = request
            .require(TlvType::PublicKey)?
            .try_into()
            .map_err(|_| {
                ProtocolError::InvalidPublicKey("pair-verify key must be 32 bytes".to_string())
            })?;

        let ephemeral = EphemeralKeyPair::generate();
        let receiver_public = ephemeral.public_key_bytes();
        let shared = ephemeral.agree(&device_public)?;
        let encrypt_key = derive_key(shared.as_bytes(), PAIR_VERIFY_ENCRYPT)?;

        let receiver_id = self.identity.identifier().as_bytes();
        let transcript = [&receiver_public[..], receiver_id, &device_public[..]].concat();
        let sub = Tlv8::new()
            .with(TlvType::Identifier, receiver_id.to_vec())
            .with(
                TlvType::Signature,
                self.identity.sign(&transcript).as_bytes().to_vec(),
            );
        let sealed = aead_seal(&encrypt_key, &label_nonce(b"PV-Msg02"), &sub.encode(), b"")?;

        self.verify = Some(VerifyExchange {
            receiver_public,
            device_public,
            shared,
            encrypt_key,
        });
        Ok(Tlv8::new()
            .with_state(2)
            .with(TlvType::PublicKey, receiver_public.to_vec())
            .with(TlvType::EncryptedData, sealed))
    }

    fn verify_m3(&mut self, request: &Tlv8) -> Result<Tlv8> {
        self.expect_state(PairingState::AwaitingVerify, "pair-verify M3")?;
        let exchange = self
            .verify
            .take()
            .ok_or_else(|| ProtocolError::Handshake("pair-verify M3 before M1".to_string()))?;

        let encrypted = request.require(TlvType::EncryptedData)?;
        let sub = Tlv8::decode(&aead_open(
            &exchange.encrypt_key,
            &label_nonce(b"PV-Msg03"),
            encrypted,
            b"",
        )?)?;
        let identifier = parse_identifier(sub.require(TlvType::Identifier)?)?;
        let signature = Signature::from_slice(sub.require(TlvType::Signature)?)?;

        if let Some(expected) = &self.peer_identifier {
            if *expected != identifier {
                return Err(ProtocolError::Authentication(
                    "pair-verify identifier differs from pairing".to_string(),
                ));
            }
        }
        let device_key = self
            .store
            .lookup(&identifier)
            .ok_or_else(|| ProtocolError::UnknownDevice(identifier.clone()))?;

        let transcript = [
            &exchange.device_public[..],
            identifier.as_bytes(),
            &exchange.receiver_public[..],
        ]
        .concat();
        device_key.verify(&transcript, &signature)?;

        self.peer_identifier = Some(identifier);
        self.shared_secret = Some(exchange.shared);
        self.state = PairingState::Verified;
        Ok(Tlv8::new().with_state(4))
    }
}

impl fmt::Debug for PairingMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingMachine")
            .field("state", &self.state)
            .field("peer_identifier", &self.peer_identifier)
            .field("fast_path", &self.fast_path)
            .finish_non_exhaustive()
    }
}

fn parse_identifier(bytes: &[u8]) -> Result<String> {
    if bytes.is_empty() || bytes.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ProtocolError::Handshake(format!(
            "identifier length {} out of range",
            bytes.len()
        )));
    }
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ProtocolError::Handshake("identifier is not utf-8".to_string()))
}

/// Builds `HKDF(K, label) || identifier || ltpk`, the message signed in
/// pair-setup M3 and M4.
fn sign_input(
    session_key: &[u8],
    label: KdfLabel,
    identifier: &str,
    ltpk: &[u8],
) -> Result<Vec<u8>> {
    let salt = hkdf(session_key, label.salt, label.info, SIGN_SALT_LENGTH)?;
    Ok([&salt[..], identifier.as_bytes(), ltpk].concat())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIN: &[u8] = b"3939";

    struct Fixture {
        identity: Arc<LongTermIdentity>,
        verifier: Arc<PasswordVerifier>,
        store: Arc<MemoryPairingStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                identity: Arc::new(LongTermIdentity::generate()),
                verifier: Arc::new(PasswordVerifier::new(PIN)),
                store: Arc::new(MemoryPairingStore::new()),
            }
        }

        fn machine(&self) -> PairingMachine {
            PairingMachine::new(
                Arc::clone(&self.identity),
                Arc::clone(&self.verifier),
                self.store.clone(),
            )
        }
    }

    fn device() -> PairingClient {
        PairingClient::new(LongTermIdentity::generate(), "device-7F3A")
    }

    fn run_setup(machine: &mut PairingMachine, client: &mut PairingClient, pin: &[u8]) -> Result<()> {
        let m2 = machine.handle_pair_setup(&client.setup_m1())?;
        let m3 = client.setup_m3(pin, &m2)?;
        let m4 = machine.handle_pair_setup(&m3)?;
        client.setup_finish(&m4)?;
        Ok(())
    }

    fn run_verify(machine: &mut PairingMachine, client: &mut PairingClient) -> Result<()> {
        let m2 = machine.handle_pair_verify(&client.verify_m1())?;
        let m3 = client.verify_m3(&m2)?;
        let m4 = machine.handle_pair_verify(&m3)?;
        client.verify_finish(&m4)
    }

    #[test]
    fn test_full_pairing_reaches_streaming() {
        let fixture = Fixture::new();
        let mut machine = fixture.machine();
        let mut client = device();

        assert_eq!(machine.state(), PairingState::AwaitingSetup);
        let m2 = machine.handle_pair_setup(&client.setup_m1()).unwrap();
        assert_eq!(machine.state(), PairingState::SetupInProgress);

        let m3 = client.setup_m3(PIN, &m2).unwrap();
        let m4 = machine.handle_pair_setup(&m3).unwrap();
        assert_eq!(machine.state(), PairingState::AwaitingVerify);
        client.setup_finish(&m4).unwrap();
        assert_eq!(
            client.receiver_key(),
            Some(fixture.identity.peer_key())
        );

        run_verify(&mut machine, &mut client).unwrap();
        assert_eq!(machine.state(), PairingState::Verified);
        assert_eq!(machine.peer_identifier(), Some("device-7F3A"));
        assert!(!machine.used_fast_path());

        let keys = machine.start_streaming().unwrap();
        assert_eq!(machine.state(), PairingState::Streaming);
        assert_eq!(
            keys.key_bytes(),
            client.stream_keys().unwrap().key_bytes()
        );
    }

    #[test]
    fn test_wrong_pin_fails_without_stream_keys() {
        let fixture = Fixture::new();
        let mut machine = fixture.machine();
        let mut client = device();

        let err = run_setup(&mut machine, &mut client, b"1234").unwrap_err();
        assert!(err.is_authentication());
        assert_eq!(machine.state(), PairingState::Failed);
        assert!(fixture.store.is_empty());
        assert!(machine.start_streaming().is_err());
        assert_eq!(machine.state(), PairingState::Failed);
    }

    #[test]
    fn test_no_retry_after_failure() {
        let fixture = Fixture::new();
        let mut machine = fixture.machine();
        let mut bad = device();
        assert!(run_setup(&mut machine, &mut bad, b"0000").is_err());

        // A second, correct attempt on the same connection is refused
        let mut good = device();
        let err = machine.handle_pair_setup(&good.setup_m1()).unwrap_err();
        assert!(matches!(err, ProtocolError::Handshake(_)));
        assert!(run_setup(&mut fixture.machine(), &mut good, PIN).is_ok());
    }

    #[test]
    fn test_setup_m3_before_m1_fails() {
        let fixture = Fixture::new();
        let mut machine = fixture.machine();
        let request = Tlv8::new()
            .with_state(3)
            .with(TlvType::PublicKey, vec![1u8; 384])
            .with(TlvType::Proof, vec![0u8; 64]);

        let err = machine.handle_pair_setup(&request).unwrap_err();
        assert!(matches!(err, ProtocolError::Handshake(_)));
        assert_eq!(machine.state(), PairingState::Failed);
        assert!(machine.failure_reason().is_some());
    }

    #[test]
    fn test_unknown_setup_state_fails() {
        let fixture = Fixture::new();
        let mut machine = fixture.machine();

        assert!(machine
            .handle_pair_setup(&Tlv8::new().with_state(5))
            .is_err());
        assert_eq!(machine.state(), PairingState::Failed);
    }

    #[test]
    fn test_missing_state_item_fails() {
        let fixture = Fixture::new();
        let mut machine = fixture.machine();

        let err = machine.handle_pair_verify(&Tlv8::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingTlvItem(TlvType::State)));
        assert_eq!(machine.state(), PairingState::Failed);
    }

    #[test]
    fn test_unsupported_method_fails() {
        let fixture = Fixture::new();
        let mut machine = fixture.machine();
        let request = Tlv8::new().with_state(1).with(TlvType::Method, vec![3]);

        assert!(machine.handle_pair_setup(&request).is_err());
        assert_eq!(machine.state(), PairingState::Failed);
    }

    #[test]
    fn test_fast_path_skips_setup() {
        let fixture = Fixture::new();
        let mut client = device();
        run_setup(&mut fixture.machine(), &mut client, PIN).unwrap();

        // New connection, same device: straight to pair-verify
        let mut machine = fixture.machine();
        run_verify(&mut machine, &mut client).unwrap();
        assert_eq!(machine.state(), PairingState::Verified);
        assert!(machine.used_fast_path());
    }

    #[test]
    fn test_unknown_device_cannot_use_fast_path() {
        let fixture = Fixture::new();
        let mut machine = fixture.machine();
        let mut stranger = device().with_receiver_key(fixture.identity.peer_key());

        let err = machine
            .handle_pair_verify(&stranger.verify_m1())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownDevice(_)));
        assert_eq!(machine.state(), PairingState::Failed);
    }

    #[test]
    fn test_impostor_signature_fails_verify() {
        let fixture = Fixture::new();
        let mut real = device();
        run_setup(&mut fixture.machine(), &mut real, PIN).unwrap();

        // Same identifier, different long-term key
        let mut impostor = PairingClient::new(LongTermIdentity::generate(), "device-7F3A")
            .with_receiver_key(fixture.identity.peer_key());
        let mut machine = fixture.machine();

        let err = run_verify(&mut machine, &mut impostor).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSignature(_)));
        assert_eq!(machine.state(), PairingState::Failed);
    }

    #[test]
    fn test_verify_m3_before_m1_fails() {
        let fixture = Fixture::new();
        let mut client = device();
        let mut machine = fixture.machine();
        run_setup(&mut machine, &mut client, PIN).unwrap();

        let request = Tlv8::new()
            .with_state(3)
            .with(TlvType::EncryptedData, vec![0u8; 40]);
        assert!(machine.handle_pair_verify(&request).is_err());
        assert_eq!(machine.state(), PairingState::Failed);
    }

    #[test]
    fn test_stream_start_before_verify_fails() {
        let fixture = Fixture::new();
        let mut client = device();
        let mut machine = fixture.machine();
        run_setup(&mut machine, &mut client, PIN).unwrap();

        assert!(machine.start_streaming().is_err());
        assert_eq!(machine.state(), PairingState::Failed);
    }

    #[test]
    fn test_stream_keys_differ_from_handshake_keys() {
        let fixture = Fixture::new();
        let mut client = device();
        let mut machine = fixture.machine();
        run_setup(&mut machine, &mut client, PIN).unwrap();
        run_verify(&mut machine, &mut client).unwrap();

        let shared = machine.shared_secret.clone().unwrap();
        let handshake_key = derive_key(shared.as_bytes(), PAIR_VERIFY_ENCRYPT).unwrap();
        let keys = machine.start_streaming().unwrap();

        assert_ne!(keys.key_bytes(), handshake_key.as_bytes());
        assert_ne!(keys.key_bytes(), shared.as_bytes());
        assert!(machine.shared_secret.is_none());
    }

    #[test]
    fn test_close_is_terminal() {
        let fixture = Fixture::new();
        let mut machine = fixture.machine();
        machine.close();
        assert_eq!(machine.state(), PairingState::Closed);

        let client = device();
        assert!(machine.handle_pair_setup(&client.setup_m1()).is_err());
        // Rejection of a closed connection does not rewrite history
        assert_eq!(machine.state(), PairingState::Closed);
    }

    #[test]
    fn test_close_after_failure_stays_failed() {
        let fixture = Fixture::new();
        let mut machine = fixture.machine();
        machine.fail("test");
        machine.close();
        assert_eq!(machine.state(), PairingState::Failed);
        assert_eq!(machine.failure_reason(), Some("test"));
    }

    #[test]
    fn test_error_reply_is_generic() {
        let request = Tlv8::new().with_state(3);
        let reply = PairingMachine::error_reply(
            &request,
            &ProtocolError::Authentication("proof mismatch".into()),
        );
        assert_eq!(reply.state().unwrap(), 4);
        assert_eq!(reply.error(), Some(TlvErrorCode::Authentication));
        assert_eq!(reply.len(), 2);

        let reply = PairingMachine::error_reply(
            &Tlv8::new(),
            &ProtocolError::Handshake("bad".into()),
        );
        assert_eq!(reply.state().unwrap(), 2);
        assert_eq!(reply.error(), Some(TlvErrorCode::Unknown));
    }
}
