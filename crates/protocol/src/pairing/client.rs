//! Device side of the pairing handshake.
//!
//! Receivers never run this; it exists so tests, benches and tooling can
//! drive a [`PairingMachine`](super::PairingMachine) exactly as a mirroring
//! device would.

use zeroize::Zeroizing;

use super::{sign_input, METHOD_PAIR_SETUP};
use crate::crypto::aead::{aead_open, aead_seal, label_nonce};
use crate::crypto::kdf::{
    derive_key, SessionKey, PAIR_SETUP_ACCESSORY_SIGN, PAIR_SETUP_CONTROLLER_SIGN,
    PAIR_SETUP_ENCRYPT, PAIR_VERIFY_ENCRYPT,
};
use crate::crypto::{
    EphemeralKeyPair, LongTermIdentity, PeerKey, SharedSecret, Signature, SrpClientProof,
    SrpClientSession, X25519_PUBLIC_KEY_LENGTH,
};
use crate::error::{ProtocolError, Result};
use crate::stream::{StreamEncryptor, StreamKeys};
use crate::tlv::{Tlv8, TlvType};

struct PendingSetup {
    proof: SrpClientProof,
    session_key: Zeroizing<Vec<u8>>,
    setup_key: SessionKey,
}

/// A mirroring device talking to a receiver.
pub struct PairingClient {
    identity: LongTermIdentity,
    identifier: String,
    receiver_key: Option<PeerKey>,
    setup: Option<PendingSetup>,
    ephemeral: Option<EphemeralKeyPair>,
    shared: Option<SharedSecret>,
}

impl PairingClient {
    /// Creates a client that pairs as `identifier`.
    pub fn new(identity: LongTermIdentity, identifier: impl Into<String>) -> Self {
        Self {
            identity,
            identifier: identifier.into(),
            receiver_key: None,
            setup: None,
            ephemeral: None,
            shared: None,
        }
    }

    /// Trusts a receiver key learned from an earlier pairing.
    pub fn with_receiver_key(mut self, key: PeerKey) -> Self {
        self.receiver_key = Some(key);
        self
    }

    /// Returns the identifier this client pairs as.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Returns the receiver's long-term key once known.
    pub fn receiver_key(&self) -> Option<PeerKey> {
        self.receiver_key
    }

    /// Builds pair-setup M1.
    pub fn setup_m1(&self) -> Tlv8 {
        Tlv8::new()
            .with_state(1)
            .with(TlvType::Method, vec![METHOD_PAIR_SETUP])
    }

    /// Answers pair-setup M2 with M3, proving knowledge of `pin`.
    pub fn setup_m3(&mut self, pin: &[u8], m2: &Tlv8) -> Result<Tlv8> {
        check_reply(m2, 2)?;
        let salt = m2.require(TlvType::Salt)?;
        let server_public = m2.require(TlvType::PublicKey)?;

        let srp = SrpClientSession::new(pin);
        let proof = srp.process_server(salt, server_public)?;
        let session_key = proof.session_key();
        let setup_key = derive_key(&session_key, PAIR_SETUP_ENCRYPT)?;

        let ltpk = self.identity.public_key_bytes();
        let signed = sign_input(
            &session_key,
            PAIR_SETUP_CONTROLLER_SIGN,
            &self.identifier,
            &ltpk,
        )?;
        let sub = Tlv8::new()
            .with(TlvType::Identifier, self.identifier.as_bytes().to_vec())
            .with(TlvType::PublicKey, ltpk.to_vec())
            .with(
                TlvType::Signature,
                self.identity.sign(&signed).as_bytes().to_vec(),
            );
        let sealed = aead_seal(&setup_key, &label_nonce(b"PS-Msg03"), &sub.encode(), b"")?;

        let m3 = Tlv8::new()
            .with_state(3)
            .with(TlvType::PublicKey, srp.client_public().to_vec())
            .with(TlvType::Proof, proof.proof().to_vec())
            .with(TlvType::EncryptedData, sealed);
        self.setup = Some(PendingSetup {
            proof,
            session_key,
            setup_key,
        });
        Ok(m3)
    }

    /// Checks pair-setup M4 and records the receiver's long-term key.
    pub fn setup_finish(&mut self, m4: &Tlv8) -> Result<PeerKey> {
        check_reply(m4, 4)?;
        let pending = self
            .setup
            .take()
            .ok_or_else(|| ProtocolError::Handshake("pair-setup M4 before M3".to_string()))?;
        pending
            .proof
            .verify_server_proof(m4.require(TlvType::Proof)?)?;

        let sub = Tlv8::decode(&aead_open(
            &pending.setup_key,
            &label_nonce(b"PS-Msg04"),
            m4.require(TlvType::EncryptedData)?,
            b"",
        )?)?;
        let receiver_id = String::from_utf8_lossy(sub.require(TlvType::Identifier)?).into_owned();
        let receiver_key = PeerKey::from_slice(sub.require(TlvType::PublicKey)?)?;
        let signature = Signature::from_slice(sub.require(TlvType::Signature)?)?;

        let signed = sign_input(
            &pending.session_key,
            PAIR_SETUP_ACCESSORY_SIGN,
            &receiver_id,
            &receiver_key.to_bytes(),
        )?;
        receiver_key.verify(&signed, &signature)?;

        self.receiver_key = Some(receiver_key);
        Ok(receiver_key)
    }

    /// Builds pair-verify M1 with a fresh ephemeral key.
    pub fn verify_m1(&mut self) -> Tlv8 {
        let ephemeral = EphemeralKeyPair::generate();
        let m1 = Tlv8::new()
            .with_state(1)
            .with(TlvType::PublicKey, ephemeral.public_key_bytes().to_vec())
            .with(TlvType::Identifier, self.identifier.as_bytes().to_vec());
        self.ephemeral = Some(ephemeral);
        self.shared = None;
        m1
    }

    /// Checks the receiver's proof in pair-verify M2 and answers with M3.
    pub fn verify_m3(&mut self, m2: &Tlv8) -> Result<Tlv8> {
        check_reply(m2, 2)?;
        let receiver_key = self.receiver_key.ok_or_else(|| {
            ProtocolError::Handshake("receiver key unknown; run pair-setup first".to_string())
        })?;
        let ephemeral = self
            .ephemeral
            .take()
            .ok_or_else(|| ProtocolError::Handshake("pair-verify M2 before M1".to_string()))?;
        let device_public = ephemeral.public_key_bytes();

        let receiver_public: [u8; X25519_PUBLIC_KEY_LENGTH] = m2
            .require(TlvType::PublicKey)?
            .try_into()
            .map_err(|_| {
                ProtocolError::InvalidPublicKey("pair-verify key must be 32 bytes".to_string())
            })?;
        let shared = ephemeral.agree(&receiver_public)?;
        let encrypt_key = derive_key(shared.as_bytes(), PAIR_VERIFY_ENCRYPT)?;

        let sub = Tlv8::decode(&aead_open(
            &encrypt_key,
            &label_nonce(b"PV-Msg02"),
            m2.require(TlvType::EncryptedData)?,
            b"",
        )?)?;
        let receiver_id = sub.require(TlvType::Identifier)?;
        if receiver_id != receiver_key.identifier().as_bytes() {
            return Err(ProtocolError::Authentication(
                "receiver identifier does not match its key".to_string(),
            ));
        }
        let signature = Signature::from_slice(sub.require(TlvType::Signature)?)?;
        let transcript = [&receiver_public[..], receiver_id, &device_public[..]].concat();
        receiver_key.verify(&transcript, &signature)?;

        let transcript = [
            &device_public[..],
            self.identifier.as_bytes(),
            &receiver_public[..],
        ]
        .concat();
        let reply = Tlv8::new()
            .with(TlvType::Identifier, self.identifier.as_bytes().to_vec())
            .with(
                TlvType::Signature,
                self.identity.sign(&transcript).as_bytes().to_vec(),
            );
        let sealed = aead_seal(&encrypt_key, &label_nonce(b"PV-Msg03"), &reply.encode(), b"")?;

        self.shared = Some(shared);
        Ok(Tlv8::new()
            .with_state(3)
            .with(TlvType::EncryptedData, sealed))
    }

    /// Checks pair-verify M4.
    pub fn verify_finish(&self, m4: &Tlv8) -> Result<()> {
        check_reply(m4, 4)
    }

    /// Derives the stream keys the receiver will derive on stream start.
    pub fn stream_keys(&self) -> Result<StreamKeys> {
        let shared = self
            .shared
            .as_ref()
            .ok_or_else(|| ProtocolError::Handshake("pair-verify not completed".to_string()))?;
        StreamKeys::derive(shared)
    }

    /// Returns an encryptor for the mirroring stream, starting at counter 0.
    pub fn stream_encryptor(&self) -> Result<StreamEncryptor> {
        Ok(StreamEncryptor::new(self.stream_keys()?))
    }
}

impl std::fmt::Debug for PairingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingClient")
            .field("identifier", &self.identifier)
            .field("paired", &self.receiver_key.is_some())
            .finish_non_exhaustive()
    }
}

fn check_reply(reply: &Tlv8, expected_state: u8) -> Result<()> {
    if let Some(code) = reply.error() {
        return Err(ProtocolError::Authentication(format!(
            "receiver rejected M{}: {:?}",
            expected_state - 1,
            code
        )));
    }
    let state = reply.state()?;
    if state != expected_state {
        return Err(ProtocolError::Handshake(format!(
            "expected M{}, got M{}",
            expected_state, state
        )));
    }
    Ok(())
}
