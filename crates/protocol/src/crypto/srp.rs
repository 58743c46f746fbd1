//! SRP-6a (3072-bit group, SHA-512) for pair-setup.
//!
//! The receiver holds a [`PasswordVerifier`] computed from its pairing PIN.
//! A pair-setup exchange runs in two steps on the server side:
//!
//! 1. [`SrpServerSession::new`] picks the private ephemeral `b` and exposes
//!    `B` for M2.
//! 2. [`SrpServerSession::srp_server_step`] consumes the client's `A` and
//!    yields [`SrpProofMaterial`]; [`SrpProofMaterial::verify_client_proof`]
//!    checks `M1` in constant time and releases the server proof `M2` and
//!    the session key.
//!
//! [`SrpClientSession`] is the device side, used by the pairing client.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;
use srp::client::{SrpClient, SrpClientVerifier};
use srp::groups::G_3072;
use srp::server::{SrpServer, SrpServerVerifier};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{ProtocolError, Result};

/// SRP username used by every pair-setup exchange.
pub const SRP_USERNAME: &[u8] = b"Pair-Setup";

/// Length of the random salt stored with the verifier.
pub const SRP_SALT_LENGTH: usize = 16;

/// Length of the random private ephemerals `a` and `b`.
const SRP_PRIVATE_LENGTH: usize = 32;

fn random_private() -> Zeroizing<Vec<u8>> {
    let mut bytes = Zeroizing::new(vec![0u8; SRP_PRIVATE_LENGTH]);
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Salt and verifier `v` derived from the pairing PIN.
///
/// The PIN itself is not retained.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PasswordVerifier {
    salt: [u8; SRP_SALT_LENGTH],
    verifier: Vec<u8>,
}

impl PasswordVerifier {
    /// Computes a verifier for `password` with a fresh random salt.
    pub fn new(password: &[u8]) -> Self {
        let mut salt = [0u8; SRP_SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);
        Self::with_salt(password, salt)
    }

    /// Computes a verifier for `password` with a fixed salt.
    pub fn with_salt(password: &[u8], salt: [u8; SRP_SALT_LENGTH]) -> Self {
        let client = SrpClient::<Sha512>::new(&G_3072);
        let verifier = client.compute_verifier(SRP_USERNAME, password, &salt);
        Self { salt, verifier }
    }

    /// Returns the salt sent in pair-setup M2.
    pub fn salt(&self) -> &[u8; SRP_SALT_LENGTH] {
        &self.salt
    }
}

impl std::fmt::Debug for PasswordVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordVerifier")
            .field("salt", &self.salt)
            .field("verifier", &"[REDACTED]")
            .finish()
    }
}

/// Server half of one pair-setup exchange.
pub struct SrpServerSession {
    b: Zeroizing<Vec<u8>>,
    server_public: Vec<u8>,
    verifier: PasswordVerifier,
}

impl SrpServerSession {
    /// Starts an exchange for `verifier`, generating the private ephemeral.
    pub fn new(verifier: &PasswordVerifier) -> Self {
        let b = random_private();
        let server = SrpServer::<Sha512>::new(&G_3072);
        let server_public = server.compute_public_ephemeral(&b, &verifier.verifier);
        Self {
            b,
            server_public,
            verifier: verifier.clone(),
        }
    }

    /// Returns `B`, sent in pair-setup M2.
    pub fn server_public(&self) -> &[u8] {
        &self.server_public
    }

    /// Returns the salt, sent in pair-setup M2.
    pub fn salt(&self) -> &[u8; SRP_SALT_LENGTH] {
        self.verifier.salt()
    }

    /// Processes the client's public ephemeral `A`.
    ///
    /// Fails if `A` is zero modulo N.
    pub fn srp_server_step(self, client_public: &[u8]) -> Result<SrpProofMaterial> {
        let server = SrpServer::<Sha512>::new(&G_3072);
        let inner = server
            .process_reply(&self.b, &self.verifier.verifier, client_public)
            .map_err(|e| ProtocolError::Authentication(format!("invalid client public: {}", e)))?;
        Ok(SrpProofMaterial { inner })
    }
}

/// Expected proofs and session key after both ephemerals are known.
pub struct SrpProofMaterial {
    inner: SrpServerVerifier<Sha512>,
}

impl SrpProofMaterial {
    /// Checks the client's proof `M1`; on success returns the server proof
    /// `M2` together with the session key `K`.
    pub fn verify_client_proof(self, client_proof: &[u8]) -> Result<SrpOutcome> {
        self.inner.verify_client(client_proof)?;
        Ok(SrpOutcome {
            server_proof: self.inner.proof().to_vec(),
            session_key: Zeroizing::new(self.inner.key().to_vec()),
        })
    }
}

/// Result of a successful SRP exchange.
pub struct SrpOutcome {
    /// `M2`, proving the server knows the verifier.
    pub server_proof: Vec<u8>,
    /// Shared session key `K`.
    pub session_key: Zeroizing<Vec<u8>>,
}

/// Device half of one pair-setup exchange.
pub struct SrpClientSession {
    a: Zeroizing<Vec<u8>>,
    client_public: Vec<u8>,
    password: Zeroizing<Vec<u8>>,
}

impl SrpClientSession {
    /// Starts an exchange for `password`.
    pub fn new(password: &[u8]) -> Self {
        let a = random_private();
        let client = SrpClient::<Sha512>::new(&G_3072);
        let client_public = client.compute_public_ephemeral(&a);
        Self {
            a,
            client_public,
            password: Zeroizing::new(password.to_vec()),
        }
    }

    /// Returns `A`, sent in pair-setup M3.
    pub fn client_public(&self) -> &[u8] {
        &self.client_public
    }

    /// Processes the salt and `B` from M2, producing the client proof.
    pub fn process_server(&self, salt: &[u8], server_public: &[u8]) -> Result<SrpClientProof> {
        let client = SrpClient::<Sha512>::new(&G_3072);
        let inner = client
            .process_reply(&self.a, SRP_USERNAME, &self.password, salt, server_public)
            .map_err(|e| ProtocolError::Authentication(format!("invalid server public: {}", e)))?;
        Ok(SrpClientProof { inner })
    }
}

/// Client proof `M1` plus the means to check the server's `M2`.
pub struct SrpClientProof {
    inner: SrpClientVerifier<Sha512>,
}

impl SrpClientProof {
    /// Returns `M1`.
    pub fn proof(&self) -> &[u8] {
        self.inner.proof()
    }

    /// Returns the session key `K`.
    pub fn session_key(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.inner.key().to_vec())
    }

    /// Checks the server proof `M2`.
    pub fn verify_server_proof(&self, server_proof: &[u8]) -> Result<()> {
        self.inner.verify_server(server_proof)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_with_correct_pin() {
        let verifier = PasswordVerifier::new(b"3939");
        let server = SrpServerSession::new(&verifier);
        let client = SrpClientSession::new(b"3939");

        let client_proof = client
            .process_server(server.salt(), server.server_public())
            .unwrap();
        let outcome = server
            .srp_server_step(client.client_public())
            .unwrap()
            .verify_client_proof(client_proof.proof())
            .unwrap();

        client_proof
            .verify_server_proof(&outcome.server_proof)
            .unwrap();
        assert_eq!(*outcome.session_key, *client_proof.session_key());
    }

    #[test]
    fn test_wrong_pin_fails_authentication() {
        let verifier = PasswordVerifier::new(b"3939");
        let server = SrpServerSession::new(&verifier);
        let client = SrpClientSession::new(b"0000");

        let client_proof = client
            .process_server(server.salt(), server.server_public())
            .unwrap();
        let result = server
            .srp_server_step(client.client_public())
            .unwrap()
            .verify_client_proof(client_proof.proof());

        assert!(matches!(result, Err(ProtocolError::Authentication(_))));
    }

    #[test]
    fn test_zero_client_public_rejected() {
        let verifier = PasswordVerifier::new(b"3939");
        let server = SrpServerSession::new(&verifier);

        let result = server.srp_server_step(&[0u8; 384]);
        assert!(matches!(result, Err(ProtocolError::Authentication(_))));
    }

    #[test]
    fn test_forged_server_proof_rejected() {
        let verifier = PasswordVerifier::new(b"3939");
        let server = SrpServerSession::new(&verifier);
        let client = SrpClientSession::new(b"3939");
        let client_proof = client
            .process_server(server.salt(), server.server_public())
            .unwrap();

        assert!(client_proof.verify_server_proof(&[0u8; 64]).is_err());
    }

    #[test]
    fn test_server_public_is_group_sized() {
        let verifier = PasswordVerifier::new(b"3939");
        let server = SrpServerSession::new(&verifier);
        assert!(server.server_public().len() <= 384);
        assert!(server.server_public().len() > 300);
    }

    #[test]
    fn test_verifier_debug_redacted() {
        let verifier = PasswordVerifier::with_salt(b"3939", [1u8; SRP_SALT_LENGTH]);
        assert!(format!("{:?}", verifier).contains("REDACTED"));
    }
}
