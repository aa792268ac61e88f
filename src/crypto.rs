//! # Key Exchange
//!
//! This module provides the key agreement foundation:
//! - X25519 ephemeral key pairs
//! - Shared secret computation from local-private/peer-public halves
//! - HKDF-SHA256 session key derivation
//! - Secure random IV generation
//!
//! ## Security Considerations
//!
//! - The ephemeral private half is consumed by the exchange and cannot be reused
//! - Shared secrets and session keys are zeroized on drop
//! - Low-order peer keys are rejected (non-contributory exchange)

use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtocolError, ProtocolResult};
use crate::{EPHEMERAL_KEY_SIZE, KEY_SIZE, NONCE_SIZE};

/// Fixed HKDF info label
const SESSION_KEY_LABEL: &[u8] = b"secure-transfer session key v1";

/// Ephemeral keypair for key exchange
///
/// Uses X25519 elliptic curve Diffie-Hellman.
/// The private half is zeroized on drop.
pub struct EphemeralKeyPair {
    secret: Option<EphemeralSecret>,
    /// The public half for sharing
    pub public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret: Some(secret),
            public,
        }
    }

    /// Get the public key bytes for transmission
    pub fn public_bytes(&self) -> [u8; EPHEMERAL_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Perform Diffie-Hellman key exchange
    ///
    /// Consumes the keypair so the private half cannot outlive the exchange.
    pub fn derive_shared_secret(mut self, peer_public: &PublicKey) -> ProtocolResult<SharedSecret> {
        let secret = self.secret.take().ok_or_else(|| {
            ProtocolError::KeyAgreementError("Secret key already consumed".to_string())
        })?;
        let shared = secret.diffie_hellman(peer_public);
        if !shared.was_contributory() {
            return Err(ProtocolError::KeyAgreementError(
                "Peer key is a low-order point".to_string(),
            ));
        }
        Ok(shared)
    }
}

/// Parse a peer's ephemeral public key from wire bytes
pub fn parse_ephemeral_public(bytes: &[u8]) -> ProtocolResult<PublicKey> {
    let raw: [u8; EPHEMERAL_KEY_SIZE] = bytes.try_into().map_err(|_| {
        ProtocolError::KeyAgreementError(format!(
            "Ephemeral public key must be {} bytes, got {}",
            EPHEMERAL_KEY_SIZE,
            bytes.len()
        ))
    })?;
    Ok(PublicKey::from(raw))
}

/// How the session key derivation is bound to the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfBinding {
    /// Content-independent info label
    #[default]
    Fixed,
    /// Info label followed by both ephemeral public keys
    Transcript,
}

/// Symmetric session key for the secure channel
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Derive the session key from a DH shared secret using HKDF-SHA256
///
/// `client_public` and `server_public` only feed the derivation when
/// `binding` is [`KdfBinding::Transcript`].
pub fn derive_session_key(
    shared_secret: &SharedSecret,
    binding: KdfBinding,
    client_public: &[u8; EPHEMERAL_KEY_SIZE],
    server_public: &[u8; EPHEMERAL_KEY_SIZE],
) -> ProtocolResult<SessionKey> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret.as_bytes());

    let mut info = Vec::with_capacity(SESSION_KEY_LABEL.len() + 2 * EPHEMERAL_KEY_SIZE);
    info.extend_from_slice(SESSION_KEY_LABEL);
    if binding == KdfBinding::Transcript {
        info.extend_from_slice(client_public);
        info.extend_from_slice(server_public);
    }

    let mut key = [0u8; KEY_SIZE];
    let result = hk.expand(&info, &mut key);
    if let Err(e) = result {
        key.zeroize();
        return Err(ProtocolError::KeyAgreementError(format!(
            "HKDF expand failed: {}",
            e
        )));
    }
    Ok(SessionKey(key))
}

/// Generate a fresh random IV
pub fn generate_iv() -> [u8; NONCE_SIZE] {
    random_bytes()
}

/// Generate cryptographically secure random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
