//! # Transcript Signatures
//!
//! Both peers sign the same transcript with their long-term Ed25519 keys:
//!
//! ```text
//! client ephemeral public key || server ephemeral public key || username
//! ```
//!
//! Binding the username prevents an active attacker from re-attributing a
//! valid key exchange to a different claimed identity.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::{ProtocolError, ProtocolResult};
use crate::EPHEMERAL_KEY_SIZE;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

/// The handshake values signed and verified as one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub client_ephemeral: [u8; EPHEMERAL_KEY_SIZE],
    pub server_ephemeral: [u8; EPHEMERAL_KEY_SIZE],
    pub username: String,
}

impl Transcript {
    pub fn new(
        client_ephemeral: [u8; EPHEMERAL_KEY_SIZE],
        server_ephemeral: [u8; EPHEMERAL_KEY_SIZE],
        username: impl Into<String>,
    ) -> Self {
        Self {
            client_ephemeral,
            server_ephemeral,
            username: username.into(),
        }
    }

    /// Fixed-order concatenation
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 * EPHEMERAL_KEY_SIZE + self.username.len());
        out.extend_from_slice(&self.client_ephemeral);
        out.extend_from_slice(&self.server_ephemeral);
        out.extend_from_slice(self.username.as_bytes());
        out
    }
}

/// Sign transcript bytes with a long-term key
pub fn sign(private_key: Option<&SigningKey>, transcript: &[u8]) -> ProtocolResult<Signature> {
    let key = private_key
        .ok_or_else(|| ProtocolError::SigningError("No private key available".to_string()))?;
    key.try_sign(transcript)
        .map_err(|e| ProtocolError::SigningError(e.to_string()))
}

/// Verify a signature over transcript bytes.
///
/// Never fails on mismatch: malformed or wrong signatures return `false`.
pub fn verify(public_key: &VerifyingKey, transcript: &[u8], signature: &[u8]) -> bool {
    let Ok(raw) = <[u8; SIGNATURE_SIZE]>::try_from(signature) else {
        return false;
    };
    let signature = Signature::from_bytes(&raw);
    public_key.verify(transcript, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn transcript(user: &str) -> Transcript {
        Transcript::new([1u8; 32], [2u8; 32], user)
    }

    #[test]
    fn test_sign_verify() {
        let key = SigningKey::generate(&mut OsRng);
        let bytes = transcript("alice").to_bytes();

        let sig = sign(Some(&key), &bytes).unwrap();
        assert!(verify(&key.verifying_key(), &bytes, &sig.to_bytes()));
    }

    #[test]
    fn test_username_substitution_fails() {
        let key = SigningKey::generate(&mut OsRng);
        let sig = sign(Some(&key), &transcript("alice").to_bytes()).unwrap();

        assert!(!verify(
            &key.verifying_key(),
            &transcript("bob").to_bytes(),
            &sig.to_bytes()
        ));
    }

    #[test]
    fn test_wrong_key_and_garbage() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let bytes = transcript("alice").to_bytes();
        let sig = sign(Some(&key), &bytes).unwrap();

        assert!(!verify(&other.verifying_key(), &bytes, &sig.to_bytes()));
        assert!(!verify(&key.verifying_key(), &bytes, &[0u8; 12]));
    }

    #[test]
    fn test_missing_private_key() {
        assert!(matches!(
            sign(None, b"anything"),
            Err(ProtocolError::SigningError(_))
        ));
    }

    #[test]
    fn test_transcript_layout() {
        let bytes = transcript("alice").to_bytes();
        assert_eq!(bytes.len(), 64 + 5);
        assert_eq!(&bytes[..32], &[1u8; 32]);
        assert_eq!(&bytes[32..64], &[2u8; 32]);
        assert_eq!(&bytes[64..], b"alice");
    }
}
