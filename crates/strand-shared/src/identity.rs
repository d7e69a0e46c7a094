use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::{CryptoError, IdentityError};
use crate::types::{PeerId, ThreadId};

/// An Ed25519 keypair.
///
/// Used both for the node identity (its public key is the [`PeerId`]) and
/// for thread keys (the public key is the [`ThreadId`], the secret is shared
/// with every invited member).
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

/// Serializable format for storing/exporting a keypair
#[derive(Serialize, Deserialize)]
pub struct KeypairExport {
    pub secret_key: [u8; 32],
    pub public_key: [u8; 32],
}

impl Keypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        Self { signing_key }
    }

    /// Restore from a secret of unchecked length (e.g. a decrypted invite).
    pub fn from_secret_slice(secret: &[u8]) -> Result<Self, IdentityError> {
        let bytes: [u8; 32] = secret
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyBytes)?;
        Ok(Self::from_secret_bytes(&bytes))
    }

    /// Restore from a serialized export
    pub fn from_export(export: &KeypairExport) -> Self {
        Self::from_secret_bytes(&export.secret_key)
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId(self.public_key_bytes())
    }

    pub fn thread_id(&self) -> ThreadId {
        ThreadId(self.public_key_bytes())
    }

    /// Get the raw public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the raw secret key bytes
    pub fn secret_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Get the verifying (public) key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Open a payload sealed to this keypair's public key.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::open(self.signing_key.to_scalar_bytes(), data)
    }

    /// Export for serialization
    pub fn to_export(&self) -> KeypairExport {
        KeypairExport {
            secret_key: *self.signing_key.as_bytes(),
            public_key: self.signing_key.verifying_key().to_bytes(),
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// Verify a detached signature against a public key
pub fn verify_signature(
    pubkey_bytes: &[u8; 32],
    message: &[u8],
    signature: &[u8],
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(pubkey_bytes).map_err(|_| IdentityError::InvalidKeyBytes)?;
    let signature =
        Signature::from_slice(signature).map_err(|_| IdentityError::InvalidSignature)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| IdentityError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_roundtrip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_export(&kp.to_export());
        assert_eq!(kp.peer_id(), restored.peer_id());
    }

    #[test]
    fn test_sign_verify() {
        let kp = Keypair::generate();
        let message = b"block bytes";
        let signature = kp.sign(message).to_bytes();

        assert!(verify_signature(&kp.public_key_bytes(), message, &signature).is_ok());
        assert!(verify_signature(&kp.public_key_bytes(), b"wrong", &signature).is_err());
        assert!(verify_signature(&kp.public_key_bytes(), message, &signature[..10]).is_err());
    }

    #[test]
    fn test_from_secret_slice_rejects_bad_length() {
        assert!(Keypair::from_secret_slice(&[1u8; 31]).is_err());

        let kp = Keypair::generate();
        let restored = Keypair::from_secret_slice(kp.secret_bytes()).unwrap();
        assert_eq!(restored.thread_id(), kp.thread_id());
    }
}
