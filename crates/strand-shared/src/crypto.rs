use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::VerifyingKey;
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};

use crate::constants::{KDF_CONTEXT_SEAL_KEY, NONCE_SIZE, PUBKEY_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn symmetric_key_from_slice(bytes: &[u8]) -> Result<SymmetricKey, CryptoError> {
    if bytes.len() != SYMMETRIC_KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength);
    }
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    key.copy_from_slice(bytes);
    Ok(key)
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

// ---------------------------------------------------------------------------
// Public-key sealing
// ---------------------------------------------------------------------------

/// Encrypt `plaintext` so that only the holder of the Ed25519 secret key
/// behind `recipient` can read it.
///
/// Output layout: `ephemeral_x25519_pub(32) || nonce(24) || ciphertext`.
pub fn seal(recipient: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let recipient_x = ed25519_to_x25519_public(recipient)?;

    let ephemeral = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_pub = X25519Public::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient_x);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPublicKey);
    }

    let key = derive_seal_key(shared.as_bytes(), ephemeral_pub.as_bytes(), recipient_x.as_bytes());
    let sealed = encrypt(&key, plaintext)?;

    let mut output = Vec::with_capacity(PUBKEY_SIZE + sealed.len());
    output.extend_from_slice(ephemeral_pub.as_bytes());
    output.extend_from_slice(&sealed);
    Ok(output)
}

/// Open a payload produced by [`seal`], given the recipient's X25519 secret
/// scalar (see [`crate::identity::Keypair::open`]).
pub fn open(recipient_scalar: [u8; 32], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < PUBKEY_SIZE + NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let (ephemeral_bytes, sealed) = data.split_at(PUBKEY_SIZE);
    let mut ephemeral = [0u8; PUBKEY_SIZE];
    ephemeral.copy_from_slice(ephemeral_bytes);
    let ephemeral_pub = X25519Public::from(ephemeral);

    let secret = StaticSecret::from(recipient_scalar);
    let own_pub = X25519Public::from(&secret);
    let shared = secret.diffie_hellman(&ephemeral_pub);
    if !shared.was_contributory() {
        return Err(CryptoError::DecryptionFailed);
    }

    let key = derive_seal_key(shared.as_bytes(), ephemeral_pub.as_bytes(), own_pub.as_bytes());
    decrypt(&key, sealed)
}

fn ed25519_to_x25519_public(pubkey: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    let verifying = VerifyingKey::from_bytes(pubkey).map_err(|_| CryptoError::InvalidPublicKey)?;
    Ok(X25519Public::from(verifying.to_montgomery().to_bytes()))
}

// BLAKE3 KDF with domain separation
fn derive_seal_key(shared: &[u8], ephemeral_pub: &[u8], recipient_pub: &[u8]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_SEAL_KEY);
    hasher.update(shared);
    hasher.update(ephemeral_pub);
    hasher.update(recipient_pub);
    let hash = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash.as_bytes()[..32]);
    key
}
