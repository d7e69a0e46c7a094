use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid recipient public key")]
    InvalidPublicKey,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid signature")]
    InvalidSignature,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid envelope signature")]
    BadSignature,

    #[error("Invalid thread signature")]
    BadThreadSignature,

    #[error("Unexpected message type: {0:?}")]
    UnexpectedType(crate::protocol::MessageType),
}

#[derive(Error, Debug)]
pub enum InviteLinkError {
    #[error("Invalid invite link format")]
    InvalidFormat,

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid invite key length")]
    InvalidKeyLength,
}
