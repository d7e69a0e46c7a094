use serde::{Deserialize, Serialize};

// Peer identity = Ed25519 public key (32 bytes)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 32]);

// Thread address = the thread's Ed25519 public key
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub [u8; 32]);

macro_rules! hex_key_type {
    ($name:ident) => {
        impl $name {
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| hex::FromHexError::InvalidStringLength)?;
                Ok(Self(arr))
            }

            pub fn short(&self) -> String {
                self.to_hex()[..8].to_string()
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl std::str::FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }
    };
}

hex_key_type!(PeerId);
hex_key_type!(ThreadId);

/// Address of an object in the content store.
///
/// The string form is whatever the content store hands back from `put`; the
/// empty id is never valid and marks the genesis of a thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(pub String);

impl ContentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// BLAKE3 digest of `data`, hex encoded.
    pub fn for_bytes(data: &[u8]) -> Self {
        Self(blake3::hash(data).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_hex_roundtrip() {
        let id = PeerId([7u8; 32]);
        let parsed: PeerId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_thread_id_rejects_short_hex() {
        assert!(ThreadId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_content_id_is_deterministic() {
        assert_eq!(ContentId::for_bytes(b"block"), ContentId::for_bytes(b"block"));
        assert_ne!(ContentId::for_bytes(b"a"), ContentId::for_bytes(b"b"));
        assert!(ContentId::new("").is_empty());
    }
}
