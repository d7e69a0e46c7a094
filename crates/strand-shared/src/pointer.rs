use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{KDF_CONTEXT_POINTER_KEY, POINTER_PREFIX_BITS};
use crate::types::{ContentId, PeerId};

/// DHT lookup key shared by every peer whose hash has the same prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointerKey(pub [u8; 32]);

impl PointerKey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for PointerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointerPurpose {
    Message,
}

/// A published marker telling a recipient where to fetch an undelivered
/// message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pointer {
    pub id: String,
    pub key: PointerKey,
    /// Content id of the sealed envelope.
    pub cid: ContentId,
    /// Peer holding the message and expecting the ack.
    pub provider: PeerId,
    /// Service address of the provider, when known.
    pub provider_addr: Option<String>,
    pub purpose: PointerPurpose,
    pub date: DateTime<Utc>,
    /// Intended recipient.
    pub cancel_id: Option<PeerId>,
}

/// Derive the pointer key for `peer`.
///
/// The first eight bytes of the peer hash are read as a big-endian integer,
/// everything below the top [`POINTER_PREFIX_BITS`] bits is zeroed, and the
/// masked value is hashed again.
pub fn pointer_key(peer: &PeerId) -> PointerKey {
    pointer_key_with_prefix(peer, POINTER_PREFIX_BITS)
}

pub fn pointer_key_with_prefix(peer: &PeerId, prefix_bits: u32) -> PointerKey {
    let digest = blake3::hash(&peer.0);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    let value = u64::from_be_bytes(head);

    let masked = match prefix_bits {
        0 => 0,
        b if b >= 64 => value,
        b => value & (u64::MAX << (64 - b)),
    };

    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_POINTER_KEY);
    hasher.update(&masked.to_be_bytes());
    PointerKey(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_key_is_stable() {
        let peer = PeerId([9u8; 32]);
        assert_eq!(pointer_key(&peer), pointer_key(&peer));
    }

    #[test]
    fn test_zero_prefix_collapses_all_peers() {
        let a = pointer_key_with_prefix(&PeerId([1u8; 32]), 0);
        let b = pointer_key_with_prefix(&PeerId([2u8; 32]), 0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_full_prefix_separates_peers() {
        let a = pointer_key_with_prefix(&PeerId([1u8; 32]), 64);
        let b = pointer_key_with_prefix(&PeerId([2u8; 32]), 64);
        assert_ne!(a, b);
    }
}
