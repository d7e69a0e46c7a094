use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::constants::INVITE_LINK_PREFIX;
use crate::crypto::{symmetric_key_from_slice, SymmetricKey};
use crate::error::InviteLinkError;
use crate::types::{ContentId, PeerId};

/// The out-of-band half of an external invite: where the invite block lives,
/// the one-off key that decrypts the thread secret inside it, and the peer
/// that can serve the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalInviteLink {
    pub block_id: ContentId,
    pub key: SymmetricKey,
    pub inviter: PeerId,
}

#[derive(Serialize, Deserialize)]
struct LinkBody {
    block_id: String,
    key: Vec<u8>,
    inviter: [u8; 32],
}

impl ExternalInviteLink {
    pub fn new(block_id: ContentId, key: SymmetricKey, inviter: PeerId) -> Self {
        Self {
            block_id,
            key,
            inviter,
        }
    }

    /// Encode as `strand://invite/<base64url>`.
    pub fn encode(&self) -> String {
        let body = LinkBody {
            block_id: self.block_id.0.clone(),
            key: self.key.to_vec(),
            inviter: self.inviter.0,
        };
        // Serializing a String and a Vec<u8> into memory cannot fail.
        let bytes = bincode::serialize(&body).unwrap_or_default();
        format!("{INVITE_LINK_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Decode a link, with or without the scheme prefix.
    pub fn decode(link: &str) -> Result<Self, InviteLinkError> {
        let code = link.trim();
        let code = code.strip_prefix(INVITE_LINK_PREFIX).unwrap_or(code);
        let bytes = URL_SAFE_NO_PAD.decode(code)?;
        let body: LinkBody =
            bincode::deserialize(&bytes).map_err(|_| InviteLinkError::InvalidFormat)?;
        if body.block_id.is_empty() {
            return Err(InviteLinkError::InvalidFormat);
        }
        let key =
            symmetric_key_from_slice(&body.key).map_err(|_| InviteLinkError::InvalidKeyLength)?;
        Ok(Self {
            block_id: ContentId(body.block_id),
            key,
            inviter: PeerId(body.inviter),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_symmetric_key;

    #[test]
    fn test_link_roundtrip() {
        let link = ExternalInviteLink::new(
            ContentId::new("abc123"),
            generate_symmetric_key(),
            PeerId([7; 32]),
        );
        let encoded = link.encode();

        assert!(encoded.starts_with(INVITE_LINK_PREFIX));
        assert_eq!(ExternalInviteLink::decode(&encoded).unwrap(), link);

        let bare = encoded.trim_start_matches(INVITE_LINK_PREFIX);
        assert_eq!(ExternalInviteLink::decode(bare).unwrap(), link);
    }

    #[test]
    fn test_garbage_link_fails() {
        assert!(ExternalInviteLink::decode("strand://invite/!!!").is_err());
        assert!(ExternalInviteLink::decode("").is_err());
    }
}
