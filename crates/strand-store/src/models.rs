//! Domain model structs persisted in the local SQLite database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use strand_shared::protocol::BlockType;
use strand_shared::{ContentId, PeerId, ThreadId};

pub use strand_shared::pointer::Pointer;

// ---------------------------------------------------------------------------
// Thread
// ---------------------------------------------------------------------------

/// A thread this node is a member of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub id: ThreadId,
    pub name: String,
    /// Thread secret key (32 bytes), shared by all members.
    pub secret: [u8; 32],
    /// Latest applied block, `None` for a thread with no blocks yet.
    pub head: Option<ContentId>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// Local index entry for an applied thread block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub id: ContentId,
    pub thread_id: ThreadId,
    pub author_id: PeerId,
    pub block_type: BlockType,
    pub date: DateTime<Utc>,
    pub parents: Vec<ContentId>,
    /// DATA: data id. ANNOTATION and IGNORE: target block id.
    pub target: Option<ContentId>,
    /// DATA: thread-key-encrypted data key.
    pub key_cipher: Option<Vec<u8>>,
    /// DATA caption or ANNOTATION body, thread-key-encrypted.
    pub body_cipher: Option<Vec<u8>>,
    pub author_name_cipher: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Thread peer
// ---------------------------------------------------------------------------

/// Membership record: `id` is a member of `thread_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadPeer {
    pub id: PeerId,
    pub thread_id: ThreadId,
    /// Whether the current head has been pushed to this peer.
    pub welcomed: bool,
    pub added_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Pending invite
// ---------------------------------------------------------------------------

/// A received INVITE that has not been accepted or ignored yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInvite {
    pub id: ContentId,
    pub thread_id: ThreadId,
    pub name: String,
    pub inviter: PeerId,
    pub date: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Offline message
// ---------------------------------------------------------------------------

/// An inbound message fetched through a pointer. With `envelope` set it is
/// deferred and waits for replay; without, it only marks `addr` as delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineMessage {
    pub addr: ContentId,
    pub date: DateTime<Utc>,
    pub envelope: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Cafe request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CafeRequestType {
    StoreBlock,
    StoreThread,
    /// Drop the cafe's snapshot of a thread we left.
    UnstoreThread,
}

impl CafeRequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            CafeRequestType::StoreBlock => "store_block",
            CafeRequestType::StoreThread => "store_thread",
            CafeRequestType::UnstoreThread => "unstore_thread",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "store_block" => Some(CafeRequestType::StoreBlock),
            "store_thread" => Some(CafeRequestType::StoreThread),
            "unstore_thread" => Some(CafeRequestType::UnstoreThread),
            _ => None,
        }
    }
}

/// "Ensure `target_id` is stored at `cafe_id`."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CafeRequest {
    pub id: Uuid,
    pub target_id: String,
    pub cafe_id: PeerId,
    pub request_type: CafeRequestType,
    pub date: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Cafe session / client
// ---------------------------------------------------------------------------

/// Tokens issued to this node by a cafe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CafeSession {
    pub cafe_id: PeerId,
    pub access: String,
    pub refresh: String,
    pub expiry: DateTime<Utc>,
}

/// A peer registered with this node acting as a cafe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CafeClient {
    pub id: PeerId,
    pub access: String,
    pub refresh: String,
    pub expiry: DateTime<Utc>,
}

/// A thread snapshot stored on behalf of a client. All fields are sealed to
/// the client's key; the host cannot read them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CafeClientThread {
    pub id: ThreadId,
    pub client_id: PeerId,
    pub secret_cipher: Vec<u8>,
    pub head_cipher: Vec<u8>,
    pub name_cipher: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Contact
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: PeerId,
    pub last_seen: DateTime<Utc>,
}
