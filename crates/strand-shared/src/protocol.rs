use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::identity::{verify_signature, Keypair};
use crate::types::{ContentId, PeerId, ThreadId};

/// Every message kind that can travel inside an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Ping,
    Pong,
    Error,

    ThreadInvite,
    ThreadExternalInvite,
    ThreadJoin,
    ThreadLeave,
    ThreadData,
    ThreadAnnotation,
    ThreadMerge,
    ThreadIgnore,

    CafeChallenge,
    CafeNonce,
    CafeRegistration,
    CafeSession,
    CafeRefreshSession,
    CafeStore,
    CafeObjectList,
    CafeBlock,
    CafeStoreThread,
    CafeStored,
    CafeUnstoreThread,
    CafeUnstored,

    /// Ask a peer for a content object by id.
    ContentRequest,
    ContentResponse,

    OfflineAck,
    Chat,
    Follow,
    Unfollow,
    ModeratorAdd,
    ModeratorRemove,
}

impl MessageType {
    pub const THREAD_BLOCKS: [MessageType; 8] = [
        MessageType::ThreadInvite,
        MessageType::ThreadExternalInvite,
        MessageType::ThreadJoin,
        MessageType::ThreadLeave,
        MessageType::ThreadData,
        MessageType::ThreadAnnotation,
        MessageType::ThreadMerge,
        MessageType::ThreadIgnore,
    ];

    pub fn is_thread_block(self) -> bool {
        Self::THREAD_BLOCKS.contains(&self)
    }

    /// Position in the deferred-message replay order. Lower replays first.
    pub fn replay_rank(self) -> u8 {
        match self {
            t if t.is_thread_block() => 0,
            MessageType::Chat => 1,
            MessageType::Follow | MessageType::Unfollow => 2,
            MessageType::ModeratorAdd | MessageType::ModeratorRemove => 3,
            MessageType::OfflineAck => 4,
            _ => 5,
        }
    }
}

/// A protocol message. `request_id` pairs a response with its request on a
/// shared stream; zero means no response is expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
    pub request_id: u32,
    pub is_response: bool,
}

impl Message {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            payload,
            request_id: 0,
            is_response: false,
        }
    }

    /// Build a message whose payload is the bincode form of `body`.
    pub fn encode<T: Serialize>(msg_type: MessageType, body: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(msg_type, bincode::serialize(body)?))
    }

    /// Build the response to a request carrying `request_id`.
    pub fn response<T: Serialize>(
        msg_type: MessageType,
        body: &T,
        request_id: u32,
    ) -> Result<Self, ProtocolError> {
        let mut message = Self::encode(msg_type, body)?;
        message.request_id = request_id;
        message.is_response = true;
        Ok(message)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Decode after checking the type tag.
    pub fn decode_as<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::UnexpectedType(self.msg_type));
        }
        self.decode()
    }
}

/// A signed wrapper around a [`Message`]. The signature covers the bincode
/// form of `message` only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message: Message,
    pub sender_pubkey: [u8; 32],
    pub signature: Vec<u8>,
}

impl Envelope {
    pub fn seal(keypair: &Keypair, message: Message) -> Result<Self, ProtocolError> {
        let signed = bincode::serialize(&message)?;
        let signature = keypair.sign(&signed).to_bytes().to_vec();
        Ok(Self {
            message,
            sender_pubkey: keypair.public_key_bytes(),
            signature,
        })
    }

    pub fn verify(&self) -> Result<(), ProtocolError> {
        let signed = bincode::serialize(&self.message)?;
        verify_signature(&self.sender_pubkey, &signed, &self.signature)
            .map_err(|_| ProtocolError::BadSignature)
    }

    pub fn sender(&self) -> PeerId {
        PeerId(self.sender_pubkey)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }

    /// Unpack a thread block carried by this envelope (no signature checks).
    pub fn thread_block(&self) -> Result<(SignedThreadBlock, ThreadBlock), ProtocolError> {
        if !self.message.msg_type.is_thread_block() {
            return Err(ProtocolError::UnexpectedType(self.message.msg_type));
        }
        let signed: SignedThreadBlock = self.message.decode()?;
        let block = signed.block()?;
        Ok((signed, block))
    }
}

// ---------------------------------------------------------------------------
// Thread blocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockType {
    Invite,
    ExternalInvite,
    Join,
    Leave,
    Data,
    Annotation,
    Merge,
    Ignore,
}

impl BlockType {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockType::Invite => "invite",
            BlockType::ExternalInvite => "external_invite",
            BlockType::Join => "join",
            BlockType::Leave => "leave",
            BlockType::Data => "data",
            BlockType::Annotation => "annotation",
            BlockType::Merge => "merge",
            BlockType::Ignore => "ignore",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invite" => Some(BlockType::Invite),
            "external_invite" => Some(BlockType::ExternalInvite),
            "join" => Some(BlockType::Join),
            "leave" => Some(BlockType::Leave),
            "data" => Some(BlockType::Data),
            "annotation" => Some(BlockType::Annotation),
            "merge" => Some(BlockType::Merge),
            "ignore" => Some(BlockType::Ignore),
            _ => None,
        }
    }

    pub fn message_type(self) -> MessageType {
        match self {
            BlockType::Invite => MessageType::ThreadInvite,
            BlockType::ExternalInvite => MessageType::ThreadExternalInvite,
            BlockType::Join => MessageType::ThreadJoin,
            BlockType::Leave => MessageType::ThreadLeave,
            BlockType::Data => MessageType::ThreadData,
            BlockType::Annotation => MessageType::ThreadAnnotation,
            BlockType::Merge => MessageType::ThreadMerge,
            BlockType::Ignore => MessageType::ThreadIgnore,
        }
    }
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub date: DateTime<Utc>,
    /// Empty for the first block of a thread.
    pub parents: Vec<ContentId>,
    pub thread_pubkey: [u8; 32],
    pub author_pubkey: [u8; 32],
    /// Author display name, encrypted with the thread key.
    pub author_name_cipher: Option<Vec<u8>>,
}

impl BlockHeader {
    pub fn thread_id(&self) -> ThreadId {
        ThreadId(self.thread_pubkey)
    }

    pub fn author(&self) -> PeerId {
        PeerId(self.author_pubkey)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnnotationKind {
    Comment,
    Like,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockContent {
    /// [`InviteSecret`] sealed to the invitee's public key.
    Invite {
        invite_cipher: Vec<u8>,
        invitee: PeerId,
    },
    /// [`InviteSecret`] encrypted with a one-off symmetric key shared out of
    /// band.
    ExternalInvite {
        invite_cipher: Vec<u8>,
    },
    Join {
        inviter: PeerId,
        invite_id: Option<ContentId>,
    },
    Leave,
    /// `key_cipher` is the data's symmetric key, encrypted with the thread key.
    Data {
        data_id: ContentId,
        key_cipher: Vec<u8>,
        caption_cipher: Option<Vec<u8>>,
    },
    Annotation {
        target: ContentId,
        kind: AnnotationKind,
        body_cipher: Option<Vec<u8>>,
    },
    Merge,
    Ignore {
        target: ContentId,
    },
}

impl BlockContent {
    pub fn block_type(&self) -> BlockType {
        match self {
            BlockContent::Invite { .. } => BlockType::Invite,
            BlockContent::ExternalInvite { .. } => BlockType::ExternalInvite,
            BlockContent::Join { .. } => BlockType::Join,
            BlockContent::Leave => BlockType::Leave,
            BlockContent::Data { .. } => BlockType::Data,
            BlockContent::Annotation { .. } => BlockType::Annotation,
            BlockContent::Merge => BlockType::Merge,
            BlockContent::Ignore { .. } => BlockType::Ignore,
        }
    }
}

/// The plaintext of an invite. It only ever travels encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteSecret {
    pub secret: Vec<u8>,
    pub name: String,
}

impl InviteSecret {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadBlock {
    pub header: BlockHeader,
    pub content: BlockContent,
}

/// A serialized [`ThreadBlock`] plus the thread key's signature over it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedThreadBlock {
    pub block: Vec<u8>,
    pub thread_sig: Vec<u8>,
}

impl SignedThreadBlock {
    pub fn sign(thread_key: &Keypair, block: &ThreadBlock) -> Result<Self, ProtocolError> {
        let bytes = bincode::serialize(block)?;
        let thread_sig = thread_key.sign(&bytes).to_bytes().to_vec();
        Ok(Self {
            block: bytes,
            thread_sig,
        })
    }

    pub fn block(&self) -> Result<ThreadBlock, ProtocolError> {
        Ok(bincode::deserialize(&self.block)?)
    }

    pub fn verify(&self, thread: &ThreadId) -> Result<(), ProtocolError> {
        verify_signature(&thread.0, &self.block, &self.thread_sig)
            .map_err(|_| ProtocolError::BadThreadSignature)
    }
}

// ---------------------------------------------------------------------------
// Cafe messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeChallenge {
    pub address: PeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeNonce {
    pub value: String,
}

/// Proof of address ownership: `sig` signs `value || nonce`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeRegistration {
    pub address: PeerId,
    pub value: String,
    pub nonce: String,
    pub sig: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CafeSessionGrant {
    pub cafe_id: PeerId,
    pub access: String,
    pub refresh: String,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeRefreshSession {
    pub access: String,
    pub refresh: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeStore {
    pub token: String,
    pub ids: Vec<ContentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeObjectList {
    pub ids: Vec<ContentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeBlock {
    pub token: String,
    pub id: ContentId,
    pub data: Vec<u8>,
}

/// Thread snapshot; every field is sealed to the owner's own public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeStoreThread {
    pub token: String,
    pub id: ThreadId,
    pub secret_cipher: Vec<u8>,
    pub head_cipher: Vec<u8>,
    pub name_cipher: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeStored {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeUnstoreThread {
    pub token: String,
    pub id: ThreadId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeUnstored {
    pub id: String,
}

// ---------------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRequest {
    pub id: ContentId,
}

/// `None` when the peer does not hold the object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentResponse {
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineAck {
    pub pointer_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block(thread: &Keypair, author: &Keypair) -> ThreadBlock {
        ThreadBlock {
            header: BlockHeader {
                date: Utc::now(),
                parents: vec![ContentId::new("parent")],
                thread_pubkey: thread.public_key_bytes(),
                author_pubkey: author.public_key_bytes(),
                author_name_cipher: None,
            },
            content: BlockContent::Leave,
        }
    }

    #[test]
    fn test_envelope_verifies() {
        let author = Keypair::generate();
        let env = Envelope::seal(&author, Message::new(MessageType::Ping, vec![])).unwrap();

        assert!(env.verify().is_ok());
        assert_eq!(env.sender(), author.peer_id());
    }

    #[test]
    fn test_envelope_rejects_tampered_message() {
        let author = Keypair::generate();
        let mut env = Envelope::seal(&author, Message::new(MessageType::Chat, vec![1, 2])).unwrap();
        env.message.payload.push(3);

        assert!(matches!(env.verify(), Err(ProtocolError::BadSignature)));
    }

    #[test]
    fn test_envelope_rejects_foreign_sender_key() {
        let author = Keypair::generate();
        let other = Keypair::generate();
        let mut env = Envelope::seal(&author, Message::new(MessageType::Ping, vec![])).unwrap();
        env.sender_pubkey = other.public_key_bytes();

        assert!(env.verify().is_err());
    }

    #[test]
    fn test_thread_signature_binds_thread_key() {
        let thread = Keypair::generate();
        let stranger = Keypair::generate();
        let author = Keypair::generate();

        let block = sample_block(&thread, &author);
        let signed = SignedThreadBlock::sign(&thread, &block).unwrap();
        assert!(signed.verify(&thread.thread_id()).is_ok());

        let forged = SignedThreadBlock::sign(&stranger, &block).unwrap();
        assert!(forged.verify(&thread.thread_id()).is_err());
    }

    #[test]
    fn test_thread_block_unpacks_from_envelope() {
        let thread = Keypair::generate();
        let author = Keypair::generate();
        let block = sample_block(&thread, &author);
        let signed = SignedThreadBlock::sign(&thread, &block).unwrap();

        let env = Envelope::seal(
            &author,
            Message::encode(MessageType::ThreadLeave, &signed).unwrap(),
        )
        .unwrap();
        let (_, decoded) = env.thread_block().unwrap();
        assert_eq!(decoded, block);

        let ping = Envelope::seal(&author, Message::new(MessageType::Ping, vec![])).unwrap();
        assert!(ping.thread_block().is_err());
    }

    #[test]
    fn test_replay_rank_orders_thread_blocks_first() {
        assert!(MessageType::ThreadData.replay_rank() < MessageType::Chat.replay_rank());
        assert!(MessageType::Chat.replay_rank() < MessageType::Follow.replay_rank());
        assert!(MessageType::Unfollow.replay_rank() < MessageType::ModeratorAdd.replay_rank());
        assert!(MessageType::ModeratorRemove.replay_rank() < MessageType::OfflineAck.replay_rank());
    }

    #[test]
    fn test_block_type_str_roundtrip() {
        for ty in [BlockType::Invite, BlockType::Join, BlockType::Merge, BlockType::Ignore] {
            assert_eq!(BlockType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(BlockType::parse("photo"), None);
    }
}
