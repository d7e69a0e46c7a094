//! A single thread: an encrypted, multi-writer block DAG.
//!
//! Every local mutation and every inbound block for one thread runs under the
//! thread's mutex, so `head` only ever moves from one applied block to the
//! next. Per-type operations live in the sibling modules.

mod annotations;
mod data;
mod follow;
mod ignores;
mod invites;
mod joins;
mod leaves;
mod merges;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use strand_shared::crypto::{decrypt, encrypt, SymmetricKey};
use strand_shared::protocol::{
    BlockContent, BlockHeader, Envelope, Message, SignedThreadBlock, ThreadBlock,
};
use strand_shared::{ContentId, Keypair, PeerId, ThreadId};
use strand_store::models::{BlockRecord, CafeRequestType, ThreadPeer, ThreadRecord};
use strand_store::{ContentStore, Database};

use crate::cafe::CafeRequestQueue;
use crate::error::ThreadError;
use crate::fetch::ContentFetcher;
use crate::outbox::Outbox;
use crate::updates::{ThreadUpdate, UpdateBus};

pub use merges::{is_ancestor, DefaultMergePolicy, HeadDecision, MergePolicy};

const THREAD_CIPHER_CONTEXT: &str = "strand-thread-cipher-v1";

/// Collaborators shared by every thread on a node.
pub struct ThreadContext {
    pub identity: Arc<Keypair>,
    pub db: Arc<Database>,
    pub content: Arc<dyn ContentStore>,
    pub fetcher: Arc<ContentFetcher>,
    pub outbox: Arc<Outbox>,
    pub cafe_queue: Arc<CafeRequestQueue>,
    pub updates: Arc<UpdateBus>,
    pub merge_policy: Arc<dyn MergePolicy>,
    /// Display name placed (encrypted) in every header we author.
    pub username: Option<String>,
}

pub struct Thread {
    id: ThreadId,
    name: String,
    key: Keypair,
    cipher: SymmetricKey,
    lock: Mutex<()>,
    ctx: Arc<ThreadContext>,
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread").field("id", &self.id).field("name", &self.name).finish_non_exhaustive()
    }
}

/// A block that has been signed and written to the content store.
pub(crate) struct Committed {
    pub id: ContentId,
    pub envelope: Envelope,
    pub block: ThreadBlock,
}

impl Thread {
    pub(crate) fn new(record: &ThreadRecord, ctx: Arc<ThreadContext>) -> Result<Self, ThreadError> {
        let key = Keypair::from_secret_bytes(&record.secret);
        if key.thread_id() != record.id {
            return Err(ThreadError::InvalidBlock(format!(
                "thread secret does not match thread {}",
                record.id.short()
            )));
        }
        let cipher = blake3::derive_key(THREAD_CIPHER_CONTEXT, key.secret_bytes());
        Ok(Self {
            id: record.id,
            name: record.name.clone(),
            key,
            cipher,
            lock: Mutex::new(()),
            ctx,
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn head(&self) -> Result<Option<ContentId>, ThreadError> {
        Ok(self.ctx.db.get_thread(&self.id)?.head)
    }

    pub fn peers(&self) -> Result<Vec<ThreadPeer>, ThreadError> {
        Ok(self.ctx.db.list_thread_peers(&self.id)?)
    }

    pub fn blocks(&self, offset: u32, limit: u32) -> Result<Vec<BlockRecord>, ThreadError> {
        Ok(self.ctx.db.list_blocks(&self.id, offset, limit)?)
    }

    /// Encrypt with the thread key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, ThreadError> {
        Ok(encrypt(&self.cipher, plaintext)?)
    }

    /// Decrypt something encrypted with the thread key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ThreadError> {
        Ok(decrypt(&self.cipher, ciphertext)?)
    }

    pub fn author_name(&self, block: &BlockRecord) -> Option<String> {
        let cipher = block.author_name_cipher.as_ref()?;
        let plain = self.decrypt(cipher).ok()?;
        String::from_utf8(plain).ok()
    }

    pub(crate) fn secret(&self) -> &[u8; 32] {
        self.key.secret_bytes()
    }

    fn local_peer(&self) -> PeerId {
        self.ctx.identity.peer_id()
    }

    /// Header for a block we author, parented on the current head.
    pub(crate) fn header(&self) -> Result<BlockHeader, ThreadError> {
        let parents = self.head()?.into_iter().collect();
        self.header_with(parents, Utc::now())
    }

    pub(crate) fn header_with(
        &self,
        parents: Vec<ContentId>,
        date: DateTime<Utc>,
    ) -> Result<BlockHeader, ThreadError> {
        let author_name_cipher = match self.ctx.username.as_deref() {
            Some(name) if !name.is_empty() => Some(self.encrypt(name.as_bytes())?),
            _ => None,
        };
        Ok(BlockHeader {
            date,
            parents,
            thread_pubkey: self.key.public_key_bytes(),
            author_pubkey: self.ctx.identity.public_key_bytes(),
            author_name_cipher,
        })
    }

    /// Sign with the thread key, wrap in an envelope signed by us, and write
    /// the envelope to the content store. Its content id is the block id.
    pub(crate) async fn commit(
        &self,
        header: BlockHeader,
        content: BlockContent,
    ) -> Result<Committed, ThreadError> {
        let block = ThreadBlock { header, content };
        let signed = SignedThreadBlock::sign(&self.key, &block)?;
        let message = Message::encode(block.content.block_type().message_type(), &signed)?;
        let envelope = Envelope::seal(&self.ctx.identity, message)?;

        let id = self.ctx.content.put(&envelope.to_bytes()?).await?;
        self.ctx.content.pin(&id, true).await?;
        debug!(thread = %self.id.short(), block = %id.short(), block_type = %block.content.block_type(), "Committed block");

        Ok(Committed { id, envelope, block })
    }

    /// Add a block to the local index. Returns false when already indexed.
    pub(crate) fn index(&self, id: &ContentId, block: &ThreadBlock) -> Result<bool, ThreadError> {
        let (target, key_cipher, body_cipher) = match &block.content {
            BlockContent::Data {
                data_id,
                key_cipher,
                caption_cipher,
            } => (Some(data_id.clone()), Some(key_cipher.clone()), caption_cipher.clone()),
            BlockContent::Annotation {
                target, body_cipher, ..
            } => (Some(target.clone()), None, body_cipher.clone()),
            BlockContent::Ignore { target } => (Some(target.clone()), None, None),
            _ => (None, None, None),
        };

        let record = BlockRecord {
            id: id.clone(),
            thread_id: self.id,
            author_id: block.header.author(),
            block_type: block.content.block_type(),
            date: block.header.date,
            parents: block.header.parents.clone(),
            target,
            key_cipher,
            body_cipher,
            author_name_cipher: block.header.author_name_cipher.clone(),
        };
        Ok(self.ctx.db.insert_block(&record)?)
    }

    pub(crate) fn set_head(&self, id: &ContentId) -> Result<(), ThreadError> {
        self.ctx.db.update_thread_head(&self.id, id)?;
        debug!(thread = %self.id.short(), head = %id.short(), "Head updated");
        Ok(())
    }

    /// Send `envelope` to every thread peer except us and `skip`.
    pub(crate) fn post(&self, envelope: &Envelope, skip: &[PeerId]) -> Result<usize, ThreadError> {
        let local = self.local_peer();
        let mut sent = 0;
        for peer in self.ctx.db.list_thread_peers(&self.id)? {
            if peer.id == local || skip.contains(&peer.id) {
                continue;
            }
            self.ctx.outbox.spawn_send(peer.id, envelope.clone());
            sent += 1;
        }
        Ok(sent)
    }

    /// Queue the block and a fresh thread snapshot for every cafe session.
    /// Failures only delay cafe backup, so they are logged.
    pub(crate) async fn backup(&self, id: &ContentId) {
        self.backup_block(id).await;
        if let Err(e) = self
            .ctx
            .cafe_queue
            .put(&self.id.to_hex(), CafeRequestType::StoreThread)
            .await
        {
            warn!(thread = %self.id.short(), error = %e, "Failed to queue thread for cafes");
        }
    }

    pub(crate) async fn backup_block(&self, id: &ContentId) {
        if let Err(e) = self.ctx.cafe_queue.put(id.as_str(), CafeRequestType::StoreBlock).await {
            warn!(block = %id.short(), error = %e, "Failed to queue block for cafes");
        }
    }

    pub(crate) fn notify(&self, id: &ContentId, block: &ThreadBlock) {
        self.ctx.updates.publish(ThreadUpdate {
            block_id: id.clone(),
            thread_id: self.id,
            block_type: block.content.block_type(),
            author: block.header.author(),
        });
    }

    /// The common tail of a local mutation: index, move head, fan out,
    /// queue for cafes, notify.
    pub(crate) async fn append(&self, content: BlockContent) -> Result<ContentId, ThreadError> {
        let header = self.header()?;
        let committed = self.commit(header, content).await?;
        self.index(&committed.id, &committed.block)?;
        self.set_head(&committed.id)?;
        self.post(&committed.envelope, &[])?;
        self.backup(&committed.id).await;
        self.notify(&committed.id, &committed.block);
        Ok(committed.id)
    }

    /// Push the current head to `peers` so they converge without waiting for
    /// the next block.
    pub(crate) async fn welcome(&self, peers: &[PeerId]) -> Result<(), ThreadError> {
        let Some(head) = self.head()? else {
            return Ok(());
        };
        let local = self.local_peer();
        let targets: Vec<PeerId> = peers.iter().copied().filter(|p| *p != local).collect();
        if targets.is_empty() {
            return Ok(());
        }

        let envelope = Envelope::from_bytes(&self.ctx.content.get(&head).await?)?;
        for peer in targets {
            debug!(thread = %self.id.short(), peer = %peer.short(), head = %head.short(), "Welcoming peer");
            self.ctx.outbox.spawn_send(peer, envelope.clone());
            self.ctx.db.set_thread_peer_welcomed(&self.id, &peer)?;
        }
        Ok(())
    }
}
