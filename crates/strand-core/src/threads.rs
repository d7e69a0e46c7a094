//! The set of threads this node belongs to, and the entry point for
//! inbound thread blocks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use strand_net::{Handler, HandlerError};
use strand_shared::crypto::decrypt;
use strand_shared::invite::ExternalInviteLink;
use strand_shared::protocol::{BlockContent, Envelope, InviteSecret, Message, MessageType, ThreadBlock};
use strand_shared::{ContentId, Keypair, PeerId, ThreadId};
use strand_store::models::ThreadInvite;
use strand_store::threads::new_thread_record;

use crate::error::ThreadError;
use crate::thread::{Thread, ThreadContext};

pub struct Threads {
    ctx: Arc<ThreadContext>,
    threads: RwLock<HashMap<ThreadId, Arc<Thread>>>,
}

impl Threads {
    /// Open every thread recorded in the database.
    pub fn load(ctx: Arc<ThreadContext>) -> Result<Self, ThreadError> {
        let mut threads = HashMap::new();
        for record in ctx.db.list_threads()? {
            threads.insert(record.id, Arc::new(Thread::new(&record, ctx.clone())?));
        }
        info!(count = threads.len(), "Loaded threads");
        Ok(Self {
            ctx,
            threads: RwLock::new(threads),
        })
    }

    pub fn context(&self) -> &Arc<ThreadContext> {
        &self.ctx
    }

    /// Create a thread with a fresh key. Its genesis block is our own JOIN.
    pub async fn create_thread(&self, name: &str) -> Result<Arc<Thread>, ThreadError> {
        let key = Keypair::generate();
        let thread = self.materialize(&key, name)?;
        thread.join(self.local_peer(), None).await?;

        info!(thread = %thread.id().short(), name = %name, "Created thread");
        Ok(thread)
    }

    pub fn get(&self, id: &ThreadId) -> Option<Arc<Thread>> {
        self.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Thread>> {
        let mut threads: Vec<_> = self.read().values().cloned().collect();
        threads.sort_by(|a, b| a.name().cmp(b.name()).then(a.id().cmp(&b.id())));
        threads
    }

    /// Invites received and not yet accepted or ignored, newest first.
    pub fn invites(&self) -> Result<Vec<ThreadInvite>, ThreadError> {
        Ok(self.ctx.db.list_invites()?)
    }

    /// Accept a pending invite: recover the thread key, pull the history the
    /// inviter had, and announce ourselves with a JOIN.
    pub async fn accept_invite(&self, invite_id: &ContentId) -> Result<Arc<Thread>, ThreadError> {
        let pending = self.ctx.db.get_invite(invite_id)?;
        let (envelope, block) = self.fetch_invite(invite_id, pending.inviter).await?;

        let BlockContent::Invite { invite_cipher, invitee } = &block.content else {
            return Err(ThreadError::InvalidBlock("not an invite block".into()));
        };
        if *invitee != self.local_peer() {
            return Err(ThreadError::NotInvitee);
        }
        let invite = InviteSecret::from_bytes(&self.ctx.identity.open(invite_cipher)?)?;
        let key = Keypair::from_secret_slice(&invite.secret)?;
        check_thread_key(&key, &envelope, &block)?;

        let inviter = block.header.author();
        let thread = self
            .bootstrap(&key, &invite.name, &block.header.parents, inviter, invite_id)
            .await?;
        self.ctx.db.delete_invite(invite_id)?;
        Ok(thread)
    }

    /// Accept an external invite link.
    pub async fn accept_external_invite(&self, link: &ExternalInviteLink) -> Result<Arc<Thread>, ThreadError> {
        let (envelope, block) = self.fetch_invite(&link.block_id, link.inviter).await?;

        let BlockContent::ExternalInvite { invite_cipher } = &block.content else {
            return Err(ThreadError::InvalidBlock("not an external invite block".into()));
        };
        let invite = InviteSecret::from_bytes(&decrypt(&link.key, invite_cipher)?)?;
        let key = Keypair::from_secret_slice(&invite.secret)?;
        check_thread_key(&key, &envelope, &block)?;

        self.bootstrap(
            &key,
            &invite.name,
            &block.header.parents,
            block.header.author(),
            &link.block_id,
        )
        .await
    }

    /// Drop a pending invite without joining.
    pub async fn ignore_invite(&self, invite_id: &ContentId) -> Result<(), ThreadError> {
        if !self.ctx.db.delete_invite(invite_id)? {
            return Err(strand_store::StoreError::NotFound.into());
        }
        if let Err(e) = self.ctx.content.unpin(invite_id).await {
            debug!(invite = %invite_id.short(), error = %e, "Invite block was not pinned");
        }
        info!(invite = %invite_id.short(), "Ignored invite");
        Ok(())
    }

    /// Leave a thread and forget it locally.
    pub async fn leave(&self, id: &ThreadId) -> Result<ContentId, ThreadError> {
        let thread = self.get(id).ok_or(ThreadError::UnknownThread(*id))?;
        let block = thread.leave().await?;
        self.write().remove(id);
        Ok(block)
    }

    /// Route an inbound thread block to its thread, or record it as a
    /// pending invite.
    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<(), ThreadError> {
        let (_, block) = envelope.thread_block()?;
        if block.content.block_type().message_type() != envelope.message.msg_type {
            return Err(ThreadError::InvalidBlock("message type does not match block type".into()));
        }
        match block.content {
            BlockContent::Invite { .. } => return self.handle_invite(envelope, block).await,
            BlockContent::ExternalInvite { .. } => {
                return Err(ThreadError::InvalidBlock("external invites are fetched, not sent".into()))
            }
            _ => {}
        }

        let thread_id = block.header.thread_id();
        let thread = self.get(&thread_id).ok_or(ThreadError::UnknownThread(thread_id))?;
        thread.handle_block(envelope).await
    }

    async fn handle_invite(&self, envelope: Envelope, block: ThreadBlock) -> Result<(), ThreadError> {
        let BlockContent::Invite { invite_cipher, invitee } = block.content else {
            return Err(ThreadError::InvalidBlock("not an invite block".into()));
        };
        if invitee != self.local_peer() {
            return Err(ThreadError::NotInvitee);
        }
        let inviter = envelope.sender();
        if block.header.author() != inviter {
            return Err(ThreadError::InvalidBlock("author does not match envelope sender".into()));
        }
        let thread_id = block.header.thread_id();
        if self.get(&thread_id).is_some() {
            debug!(thread = %thread_id.short(), "Invite for a thread we already belong to");
            return Ok(());
        }
        let name = InviteSecret::from_bytes(&self.ctx.identity.open(&invite_cipher)?)?.name;

        let id = self.ctx.content.put(&envelope.to_bytes()?).await?;
        self.ctx.content.pin(&id, true).await?;
        let invite = ThreadInvite {
            id: id.clone(),
            thread_id,
            name,
            inviter,
            date: block.header.date,
        };
        if self.ctx.db.insert_invite(&invite)? {
            info!(thread = %thread_id.short(), inviter = %inviter.short(), invite = %id.short(), "Received invite");
        }
        Ok(())
    }

    async fn fetch_invite(&self, id: &ContentId, inviter: PeerId) -> Result<(Envelope, ThreadBlock), ThreadError> {
        let bytes = self
            .ctx
            .fetcher
            .fetch(id, &[inviter])
            .await
            .map_err(|_| ThreadError::MissingParent(id.clone()))?;
        let envelope = Envelope::from_bytes(&bytes)?;
        envelope.verify()?;
        let (_, block) = envelope.thread_block()?;
        if block.header.author() != envelope.sender() {
            return Err(ThreadError::InvalidBlock("author does not match envelope sender".into()));
        }
        Ok((envelope, block))
    }

    /// Materialize the thread, adopt the history behind the invite, and
    /// JOIN. A failure leaves no trace of the thread.
    async fn bootstrap(
        &self,
        key: &Keypair,
        name: &str,
        parents: &[ContentId],
        inviter: PeerId,
        invite_id: &ContentId,
    ) -> Result<Arc<Thread>, ThreadError> {
        if let Some(existing) = self.get(&key.thread_id()) {
            return Ok(existing);
        }
        let thread = self.materialize(key, name)?;

        let joined = async {
            thread.adopt(parents, inviter).await?;
            thread.join(inviter, Some(invite_id.clone())).await
        }
        .await;
        if let Err(e) = joined {
            warn!(thread = %thread.id().short(), error = %e, "Failed to join thread, discarding it");
            self.write().remove(&thread.id());
            self.ctx.db.purge_thread(&thread.id())?;
            return Err(e);
        }
        Ok(thread)
    }

    fn materialize(&self, key: &Keypair, name: &str) -> Result<Arc<Thread>, ThreadError> {
        let record = new_thread_record(key.thread_id(), name, *key.secret_bytes());
        self.ctx.db.insert_thread(&record)?;
        let thread = Arc::new(Thread::new(&record, self.ctx.clone())?);
        self.write().insert(record.id, thread.clone());
        Ok(thread)
    }

    fn local_peer(&self) -> PeerId {
        self.ctx.identity.peer_id()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ThreadId, Arc<Thread>>> {
        self.threads.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ThreadId, Arc<Thread>>> {
        self.threads.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// The recovered key must be the thread's key, and must have signed the
/// invite block itself.
fn check_thread_key(key: &Keypair, envelope: &Envelope, block: &ThreadBlock) -> Result<(), ThreadError> {
    if key.thread_id() != block.header.thread_id() {
        return Err(ThreadError::InvalidBlock("invite secret does not match thread".into()));
    }
    let (signed, _) = envelope.thread_block()?;
    signed.verify(&key.thread_id())?;
    Ok(())
}

/// Serves every thread block message type.
pub struct ThreadsHandler(pub Arc<Threads>);

#[async_trait]
impl Handler for ThreadsHandler {
    async fn handle(&self, from: PeerId, envelope: Envelope) -> Result<Option<Message>, HandlerError> {
        let msg_type: MessageType = envelope.message.msg_type;
        debug!(peer = %from.short(), msg_type = ?msg_type, "Thread block received");
        self.0.handle_envelope(envelope).await?;
        Ok(None)
    }
}
