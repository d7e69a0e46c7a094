//! Inbound blocks and parent back-propagation.
//!
//! Unknown ancestors are fetched (locally, then from the peers that authored
//! the blocks we are following) and applied oldest-first before the child.
//! Only the arriving tip moves the head; ancestors are indexed, nothing more.

use std::collections::HashSet;

use tracing::{debug, info};

use strand_shared::protocol::{BlockContent, BlockType, Envelope, ThreadBlock};
use strand_shared::{ContentId, PeerId};

use super::Thread;
use crate::error::ThreadError;

enum Frame {
    Visit(ContentId),
    Apply(ContentId, Box<ThreadBlock>),
}

#[derive(Debug, Default)]
pub(crate) struct Applied {
    pub new: bool,
    pub new_peer: Option<PeerId>,
}

impl Thread {
    /// Decode the thread block in `envelope` and check it belongs here: the
    /// header names this thread, the author signed the envelope, and the
    /// thread key signed the block.
    pub(crate) fn check_block(&self, envelope: &Envelope) -> Result<ThreadBlock, ThreadError> {
        let (signed, block) = envelope.thread_block()?;
        if block.header.thread_id() != self.id {
            return Err(ThreadError::InvalidBlock(format!(
                "block belongs to thread {}",
                block.header.thread_id().short()
            )));
        }
        if block.header.author() != envelope.sender() {
            return Err(ThreadError::InvalidBlock("author does not match envelope sender".into()));
        }
        signed.verify(&self.id)?;
        Ok(block)
    }

    /// Apply a block received from a peer. Re-delivery of an indexed block
    /// is a no-op. Caller must not hold the thread lock.
    pub async fn handle_block(&self, envelope: Envelope) -> Result<(), ThreadError> {
        let block = self.check_block(&envelope)?;
        let _guard = self.lock.lock().await;

        let id = self.ctx.content.put(&envelope.to_bytes()?).await?;
        if self.ctx.db.has_block(&id)? {
            debug!(thread = %self.id.short(), block = %id.short(), "Block already indexed");
            return Ok(());
        }
        self.ctx.content.pin(&id, true).await?;

        let author = block.header.author();
        let discovered = self.follow_parents(&block.header.parents, &[author]).await?;
        let applied = self.apply(&id, &block).await?;
        if !applied.new {
            return Ok(());
        }
        let head = self.update_head(&id).await?;

        info!(
            thread = %self.id.short(),
            block = %id.short(),
            block_type = %block.content.block_type(),
            author = %author.short(),
            head = %head.short(),
            "Applied block"
        );

        let mut welcome: Vec<PeerId> = discovered.into_iter().filter(|p| *p != author).collect();
        if let BlockContent::Join { inviter, .. } = &block.content {
            if *inviter == self.local_peer() && head != id {
                welcome.push(author);
            }
        }
        if !welcome.is_empty() {
            self.welcome(&welcome).await?;
        }
        Ok(())
    }

    /// Fetch and apply every ancestor of `parents` that is not indexed yet,
    /// parents before children. Returns the peers first seen on the way.
    pub(crate) async fn follow_parents(
        &self,
        parents: &[ContentId],
        hints: &[PeerId],
    ) -> Result<Vec<PeerId>, ThreadError> {
        let mut hints = hints.to_vec();
        let mut discovered = Vec::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<Frame> = parents.iter().rev().cloned().map(Frame::Visit).collect();

        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Visit(id) => {
                    if id.is_empty() || !seen.insert(id.clone()) || self.ctx.db.has_block(&id)? {
                        continue;
                    }
                    let bytes = self.ctx.fetcher.fetch(&id, &hints).await.map_err(|e| {
                        debug!(thread = %self.id.short(), block = %id.short(), error = %e, "Parent unavailable");
                        ThreadError::MissingParent(id.clone())
                    })?;
                    let envelope = Envelope::from_bytes(&bytes)?;
                    envelope.verify()?;
                    let block = self.check_block(&envelope)?;
                    self.ctx.content.pin(&id, true).await?;

                    let author = block.header.author();
                    if !hints.contains(&author) {
                        hints.push(author);
                    }
                    let grandparents = block.header.parents.clone();
                    stack.push(Frame::Apply(id, Box::new(block)));
                    stack.extend(grandparents.into_iter().rev().map(Frame::Visit));
                }
                Frame::Apply(id, block) => {
                    debug!(thread = %self.id.short(), block = %id.short(), "Applying ancestor");
                    if let Some(peer) = self.apply(&id, &block).await?.new_peer {
                        discovered.push(peer);
                    }
                }
            }
        }
        Ok(discovered)
    }

    /// Index a block and run its side effects. Invite blocks are delivered
    /// out of band and never indexed.
    pub(crate) async fn apply(&self, id: &ContentId, block: &ThreadBlock) -> Result<Applied, ThreadError> {
        if matches!(block.content.block_type(), BlockType::Invite | BlockType::ExternalInvite) {
            return Ok(Applied::default());
        }
        if !self.index(id, block)? {
            return Ok(Applied::default());
        }

        let author = block.header.author();
        let mut new_peer = None;
        match &block.content {
            BlockContent::Leave => {
                self.ctx.db.remove_thread_peer(&self.id, &author)?;
            }
            other => {
                if let BlockContent::Ignore { target } = other {
                    self.release_ignored(target).await;
                }
                if author != self.local_peer() && self.ctx.db.add_thread_peer(&self.id, &author)? {
                    new_peer = Some(author);
                }
            }
        }

        self.notify(id, block);
        Ok(Applied { new: true, new_peer })
    }
}
