use tracing::info;

use strand_shared::protocol::BlockContent;
use strand_shared::{ContentId, PeerId};

use super::Thread;
use crate::error::ThreadError;

impl Thread {
    /// Announce our membership. The inviter becomes a peer first so the
    /// JOIN reaches them.
    pub(crate) async fn join(&self, inviter: PeerId, invite_id: Option<ContentId>) -> Result<ContentId, ThreadError> {
        let _guard = self.lock.lock().await;

        if inviter != self.local_peer() {
            self.ctx.db.add_thread_peer(&self.id, &inviter)?;
        }
        let id = self.append(BlockContent::Join { inviter, invite_id }).await?;

        info!(thread = %self.id.short(), inviter = %inviter.short(), block = %id.short(), "Joined thread");
        Ok(id)
    }
}

impl Thread {
    /// Seed a freshly materialized thread with the history behind an invite
    /// and point the head at its first parent.
    pub(crate) async fn adopt(&self, parents: &[ContentId], inviter: PeerId) -> Result<(), ThreadError> {
        let _guard = self.lock.lock().await;

        self.follow_parents(parents, &[inviter]).await?;
        if let Some(first) = parents.iter().find(|p| !p.is_empty()) {
            self.set_head(first)?;
        }
        Ok(())
    }
}
