use tracing::info;

use strand_shared::crypto::{encrypt, generate_symmetric_key, seal};
use strand_shared::invite::ExternalInviteLink;
use strand_shared::protocol::{BlockContent, InviteSecret};
use strand_shared::{ContentId, PeerId};

use super::Thread;
use crate::error::ThreadError;

impl Thread {
    /// Invite `invitee` by sealing the thread secret and name to its key.
    /// The block goes to the invitee only and does not move our head.
    pub async fn add_invite(&self, invitee: PeerId) -> Result<ContentId, ThreadError> {
        let _guard = self.lock.lock().await;

        let invite_cipher = seal(&invitee.0, &self.invite_secret()?)?;
        let header = self.header()?;
        let committed = self
            .commit(header, BlockContent::Invite { invite_cipher, invitee })
            .await?;

        self.ctx.outbox.spawn_send(invitee, committed.envelope);
        self.backup_block(&committed.id).await;

        info!(thread = %self.id.short(), invitee = %invitee.short(), block = %committed.id.short(), "Invited peer");
        Ok(committed.id)
    }

    /// Create an invite anyone holding the returned link can accept. Like a
    /// direct invite it stays off the chain: it is committed, not indexed or
    /// posted.
    pub async fn add_external_invite(&self) -> Result<ExternalInviteLink, ThreadError> {
        let _guard = self.lock.lock().await;

        let key = generate_symmetric_key();
        let invite_cipher = encrypt(&key, &self.invite_secret()?)?;
        let header = self.header()?;
        let committed = self
            .commit(header, BlockContent::ExternalInvite { invite_cipher })
            .await?;
        self.backup_block(&committed.id).await;

        info!(thread = %self.id.short(), block = %committed.id.short(), "Created external invite");
        Ok(ExternalInviteLink::new(committed.id, key, self.local_peer()))
    }

    fn invite_secret(&self) -> Result<Vec<u8>, ThreadError> {
        let invite = InviteSecret {
            secret: self.secret().to_vec(),
            name: self.name.clone(),
        };
        Ok(invite.to_bytes()?)
    }
}
