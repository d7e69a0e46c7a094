use tracing::{info, warn};

use strand_shared::protocol::BlockContent;
use strand_shared::ContentId;
use strand_store::models::CafeRequestType;

use super::Thread;
use crate::error::ThreadError;

impl Thread {
    /// Tell the other members we are leaving, then drop the thread locally
    /// and ask our cafes to drop their snapshot of it. The LEAVE is not made
    /// our head since the thread is gone afterwards.
    pub(crate) async fn leave(&self) -> Result<ContentId, ThreadError> {
        let _guard = self.lock.lock().await;

        let header = self.header()?;
        let committed = self.commit(header, BlockContent::Leave).await?;
        self.index(&committed.id, &committed.block)?;
        self.post(&committed.envelope, &[])?;
        self.backup_block(&committed.id).await;
        self.notify(&committed.id, &committed.block);

        self.ctx.db.purge_thread(&self.id)?;
        if let Err(e) = self
            .ctx
            .cafe_queue
            .put(&self.id.to_hex(), CafeRequestType::UnstoreThread)
            .await
        {
            warn!(thread = %self.id.short(), error = %e, "Failed to queue thread removal for cafes");
        }
        info!(thread = %self.id.short(), block = %committed.id.short(), "Left thread");
        Ok(committed.id)
    }
}
