use tracing::{debug, info, warn};

use strand_shared::protocol::{BlockContent, BlockType};
use strand_shared::ContentId;
use strand_store::StoreError;

use super::Thread;
use crate::error::ThreadError;

impl Thread {
    /// Hide an earlier block. Listing skips ignored blocks, and the data of
    /// an ignored DATA block is unpinned locally.
    pub async fn ignore(&self, target: &ContentId) -> Result<ContentId, ThreadError> {
        let _guard = self.lock.lock().await;

        match self.ctx.db.get_block(target) {
            Ok(record) if record.thread_id == self.id => {}
            Ok(_) | Err(StoreError::NotFound) => {
                return Err(ThreadError::InvalidTarget(format!("unknown block {}", target.short())))
            }
            Err(e) => return Err(e.into()),
        }

        let id = self
            .append(BlockContent::Ignore {
                target: target.clone(),
            })
            .await?;
        self.release_ignored(target).await;

        info!(thread = %self.id.short(), block = %id.short(), target = %target.short(), "Ignored block");
        Ok(id)
    }

    /// Unpin the data behind an ignored DATA block.
    pub(crate) async fn release_ignored(&self, target: &ContentId) {
        let record = match self.ctx.db.get_block(target) {
            Ok(record) => record,
            Err(e) => {
                debug!(target = %target.short(), error = %e, "Ignored block not indexed");
                return;
            }
        };
        if record.block_type != BlockType::Data {
            return;
        }
        if let Some(data_id) = record.target {
            if let Err(e) = self.ctx.content.unpin(&data_id).await {
                warn!(data = %data_id.short(), error = %e, "Failed to unpin ignored data");
            }
        }
    }
}
