use tracing::info;

use strand_shared::protocol::{AnnotationKind, BlockContent, BlockType};
use strand_shared::ContentId;
use strand_store::models::BlockRecord;
use strand_store::StoreError;

use super::Thread;
use crate::error::ThreadError;

impl Thread {
    pub async fn add_comment(&self, target: &ContentId, body: &str) -> Result<ContentId, ThreadError> {
        self.annotate(target, AnnotationKind::Comment, Some(body)).await
    }

    pub async fn add_like(&self, target: &ContentId) -> Result<ContentId, ThreadError> {
        self.annotate(target, AnnotationKind::Like, None).await
    }

    /// Annotations on a DATA block, oldest first.
    pub fn annotations(&self, target: &ContentId) -> Result<Vec<BlockRecord>, ThreadError> {
        Ok(self
            .ctx
            .db
            .list_blocks_for_target(target, BlockType::Annotation)?
            .into_iter()
            .filter(|b| b.thread_id == self.id)
            .collect())
    }

    async fn annotate(
        &self,
        target: &ContentId,
        kind: AnnotationKind,
        body: Option<&str>,
    ) -> Result<ContentId, ThreadError> {
        let _guard = self.lock.lock().await;

        match self.ctx.db.get_block(target) {
            Ok(record) if record.thread_id == self.id && record.block_type == BlockType::Data => {}
            Ok(_) => {
                return Err(ThreadError::InvalidTarget(format!(
                    "{} is not a data block in this thread",
                    target.short()
                )))
            }
            Err(StoreError::NotFound) => {
                return Err(ThreadError::InvalidTarget(format!("unknown block {}", target.short())))
            }
            Err(e) => return Err(e.into()),
        }

        let body_cipher = body.map(|b| self.encrypt(b.as_bytes())).transpose()?;
        let id = self
            .append(BlockContent::Annotation {
                target: target.clone(),
                kind,
                body_cipher,
            })
            .await?;

        info!(thread = %self.id.short(), block = %id.short(), kind = ?kind, "Added annotation");
        Ok(id)
    }
}
