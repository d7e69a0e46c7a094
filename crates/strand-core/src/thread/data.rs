use tracing::info;

use strand_shared::crypto::SymmetricKey;
use strand_shared::protocol::BlockContent;
use strand_shared::ContentId;

use super::Thread;
use crate::error::ThreadError;

impl Thread {
    /// Add a DATA block for content that is already in the content store,
    /// encrypted with `key`. The key travels encrypted with the thread key.
    pub async fn add_data(
        &self,
        data_id: ContentId,
        key: &SymmetricKey,
        caption: Option<&str>,
    ) -> Result<ContentId, ThreadError> {
        if data_id.is_empty() {
            return Err(ThreadError::InvalidTarget("empty data id".into()));
        }
        let _guard = self.lock.lock().await;

        let key_cipher = self.encrypt(key)?;
        let caption_cipher = caption.map(|c| self.encrypt(c.as_bytes())).transpose()?;
        let id = self
            .append(BlockContent::Data {
                data_id,
                key_cipher,
                caption_cipher,
            })
            .await?;

        info!(thread = %self.id.short(), block = %id.short(), "Added data");
        Ok(id)
    }

    /// Recover the content key of a DATA block.
    pub fn data_key(&self, block_id: &ContentId) -> Result<SymmetricKey, ThreadError> {
        let record = self.ctx.db.get_block(block_id)?;
        let cipher = record
            .key_cipher
            .ok_or_else(|| ThreadError::InvalidTarget(format!("{} is not a data block", block_id.short())))?;
        let plain = self.decrypt(&cipher)?;
        strand_shared::crypto::symmetric_key_from_slice(&plain).map_err(Into::into)
    }
}
