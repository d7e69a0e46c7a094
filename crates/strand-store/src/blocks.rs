//! Local block index.

use rusqlite::{params, OptionalExtension};

use strand_shared::protocol::BlockType;
use strand_shared::{ContentId, PeerId, ThreadId};

use crate::database::{conversion_error, not_found, parse_key, parse_timestamp, Database};
use crate::error::Result;
use crate::models::BlockRecord;

const COLUMNS: &str = "id, thread_id, author_id, block_type, date, parents, target, \
                       key_cipher, body_cipher, author_name_cipher";

impl Database {
    /// Index a block. Returns `false` when the id was already indexed, in
    /// which case nothing is written.
    pub fn insert_block(&self, block: &BlockRecord) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO blocks
                (id, thread_id, author_id, block_type, date, parents, target,
                 key_cipher, body_cipher, author_name_cipher)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                block.id.0,
                block.thread_id.to_hex(),
                block.author_id.to_hex(),
                block.block_type.as_str(),
                block.date.to_rfc3339(),
                join_ids(&block.parents),
                block.target.as_ref().map(|t| t.0.as_str()),
                block.key_cipher,
                block.body_cipher,
                block.author_name_cipher,
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn has_block(&self, id: &ContentId) -> Result<bool> {
        let found = self
            .conn()
            .query_row("SELECT 1 FROM blocks WHERE id = ?1", params![id.0], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_block(&self, id: &ContentId) -> Result<BlockRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM blocks WHERE id = ?1"),
                params![id.0],
                row_to_block,
            )
            .map_err(not_found)
    }

    /// Newest-first page of a thread's blocks. Blocks targeted by an IGNORE
    /// block are left out.
    pub fn list_blocks(&self, thread: &ThreadId, offset: u32, limit: u32) -> Result<Vec<BlockRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM blocks b
             WHERE b.thread_id = ?1
               AND NOT EXISTS (
                   SELECT 1 FROM blocks i
                   WHERE i.thread_id = b.thread_id
                     AND i.block_type = 'ignore'
                     AND i.target = b.id
               )
             ORDER BY b.date DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(params![thread.to_hex(), limit, offset], row_to_block)?;

        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(row?);
        }
        Ok(blocks)
    }

    /// Blocks of `block_type` pointing at `target` (e.g. annotations on a
    /// DATA block), oldest first.
    pub fn list_blocks_for_target(
        &self,
        target: &ContentId,
        block_type: BlockType,
    ) -> Result<Vec<BlockRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM blocks
             WHERE target = ?1 AND block_type = ?2
             ORDER BY date ASC"
        ))?;
        let rows = stmt.query_map(params![target.0, block_type.as_str()], row_to_block)?;

        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(row?);
        }
        Ok(blocks)
    }

    pub fn count_blocks(&self, thread: &ThreadId) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM blocks WHERE thread_id = ?1",
            params![thread.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn join_ids(ids: &[ContentId]) -> String {
    ids.iter().map(|id| id.0.as_str()).collect::<Vec<_>>().join(",")
}

fn split_ids(s: &str) -> Vec<ContentId> {
    s.split(',')
        .filter(|p| !p.is_empty())
        .map(|p| ContentId(p.to_string()))
        .collect()
}

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlockRecord> {
    let id: String = row.get(0)?;
    let thread_id: String = row.get(1)?;
    let author_id: String = row.get(2)?;
    let block_type: String = row.get(3)?;
    let date: String = row.get(4)?;
    let parents: String = row.get(5)?;
    let target: Option<String> = row.get(6)?;

    let block_type = BlockType::parse(&block_type).ok_or_else(|| {
        conversion_error(3, std::io::Error::new(std::io::ErrorKind::InvalidData, block_type.clone()))
    })?;

    Ok(BlockRecord {
        id: ContentId(id),
        thread_id: ThreadId(parse_key(1, &thread_id)?),
        author_id: PeerId(parse_key(2, &author_id)?),
        block_type,
        date: parse_timestamp(4, &date)?,
        parents: split_ids(&parents),
        target: target.map(ContentId),
        key_cipher: row.get(7)?,
        body_cipher: row.get(8)?,
        author_name_cipher: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threads::new_thread_record;
    use chrono::{Duration, Utc};

    fn setup() -> (Database, ThreadId) {
        let db = Database::open_in_memory().unwrap();
        let thread = ThreadId([1u8; 32]);
        db.insert_thread(&new_thread_record(thread, "t", [0u8; 32])).unwrap();
        (db, thread)
    }

    fn block(id: &str, thread: ThreadId, ty: BlockType, target: Option<&str>, age: i64) -> BlockRecord {
        BlockRecord {
            id: ContentId::new(id),
            thread_id: thread,
            author_id: PeerId([2u8; 32]),
            block_type: ty,
            date: Utc::now() - Duration::seconds(age),
            parents: vec![ContentId::new("p1"), ContentId::new("p2")],
            target: target.map(ContentId::new),
            key_cipher: None,
            body_cipher: Some(vec![1, 2, 3]),
            author_name_cipher: None,
        }
    }

    #[test]
    fn insert_is_idempotent() {
        let (db, thread) = setup();
        let b = block("b1", thread, BlockType::Data, Some("data"), 0);

        assert!(db.insert_block(&b).unwrap());
        assert!(!db.insert_block(&b).unwrap());
        assert_eq!(db.count_blocks(&thread).unwrap(), 1);

        let fetched = db.get_block(&b.id).unwrap();
        assert_eq!(fetched.parents, b.parents);
        assert_eq!(fetched.body_cipher, Some(vec![1, 2, 3]));
    }

    #[test]
    fn list_hides_ignored_blocks() {
        let (db, thread) = setup();
        db.insert_block(&block("d1", thread, BlockType::Data, Some("x"), 30)).unwrap();
        db.insert_block(&block("d2", thread, BlockType::Data, Some("y"), 20)).unwrap();
        db.insert_block(&block("i1", thread, BlockType::Ignore, Some("d1"), 10)).unwrap();

        let ids: Vec<String> = db
            .list_blocks(&thread, 0, 10)
            .unwrap()
            .into_iter()
            .map(|b| b.id.0)
            .collect();
        assert_eq!(ids, vec!["i1".to_string(), "d2".to_string()]);
    }

    #[test]
    fn annotations_by_target() {
        let (db, thread) = setup();
        db.insert_block(&block("c1", thread, BlockType::Annotation, Some("d1"), 5)).unwrap();
        db.insert_block(&block("c2", thread, BlockType::Annotation, Some("d2"), 4)).unwrap();

        let found = db
            .list_blocks_for_target(&ContentId::new("d1"), BlockType::Annotation)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, ContentId::new("c1"));
    }
}
