//! CRUD operations for [`ThreadRecord`] rows.

use chrono::Utc;
use rusqlite::params;

use strand_shared::{ContentId, ThreadId};

use crate::database::{conversion_error, not_found, parse_key, parse_timestamp, Database};
use crate::error::Result;
use crate::models::ThreadRecord;

const COLUMNS: &str = "id, name, secret, head, created_at";

impl Database {
    pub fn insert_thread(&self, thread: &ThreadRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO threads (id, name, secret, head, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                thread.id.to_hex(),
                thread.name,
                thread.secret.to_vec(),
                thread.head.as_ref().map(|h| h.0.as_str()).unwrap_or(""),
                thread.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_thread(&self, id: &ThreadId) -> Result<ThreadRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM threads WHERE id = ?1"),
                params![id.to_hex()],
                row_to_thread,
            )
            .map_err(not_found)
    }

    pub fn has_thread(&self, id: &ThreadId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM threads WHERE id = ?1",
            params![id.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// List all threads, oldest first.
    pub fn list_threads(&self) -> Result<Vec<ThreadRecord>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {COLUMNS} FROM threads ORDER BY created_at ASC"))?;
        let rows = stmt.query_map([], row_to_thread)?;

        let mut threads = Vec::new();
        for row in rows {
            threads.push(row?);
        }
        Ok(threads)
    }

    pub fn update_thread_head(&self, id: &ThreadId, head: &ContentId) -> Result<()> {
        self.conn().execute(
            "UPDATE threads SET head = ?1 WHERE id = ?2",
            params![head.0, id.to_hex()],
        )?;
        Ok(())
    }

    /// Delete the thread together with every block, peer and invite row
    /// recorded for it.
    pub fn purge_thread(&self, id: &ThreadId) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let hex_id = id.to_hex();
        tx.execute("DELETE FROM blocks WHERE thread_id = ?1", params![hex_id])?;
        tx.execute("DELETE FROM thread_peers WHERE thread_id = ?1", params![hex_id])?;
        tx.execute("DELETE FROM thread_invites WHERE thread_id = ?1", params![hex_id])?;
        tx.execute("DELETE FROM threads WHERE id = ?1", params![hex_id])?;
        tx.commit()?;

        tracing::debug!(thread = %id, "purged thread");
        Ok(())
    }
}

fn row_to_thread(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadRecord> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let secret: Vec<u8> = row.get(2)?;
    let head: String = row.get(3)?;
    let created_at: String = row.get(4)?;

    let secret: [u8; 32] = secret
        .try_into()
        .map_err(|_| conversion_error(2, hex::FromHexError::InvalidStringLength))?;

    Ok(ThreadRecord {
        id: ThreadId(parse_key(0, &id)?),
        name,
        secret,
        head: (!head.is_empty()).then(|| ContentId(head)),
        created_at: parse_timestamp(4, &created_at)?,
    })
}

/// Build a fresh record for a new thread.
pub fn new_thread_record(id: ThreadId, name: &str, secret: [u8; 32]) -> ThreadRecord {
    ThreadRecord {
        id,
        name: name.to_string(),
        secret,
        head: None,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    fn test_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn thread_crud() {
        let db = test_db();
        let record = new_thread_record(ThreadId([3u8; 32]), "holiday", [9u8; 32]);
        db.insert_thread(&record).unwrap();

        let fetched = db.get_thread(&record.id).unwrap();
        assert_eq!(fetched.name, "holiday");
        assert_eq!(fetched.secret, [9u8; 32]);
        assert!(fetched.head.is_none());

        db.update_thread_head(&record.id, &ContentId::new("b1")).unwrap();
        assert_eq!(db.get_thread(&record.id).unwrap().head, Some(ContentId::new("b1")));
        assert_eq!(db.list_threads().unwrap().len(), 1);
    }

    #[test]
    fn purge_removes_thread() {
        let db = test_db();
        let record = new_thread_record(ThreadId([4u8; 32]), "t", [1u8; 32]);
        db.insert_thread(&record).unwrap();

        db.purge_thread(&record.id).unwrap();
        assert!(!db.has_thread(&record.id).unwrap());
        assert!(matches!(db.get_thread(&record.id), Err(StoreError::NotFound)));
    }
}
