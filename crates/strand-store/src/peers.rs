//! Thread membership rows.

use chrono::Utc;
use rusqlite::params;

use strand_shared::{PeerId, ThreadId};

use crate::database::{parse_key, parse_timestamp, Database};
use crate::error::Result;
use crate::models::ThreadPeer;

impl Database {
    /// Add `peer` to `thread`. Returns `false` if it was already a member.
    pub fn add_thread_peer(&self, thread: &ThreadId, peer: &PeerId) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO thread_peers (id, thread_id, welcomed, added_at)
             VALUES (?1, ?2, 0, ?3)",
            params![peer.to_hex(), thread.to_hex(), Utc::now().to_rfc3339()],
        )?;
        Ok(affected > 0)
    }

    pub fn list_thread_peers(&self, thread: &ThreadId) -> Result<Vec<ThreadPeer>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, thread_id, welcomed, added_at FROM thread_peers
             WHERE thread_id = ?1
             ORDER BY added_at ASC",
        )?;
        let rows = stmt.query_map(params![thread.to_hex()], row_to_peer)?;

        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(peers)
    }

    pub fn is_thread_peer(&self, thread: &ThreadId, peer: &PeerId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM thread_peers WHERE id = ?1 AND thread_id = ?2",
            params![peer.to_hex(), thread.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn set_thread_peer_welcomed(&self, thread: &ThreadId, peer: &PeerId) -> Result<()> {
        self.conn().execute(
            "UPDATE thread_peers SET welcomed = 1 WHERE id = ?1 AND thread_id = ?2",
            params![peer.to_hex(), thread.to_hex()],
        )?;
        Ok(())
    }

    pub fn remove_thread_peer(&self, thread: &ThreadId, peer: &PeerId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM thread_peers WHERE id = ?1 AND thread_id = ?2",
            params![peer.to_hex(), thread.to_hex()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_peer(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadPeer> {
    let id: String = row.get(0)?;
    let thread_id: String = row.get(1)?;
    let welcomed: bool = row.get(2)?;
    let added_at: String = row.get(3)?;

    Ok(ThreadPeer {
        id: PeerId(parse_key(0, &id)?),
        thread_id: ThreadId(parse_key(1, &thread_id)?),
        welcomed,
        added_at: parse_timestamp(3, &added_at)?,
    })
}
