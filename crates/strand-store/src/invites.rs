//! Pending (received, unaccepted) thread invites.

use rusqlite::params;

use strand_shared::{ContentId, PeerId, ThreadId};

use crate::database::{not_found, parse_key, parse_timestamp, Database};
use crate::error::Result;
use crate::models::ThreadInvite;

impl Database {
    pub fn insert_invite(&self, invite: &ThreadInvite) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO thread_invites (id, thread_id, name, inviter, date)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                invite.id.0,
                invite.thread_id.to_hex(),
                invite.name,
                invite.inviter.to_hex(),
                invite.date.to_rfc3339(),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn get_invite(&self, id: &ContentId) -> Result<ThreadInvite> {
        self.conn()
            .query_row(
                "SELECT id, thread_id, name, inviter, date FROM thread_invites WHERE id = ?1",
                params![id.0],
                row_to_invite,
            )
            .map_err(not_found)
    }

    pub fn list_invites(&self) -> Result<Vec<ThreadInvite>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, thread_id, name, inviter, date FROM thread_invites ORDER BY date DESC",
        )?;
        let rows = stmt.query_map([], row_to_invite)?;

        let mut invites = Vec::new();
        for row in rows {
            invites.push(row?);
        }
        Ok(invites)
    }

    pub fn delete_invite(&self, id: &ContentId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM thread_invites WHERE id = ?1", params![id.0])?;
        Ok(affected > 0)
    }
}

fn row_to_invite(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadInvite> {
    let id: String = row.get(0)?;
    let thread_id: String = row.get(1)?;
    let name: String = row.get(2)?;
    let inviter: String = row.get(3)?;
    let date: String = row.get(4)?;

    Ok(ThreadInvite {
        id: ContentId(id),
        thread_id: ThreadId(parse_key(1, &thread_id)?),
        name,
        inviter: PeerId(parse_key(3, &inviter)?),
        date: parse_timestamp(4, &date)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn invite_crud() {
        let db = Database::open_in_memory().unwrap();
        let invite = ThreadInvite {
            id: ContentId::new("inv1"),
            thread_id: ThreadId([5u8; 32]),
            name: "party".to_string(),
            inviter: PeerId([6u8; 32]),
            date: Utc::now(),
        };

        assert!(db.insert_invite(&invite).unwrap());
        assert!(!db.insert_invite(&invite).unwrap());
        let fetched = db.get_invite(&invite.id).unwrap();
        assert_eq!(fetched.name, "party");
        assert_eq!(fetched.inviter, invite.inviter);
        assert_eq!(db.list_invites().unwrap().len(), 1);

        assert!(db.delete_invite(&invite.id).unwrap());
        assert!(db.get_invite(&invite.id).is_err());
    }
}
