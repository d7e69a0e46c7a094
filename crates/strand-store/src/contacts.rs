//! Sender keys seen on inbound messages.

use chrono::Utc;
use rusqlite::params;

use strand_shared::PeerId;

use crate::database::{parse_key, parse_timestamp, Database};
use crate::error::Result;
use crate::models::Contact;

impl Database {
    /// Record that `peer` was seen now.
    pub fn touch_contact(&self, peer: &PeerId) -> Result<()> {
        self.conn().execute(
            "INSERT INTO contacts (id, last_seen) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET last_seen = excluded.last_seen",
            params![peer.to_hex(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, last_seen FROM contacts ORDER BY last_seen DESC")?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let last_seen: String = row.get(1)?;
            Ok(Contact {
                id: PeerId(parse_key(0, &id)?),
                last_seen: parse_timestamp(1, &last_seen)?,
            })
        })?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_is_upsert() {
        let db = Database::open_in_memory().unwrap();
        let peer = PeerId([1u8; 32]);
        db.touch_contact(&peer).unwrap();
        db.touch_contact(&peer).unwrap();

        let contacts = db.list_contacts().unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].id, peer);
    }
}
