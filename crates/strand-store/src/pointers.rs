//! Outbound pointers awaiting acknowledgment.

use chrono::{DateTime, Utc};
use rusqlite::params;

use strand_shared::pointer::{Pointer, PointerKey, PointerPurpose};
use strand_shared::{ContentId, PeerId};

use crate::database::{not_found, parse_key, parse_timestamp, Database};
use crate::error::Result;

const COLUMNS: &str = "id, key, cid, provider, provider_addr, date, cancel_id";

impl Database {
    pub fn insert_pointer(&self, pointer: &Pointer) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO pointers (id, key, cid, provider, provider_addr, date, cancel_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                pointer.id,
                pointer.key.to_hex(),
                pointer.cid.0,
                pointer.provider.to_hex(),
                pointer.provider_addr,
                pointer.date.to_rfc3339(),
                pointer.cancel_id.map(|c| c.to_hex()),
            ],
        )?;
        Ok(())
    }

    pub fn get_pointer(&self, id: &str) -> Result<Pointer> {
        self.conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM pointers WHERE id = ?1"),
                params![id],
                row_to_pointer,
            )
            .map_err(not_found)
    }

    pub fn list_pointers(&self) -> Result<Vec<Pointer>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM pointers ORDER BY date ASC"))?;
        let rows = stmt.query_map([], row_to_pointer)?;

        let mut pointers = Vec::new();
        for row in rows {
            pointers.push(row?);
        }
        Ok(pointers)
    }

    pub fn delete_pointer(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM pointers WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    /// Delete pointers dated before `cutoff`; returns how many were removed.
    pub fn delete_pointers_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM pointers WHERE date < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(affected)
    }
}

fn row_to_pointer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Pointer> {
    let id: String = row.get(0)?;
    let key: String = row.get(1)?;
    let cid: String = row.get(2)?;
    let provider: String = row.get(3)?;
    let provider_addr: Option<String> = row.get(4)?;
    let date: String = row.get(5)?;
    let cancel_id: Option<String> = row.get(6)?;

    Ok(Pointer {
        id,
        key: PointerKey(parse_key(1, &key)?),
        cid: ContentId(cid),
        provider: PeerId(parse_key(3, &provider)?),
        provider_addr,
        purpose: PointerPurpose::Message,
        date: parse_timestamp(5, &date)?,
        cancel_id: cancel_id.map(|c| parse_key(6, &c).map(PeerId)).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use strand_shared::pointer::pointer_key;

    fn pointer(id: &str, age_days: i64) -> Pointer {
        let recipient = PeerId([8u8; 32]);
        Pointer {
            id: id.to_string(),
            key: pointer_key(&recipient),
            cid: ContentId::new(format!("cid-{id}")),
            provider: PeerId([1u8; 32]),
            provider_addr: Some("127.0.0.1:4101".to_string()),
            purpose: PointerPurpose::Message,
            date: Utc::now() - Duration::days(age_days),
            cancel_id: Some(recipient),
        }
    }

    #[test]
    fn pointer_crud() {
        let db = Database::open_in_memory().unwrap();
        let p = pointer("p1", 0);
        db.insert_pointer(&p).unwrap();

        let fetched = db.get_pointer("p1").unwrap();
        assert_eq!(fetched.key, p.key);
        assert_eq!(fetched.cancel_id, p.cancel_id);

        assert!(db.delete_pointer("p1").unwrap());
        assert!(!db.delete_pointer("p1").unwrap());
    }

    #[test]
    fn delete_before_cutoff() {
        let db = Database::open_in_memory().unwrap();
        db.insert_pointer(&pointer("old", 40)).unwrap();
        db.insert_pointer(&pointer("new", 1)).unwrap();

        let removed = db.delete_pointers_before(Utc::now() - Duration::days(30)).unwrap();
        assert_eq!(removed, 1);

        let left: Vec<String> = db.list_pointers().unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(left, vec!["new".to_string()]);
    }
}
