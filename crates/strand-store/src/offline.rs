//! Inbound offline messages: delivery markers and deferred envelopes.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use strand_shared::ContentId;

use crate::database::{parse_timestamp, Database};
use crate::error::Result;
use crate::models::OfflineMessage;

impl Database {
    /// Whether a message fetched from `addr` has been seen before, deferred
    /// or delivered.
    pub fn has_offline_message(&self, addr: &ContentId) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM offline_messages WHERE addr = ?1",
                params![addr.0],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Record `addr` as delivered, dropping any deferred envelope.
    pub fn mark_offline_delivered(&self, addr: &ContentId) -> Result<()> {
        self.conn().execute(
            "INSERT INTO offline_messages (addr, date, envelope) VALUES (?1, ?2, NULL)
             ON CONFLICT(addr) DO UPDATE SET envelope = NULL",
            params![addr.0, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Keep a serialized envelope from `addr` for later replay.
    pub fn defer_offline_message(&self, addr: &ContentId, envelope: &[u8]) -> Result<()> {
        self.conn().execute(
            "INSERT INTO offline_messages (addr, date, envelope) VALUES (?1, ?2, ?3)
             ON CONFLICT(addr) DO UPDATE SET envelope = excluded.envelope",
            params![addr.0, Utc::now().to_rfc3339(), envelope],
        )?;
        Ok(())
    }

    /// All deferred messages, oldest first.
    pub fn list_deferred_messages(&self) -> Result<Vec<OfflineMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT addr, date, envelope FROM offline_messages
             WHERE envelope IS NOT NULL
             ORDER BY date ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let addr: String = row.get(0)?;
            let date: String = row.get(1)?;
            Ok(OfflineMessage {
                addr: ContentId(addr),
                date: parse_timestamp(1, &date)?,
                envelope: row.get(2)?,
            })
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Drop delivery markers older than `cutoff`. Deferred rows are kept.
    pub fn delete_offline_markers_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM offline_messages WHERE envelope IS NULL AND date < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn deferred_then_delivered() {
        let db = Database::open_in_memory().unwrap();
        let addr = ContentId::new("addr1");

        assert!(!db.has_offline_message(&addr).unwrap());
        db.defer_offline_message(&addr, b"envelope").unwrap();
        assert!(db.has_offline_message(&addr).unwrap());

        let deferred = db.list_deferred_messages().unwrap();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].envelope.as_deref(), Some(&b"envelope"[..]));

        db.mark_offline_delivered(&addr).unwrap();
        assert!(db.list_deferred_messages().unwrap().is_empty());
        assert!(db.has_offline_message(&addr).unwrap());
    }

    #[test]
    fn marker_expiry_keeps_deferred() {
        let db = Database::open_in_memory().unwrap();
        db.mark_offline_delivered(&ContentId::new("delivered")).unwrap();
        db.defer_offline_message(&ContentId::new("waiting"), b"env").unwrap();

        let removed = db
            .delete_offline_markers_before(Utc::now() + Duration::seconds(1))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.list_deferred_messages().unwrap().len(), 1);
    }
}
