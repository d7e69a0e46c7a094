//! Sessions this node holds with cafes.

use rusqlite::params;

use strand_shared::PeerId;

use crate::database::{not_found, parse_key, parse_timestamp, Database};
use crate::error::Result;
use crate::models::CafeSession;

impl Database {
    /// Insert or replace the session for `session.cafe_id`.
    pub fn upsert_cafe_session(&self, session: &CafeSession) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cafe_sessions (cafe_id, access, refresh, expiry)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cafe_id) DO UPDATE SET
                access = excluded.access,
                refresh = excluded.refresh,
                expiry = excluded.expiry",
            params![
                session.cafe_id.to_hex(),
                session.access,
                session.refresh,
                session.expiry.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_cafe_session(&self, cafe: &PeerId) -> Result<CafeSession> {
        self.conn()
            .query_row(
                "SELECT cafe_id, access, refresh, expiry FROM cafe_sessions WHERE cafe_id = ?1",
                params![cafe.to_hex()],
                row_to_session,
            )
            .map_err(not_found)
    }

    pub fn list_cafe_sessions(&self) -> Result<Vec<CafeSession>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT cafe_id, access, refresh, expiry FROM cafe_sessions ORDER BY cafe_id",
        )?;
        let rows = stmt.query_map([], row_to_session)?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    pub fn delete_cafe_session(&self, cafe: &PeerId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM cafe_sessions WHERE cafe_id = ?1",
            params![cafe.to_hex()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<CafeSession> {
    let cafe_id: String = row.get(0)?;
    let expiry: String = row.get(3)?;

    Ok(CafeSession {
        cafe_id: PeerId(parse_key(0, &cafe_id)?),
        access: row.get(1)?,
        refresh: row.get(2)?,
        expiry: parse_timestamp(3, &expiry)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn upsert_replaces_tokens() {
        let db = Database::open_in_memory().unwrap();
        let cafe = PeerId([7u8; 32]);
        let mut session = CafeSession {
            cafe_id: cafe,
            access: "a1".to_string(),
            refresh: "r1".to_string(),
            expiry: Utc::now() + Duration::days(1),
        };
        db.upsert_cafe_session(&session).unwrap();

        session.access = "a2".to_string();
        db.upsert_cafe_session(&session).unwrap();

        let sessions = db.list_cafe_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(db.get_cafe_session(&cafe).unwrap().access, "a2");

        assert!(db.delete_cafe_session(&cafe).unwrap());
        assert!(db.get_cafe_session(&cafe).is_err());
    }
}
