//! Host-side records: peers registered with this node as their cafe, and the
//! thread snapshots stored for them.

use chrono::Utc;
use rusqlite::params;

use strand_shared::{PeerId, ThreadId};

use crate::database::{not_found, parse_key, parse_timestamp, Database};
use crate::error::Result;
use crate::models::{CafeClient, CafeClientThread};

impl Database {
    pub fn upsert_cafe_client(&self, client: &CafeClient) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cafe_clients (id, access, refresh, expiry)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                access = excluded.access,
                refresh = excluded.refresh,
                expiry = excluded.expiry",
            params![
                client.id.to_hex(),
                client.access,
                client.refresh,
                client.expiry.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_cafe_client_by_access(&self, access: &str) -> Result<CafeClient> {
        self.conn()
            .query_row(
                "SELECT id, access, refresh, expiry FROM cafe_clients WHERE access = ?1",
                params![access],
                row_to_client,
            )
            .map_err(not_found)
    }

    pub fn get_cafe_client_by_refresh(&self, refresh: &str) -> Result<CafeClient> {
        self.conn()
            .query_row(
                "SELECT id, access, refresh, expiry FROM cafe_clients WHERE refresh = ?1",
                params![refresh],
                row_to_client,
            )
            .map_err(not_found)
    }

    pub fn upsert_cafe_client_thread(&self, thread: &CafeClientThread) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cafe_client_threads
                (id, client_id, secret_cipher, head_cipher, name_cipher, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id, client_id) DO UPDATE SET
                secret_cipher = excluded.secret_cipher,
                head_cipher = excluded.head_cipher,
                name_cipher = excluded.name_cipher,
                updated_at = excluded.updated_at",
            params![
                thread.id.to_hex(),
                thread.client_id.to_hex(),
                thread.secret_cipher,
                thread.head_cipher,
                thread.name_cipher,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_cafe_client_threads(&self, client: &PeerId) -> Result<Vec<CafeClientThread>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, client_id, secret_cipher, head_cipher, name_cipher, updated_at
             FROM cafe_client_threads WHERE client_id = ?1",
        )?;
        let rows = stmt.query_map(params![client.to_hex()], |row| {
            let id: String = row.get(0)?;
            let client_id: String = row.get(1)?;
            let updated_at: String = row.get(5)?;
            Ok(CafeClientThread {
                id: ThreadId(parse_key(0, &id)?),
                client_id: PeerId(parse_key(1, &client_id)?),
                secret_cipher: row.get(2)?,
                head_cipher: row.get(3)?,
                name_cipher: row.get(4)?,
                updated_at: parse_timestamp(5, &updated_at)?,
            })
        })?;

        let mut threads = Vec::new();
        for row in rows {
            threads.push(row?);
        }
        Ok(threads)
    }

    /// Drops a client's thread snapshot. Returns whether one existed.
    pub fn delete_cafe_client_thread(&self, client: &PeerId, id: &ThreadId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM cafe_client_threads WHERE id = ?1 AND client_id = ?2",
            params![id.to_hex(), client.to_hex()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_client(row: &rusqlite::Row<'_>) -> rusqlite::Result<CafeClient> {
    let id: String = row.get(0)?;
    let expiry: String = row.get(3)?;

    Ok(CafeClient {
        id: PeerId(parse_key(0, &id)?),
        access: row.get(1)?,
        refresh: row.get(2)?,
        expiry: parse_timestamp(3, &expiry)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn client_lookup_by_tokens() {
        let db = Database::open_in_memory().unwrap();
        let client = CafeClient {
            id: PeerId([3u8; 32]),
            access: "acc".to_string(),
            refresh: "ref".to_string(),
            expiry: Utc::now() + Duration::days(7),
        };
        db.upsert_cafe_client(&client).unwrap();

        assert_eq!(db.get_cafe_client_by_access("acc").unwrap().id, client.id);
        assert_eq!(db.get_cafe_client_by_refresh("ref").unwrap().id, client.id);
        assert!(db.get_cafe_client_by_access("nope").is_err());
    }

    #[test]
    fn thread_snapshot_upsert() {
        let db = Database::open_in_memory().unwrap();
        let client = CafeClient {
            id: PeerId([3u8; 32]),
            access: "acc".to_string(),
            refresh: "ref".to_string(),
            expiry: Utc::now(),
        };
        db.upsert_cafe_client(&client).unwrap();

        let mut snapshot = CafeClientThread {
            id: ThreadId([9u8; 32]),
            client_id: client.id,
            secret_cipher: vec![1],
            head_cipher: vec![2],
            name_cipher: vec![3],
            updated_at: Utc::now(),
        };
        db.upsert_cafe_client_thread(&snapshot).unwrap();
        snapshot.head_cipher = vec![4];
        db.upsert_cafe_client_thread(&snapshot).unwrap();

        let stored = db.list_cafe_client_threads(&client.id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].head_cipher, vec![4]);
    }

    #[test]
    fn thread_snapshot_delete_is_scoped_to_client() {
        let db = Database::open_in_memory().unwrap();
        for (id, access) in [(PeerId([3u8; 32]), "a"), (PeerId([4u8; 32]), "b")] {
            db.upsert_cafe_client(&CafeClient {
                id,
                access: access.to_string(),
                refresh: format!("r{access}"),
                expiry: Utc::now(),
            })
            .unwrap();
        }
        let snapshot = CafeClientThread {
            id: ThreadId([9u8; 32]),
            client_id: PeerId([3u8; 32]),
            secret_cipher: vec![1],
            head_cipher: vec![2],
            name_cipher: vec![3],
            updated_at: Utc::now(),
        };
        db.upsert_cafe_client_thread(&snapshot).unwrap();

        assert!(!db.delete_cafe_client_thread(&PeerId([4u8; 32]), &snapshot.id).unwrap());
        assert_eq!(db.list_cafe_client_threads(&snapshot.client_id).unwrap().len(), 1);
        assert!(db.delete_cafe_client_thread(&snapshot.client_id, &snapshot.id).unwrap());
        assert!(db.list_cafe_client_threads(&snapshot.client_id).unwrap().is_empty());
    }
}
