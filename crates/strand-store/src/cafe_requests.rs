//! Durable cafe request queue rows.

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use strand_shared::PeerId;

use crate::database::{conversion_error, parse_key, parse_timestamp, Database};
use crate::error::Result;
use crate::models::{CafeRequest, CafeRequestType};

impl Database {
    pub fn insert_cafe_request(&self, request: &CafeRequest) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cafe_requests (id, target_id, cafe_id, type, date)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                request.id.to_string(),
                request.target_id,
                request.cafe_id.to_hex(),
                request.request_type.as_str(),
                request.date.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Page through the queue in id order. `offset` is the id of the last
    /// row of the previous page, or `None` for the first page.
    pub fn list_cafe_requests(&self, offset: Option<&Uuid>, limit: u32) -> Result<Vec<CafeRequest>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, target_id, cafe_id, type, date FROM cafe_requests
             WHERE id > ?1
             ORDER BY id ASC
             LIMIT ?2",
        )?;
        let offset = offset.map(|id| id.to_string()).unwrap_or_default();
        let rows = stmt.query_map(params![offset, limit], row_to_request)?;

        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }
        Ok(requests)
    }

    pub fn count_cafe_requests(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM cafe_requests", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn delete_cafe_requests(&self, ids: &[Uuid]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut removed = 0;
        for id in ids {
            removed += tx.execute("DELETE FROM cafe_requests WHERE id = ?1", params![id.to_string()])?;
        }
        tx.commit()?;
        Ok(removed)
    }

    pub fn delete_cafe_requests_for_cafe(&self, cafe: &PeerId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM cafe_requests WHERE cafe_id = ?1",
            params![cafe.to_hex()],
        )?;
        Ok(affected)
    }
}

/// Build a queue row with a fresh time-ordered id.
pub fn new_cafe_request(target_id: &str, cafe_id: PeerId, request_type: CafeRequestType) -> CafeRequest {
    CafeRequest {
        id: Uuid::now_v7(),
        target_id: target_id.to_string(),
        cafe_id,
        request_type,
        date: Utc::now(),
    }
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<CafeRequest> {
    let id: String = row.get(0)?;
    let target_id: String = row.get(1)?;
    let cafe_id: String = row.get(2)?;
    let request_type: String = row.get(3)?;
    let date: String = row.get(4)?;

    let request_type = CafeRequestType::parse(&request_type).ok_or_else(|| {
        conversion_error(3, std::io::Error::new(std::io::ErrorKind::InvalidData, request_type.clone()))
    })?;

    Ok(CafeRequest {
        id: Uuid::parse_str(&id).map_err(|e| conversion_error(0, e))?,
        target_id,
        cafe_id: PeerId(parse_key(2, &cafe_id)?),
        request_type,
        date: parse_timestamp(4, &date)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_by_last_id() {
        let db = Database::open_in_memory().unwrap();
        let cafe = PeerId([4u8; 32]);
        let mut ids = Vec::new();
        for i in 0..5 {
            let req = new_cafe_request(&format!("t{i}"), cafe, CafeRequestType::StoreBlock);
            ids.push(req.id);
            db.insert_cafe_request(&req).unwrap();
        }

        let first = db.list_cafe_requests(None, 3).unwrap();
        assert_eq!(first.len(), 3);
        let second = db.list_cafe_requests(Some(&first[2].id), 3).unwrap();
        assert_eq!(second.len(), 2);

        let mut seen: Vec<Uuid> = first.iter().chain(second.iter()).map(|r| r.id).collect();
        seen.sort();
        ids.sort();
        assert_eq!(seen, ids);
    }

    #[test]
    fn delete_by_ids_and_cafe() {
        let db = Database::open_in_memory().unwrap();
        let a = new_cafe_request("t1", PeerId([1u8; 32]), CafeRequestType::StoreBlock);
        let b = new_cafe_request("t2", PeerId([2u8; 32]), CafeRequestType::StoreThread);
        db.insert_cafe_request(&a).unwrap();
        db.insert_cafe_request(&b).unwrap();

        assert_eq!(db.delete_cafe_requests(&[a.id]).unwrap(), 1);
        assert_eq!(db.delete_cafe_requests_for_cafe(&PeerId([2u8; 32])).unwrap(), 1);
        assert_eq!(db.count_cafe_requests().unwrap(), 0);
    }
}
