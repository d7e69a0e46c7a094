//! Schema migrations, applied in order when a [`crate::Database`] is opened.
//! `PRAGMA user_version` records how many have run.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Migration = fn(&Connection) -> rusqlite::Result<()>;

const MIGRATIONS: &[(&str, Migration)] = &[("v001_initial", v001_initial::up)];

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let applied: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    tracing::debug!(applied, known = MIGRATIONS.len(), "Checking database schema");

    for (version, (name, up)) in (1u32..).zip(MIGRATIONS.iter()).skip(applied as usize) {
        tracing::info!(migration = %name, "Applying migration");
        up(conn).map_err(|e| StoreError::Migration {
            version,
            reason: e.to_string(),
        })?;
        conn.pragma_update(None, "user_version", version)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_once() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0)).unwrap();
        assert_eq!(version as usize, MIGRATIONS.len());
    }
}
