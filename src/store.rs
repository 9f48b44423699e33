//! Embedded SQLite store for captured conversations.
//!
//! Two tables: `interactions` (append-only capture log) and
//! `confirmed_interactions` (rows promoted by the external review UI). Both
//! are created lazily on first use. The upstream response id is the primary
//! key, so duplicate captures are rejected by the store.

use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a connection and make sure the schema exists.
    pub fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        ensure_schema(&conn)?;
        Ok(conn)
    }
}

pub fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS interactions (
            id TEXT PRIMARY KEY,
            model TEXT,
            conversation TEXT,
            timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS confirmed_interactions (
            id TEXT PRIMARY KEY,
            model TEXT,
            conversation TEXT,
            original_timestamp DATETIME,
            confirmed_timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Insert one captured row. A duplicate id fails with a constraint error,
/// which the batch writer logs and skips.
pub fn insert_interaction(
    conn: &Connection,
    id: &str,
    model: &str,
    conversation_json: &str,
    timestamp: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO interactions (id, model, conversation, timestamp)
         VALUES (?1, ?2, ?3, ?4)",
        params![id, model, conversation_json, timestamp.to_rfc3339()],
    )?;
    Ok(())
}

/// Count rows carrying an id across both tables (at-most-once check).
pub fn count_rows_with_id(conn: &Connection, id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT
            (SELECT COUNT(*) FROM interactions WHERE id = ?1) +
            (SELECT COUNT(*) FROM confirmed_interactions WHERE id = ?1)",
        [id],
        |row| row.get(0),
    )
}

/// Load a stored conversation payload by id.
pub fn get_conversation(conn: &Connection, id: &str) -> rusqlite::Result<Option<(String, String)>> {
    let mut stmt =
        conn.prepare("SELECT model, conversation FROM interactions WHERE id = ?1")?;
    let mut rows = stmt.query_map([id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    rows.next().transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_schema_is_created_lazily() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("interactions.db"));
        let conn = db.open().unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert!(tables.contains(&"interactions".to_string()));
        assert!(tables.contains(&"confirmed_interactions".to_string()));
    }

    #[test]
    fn test_insert_and_read_back() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("interactions.db"));
        let conn = db.open().unwrap();

        insert_interaction(&conn, "r1", "test-model", "{\"conversations\":[]}", Utc::now())
            .unwrap();

        let (model, conversation) = get_conversation(&conn, "r1").unwrap().unwrap();
        assert_eq!(model, "test-model");
        assert_eq!(conversation, "{\"conversations\":[]}");
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("interactions.db"));
        let conn = db.open().unwrap();

        insert_interaction(&conn, "r1", "m", "{}", Utc::now()).unwrap();
        let second = insert_interaction(&conn, "r1", "m", "{}", Utc::now());
        assert!(second.is_err());
        assert_eq!(count_rows_with_id(&conn, "r1").unwrap(), 1);
    }
}
