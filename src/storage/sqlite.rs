//! # SQLite Backend
//!
//! Default durable backend. One connection behind a mutex serves both the
//! `events` table and the `agent_state` key/value table.

use super::types::{StateStore, StoreBackend, StoredRow};
use crate::error::{AgentError, Result};
use log::info;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};

const PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
";

// AUTOINCREMENT keeps ids strictly increasing even after the newest rows
// were deleted, so a watermark never points at a reused id.
const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS events (
        _id INTEGER PRIMARY KEY AUTOINCREMENT,
        data BLOB NOT NULL,
        crc INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS time_idx ON events (created_at);
    CREATE TABLE IF NOT EXISTS agent_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

/// Thread-safe SQLite store
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("path", &self.path)
            .finish()
    }
}

impl SqliteBackend {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    AgentError::Io(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(&path)
            .map_err(|e| AgentError::Storage(format!("Failed to open sqlite db: {}", e)))?;
        Self::init_schema(&conn)?;

        info!("event store opened at {}", path.display());

        Ok(SqliteBackend {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// Open an in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AgentError::Storage(format!("Failed to open sqlite db: {}", e)))?;
        Self::init_schema(&conn)?;

        Ok(SqliteBackend {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(PRAGMAS)
            .map_err(|e| AgentError::Storage(format!("pragmas: {}", e)))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| AgentError::Storage(format!("schema: {}", e)))?;
        Ok(())
    }
}

impl StoreBackend for SqliteBackend {
    fn insert(&self, payload: &[u8], integrity_tag: u32, created_at: u64) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO events (data, crc, created_at) VALUES (?1, ?2, ?3)",
            params![payload, integrity_tag as i64, created_at as i64],
        )
        .map_err(|e| AgentError::Storage(format!("Failed to insert event: {}", e)))?;
        Ok(conn.last_insert_rowid())
    }

    fn oldest(&self, limit: usize) -> Result<Vec<StoredRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT _id, data, crc, created_at FROM events ORDER BY _id ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(StoredRow {
                    sequence_id: row.get(0)?,
                    payload: row.get(1)?,
                    integrity_tag: row.get::<_, i64>(2)? as u32,
                    created_at: row.get::<_, i64>(3)? as u64,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn delete_up_to(&self, sequence_id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM events WHERE _id <= ?1", params![sequence_id])?;
        Ok(removed)
    }

    fn delete_all(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM events", [])?;
        Ok(removed)
    }

    fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn footprint_bytes(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let freelist: i64 = conn.query_row("PRAGMA freelist_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok(((page_count - freelist).max(0) * page_size) as u64)
    }
}

impl StateStore for SqliteBackend {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM agent_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO agent_state (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM agent_state WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::integrity_tag;

    #[test]
    fn test_sqlite_insert_and_read_in_order() {
        let backend = SqliteBackend::in_memory().unwrap();
        for i in 0..5 {
            let payload = format!("event-{}", i).into_bytes();
            backend
                .insert(&payload, integrity_tag(&payload), 1000 + i)
                .unwrap();
        }

        let rows = backend.oldest(3).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].payload, b"event-0");
        assert_eq!(rows[2].payload, b"event-2");
        assert!(rows[0].sequence_id < rows[1].sequence_id);
        assert_eq!(rows[1].created_at, 1001);
    }

    #[test]
    fn test_sqlite_ids_not_reused_after_delete() {
        let backend = SqliteBackend::in_memory().unwrap();
        let first = backend.insert(b"a", 0, 1).unwrap();
        let second = backend.insert(b"b", 0, 2).unwrap();
        backend.delete_all().unwrap();
        let third = backend.insert(b"c", 0, 3).unwrap();
        assert!(first < second);
        assert!(third > second);
    }

    #[test]
    fn test_sqlite_state_roundtrip() {
        let backend = SqliteBackend::in_memory().unwrap();
        assert_eq!(backend.get_string("k").unwrap(), None);
        backend.set_string("k", "v1").unwrap();
        backend.set_string("k", "v2").unwrap();
        assert_eq!(backend.get_string("k").unwrap().as_deref(), Some("v2"));
        backend.remove("k").unwrap();
        assert_eq!(backend.get_string("k").unwrap(), None);
    }

    #[test]
    fn test_sqlite_footprint_grows() {
        let backend = SqliteBackend::in_memory().unwrap();
        let before = backend.footprint_bytes().unwrap();
        let payload = vec![b'x'; 64 * 1024];
        backend.insert(&payload, 0, 1).unwrap();
        assert!(backend.footprint_bytes().unwrap() > before);
    }

    #[test]
    fn test_sqlite_open_creates_parent_dir() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("nested").join("events.db");
        let backend = SqliteBackend::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(backend.path(), Some(path.as_path()));
    }
}
