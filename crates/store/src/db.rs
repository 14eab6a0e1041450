//! Database handle and schema.
//!
//! A single connection guarded by a mutex: writes are serialized per
//! store, reads are short enough to share the same lock without
//! contention mattering at this scale.
//!
//! Migration policy is additive only. Previously written events must
//! remain readable by newer versions, so existing columns are never
//! dropped or retyped; new versions add tables/columns and bump
//! `user_version`.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;

use weft_domain::{Error, Result};

pub(crate) const SCHEMA_VERSION: i32 = 1;

pub struct Database {
    pub(crate) conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("open {}: {e}", path.display())))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("open in-memory database: {e}")))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(storage)?;

        if version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    project_id TEXT,
                    name TEXT NOT NULL,
                    configuration TEXT NOT NULL,
                    status TEXT NOT NULL,
                    input_tokens INTEGER NOT NULL DEFAULT 0,
                    output_tokens INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    FOREIGN KEY (project_id) REFERENCES projects(id)
                );

                CREATE TABLE IF NOT EXISTS threads (
                    id TEXT PRIMARY KEY,
                    parent_id TEXT,
                    created_at TEXT NOT NULL,
                    metadata TEXT NOT NULL,
                    is_shadow INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS events (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL,
                    thread_id TEXT NOT NULL,
                    type TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    data TEXT NOT NULL,
                    UNIQUE (thread_id, id),
                    FOREIGN KEY (thread_id) REFERENCES threads(id)
                );

                CREATE INDEX IF NOT EXISTS idx_events_thread ON events(thread_id, seq);
                CREATE INDEX IF NOT EXISTS idx_threads_parent ON threads(parent_id);
                CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_id);
                "#,
            )
            .map_err(storage)?;
        }

        conn.execute(&format!("PRAGMA user_version = {SCHEMA_VERSION}"), [])
            .map_err(storage)?;

        Ok(())
    }
}

/// Map a rusqlite error into the storage error kind.
pub(crate) fn storage(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_schema_initializes() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                 ('projects', 'sessions', 'threads', 'events')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn reopen_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weft.db");
        {
            let db = Database::open(&path).unwrap();
            db.conn
                .lock()
                .execute(
                    "INSERT INTO projects (id, name, created_at) VALUES ('p1', 'demo', '2026-01-01T00:00:00Z')",
                    [],
                )
                .unwrap();
        }
        let db = Database::open(&path).unwrap();
        let name: String = db
            .conn
            .lock()
            .query_row("SELECT name FROM projects WHERE id = 'p1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(name, "demo");
    }
}
