//! Database connection management

use std::path::Path;

use rusqlite::Connection;

use crate::error::{Error, Result};

use super::migrations;

/// Wrapper around the local `SQLite` database file.
///
/// The local store is the engine's durability boundary: it must survive
/// reloads and crashes, and it never talks to the network.
pub struct Database {
    conn: Connection,
    durable: bool,
}

impl Database {
    /// Open (or create) the local database at the given path.
    ///
    /// Runs migrations automatically. Open failures map to
    /// `StorageUnavailable` so callers can degrade to in-memory operation.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        }
        let conn = Connection::open(path.as_ref())
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        let database = Self {
            conn,
            durable: true,
        };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    /// Open an in-memory database (testing, or the degraded no-storage mode)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        let database = Self {
            conn,
            durable: false,
        };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    /// Configure `SQLite` for a single-client durable cache
    fn configure(&self) -> Result<()> {
        // WAL is a no-op for in-memory connections
        self.conn
            .pragma_update(None, "journal_mode", "WAL")
            .ok();
        self.conn.pragma_update(None, "synchronous", "NORMAL").ok();
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn)
    }

    /// Whether this database is backed by a file that survives reloads
    pub const fn is_durable(&self) -> bool {
        self.durable
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_in_memory_is_not_durable() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.is_durable());
    }

    #[test]
    fn open_creates_file_and_survives_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("exam").join("local.db");

        {
            let db = Database::open(&path).unwrap();
            assert!(db.is_durable());
            db.connection()
                .execute(
                    "INSERT INTO checkpoints (session_id, exam_id, elapsed_seconds, synced_elapsed_seconds, updated_at)
                     VALUES ('s1', 'e1', 7, 0, 0)",
                    [],
                )
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let elapsed: u32 = db
            .connection()
            .query_row(
                "SELECT elapsed_seconds FROM checkpoints WHERE session_id = 's1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(elapsed, 7);
    }
}
