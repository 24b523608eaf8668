//! Database migrations

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < CURRENT_VERSION {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get::<_, i32>(0).map(|v| v != 0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

/// Migration to version 1: initial schema
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;

        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        -- Draft answers: one row per (attempt, question), last writer wins
        CREATE TABLE IF NOT EXISTS drafts (
            session_id TEXT NOT NULL,
            field_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            written_at INTEGER NOT NULL,
            confirmed_at INTEGER,
            status TEXT NOT NULL DEFAULT 'pending',
            PRIMARY KEY (session_id, field_id)
        );
        CREATE INDEX IF NOT EXISTS idx_drafts_status ON drafts(status);
        CREATE INDEX IF NOT EXISTS idx_drafts_session ON drafts(session_id);

        -- Generic mutation queue, drained FIFO by rowid
        CREATE TABLE IF NOT EXISTS mutation_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            collection TEXT NOT NULL,
            op TEXT NOT NULL,
            payload TEXT NOT NULL,
            retries INTEGER NOT NULL DEFAULT 0,
            last_attempt_at INTEGER,
            last_error TEXT,
            next_attempt_at INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_queue_session ON mutation_queue(session_id);

        -- Timer checkpoints: one row per attempt
        CREATE TABLE IF NOT EXISTS checkpoints (
            session_id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            elapsed_seconds INTEGER NOT NULL DEFAULT 0,
            synced_elapsed_seconds INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        );

        -- Append-only violation events
        CREATE TABLE IF NOT EXISTS violations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_violations_session ON violations(session_id);

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;",
    )?;

    Ok(())
}
