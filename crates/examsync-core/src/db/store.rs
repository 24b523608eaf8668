//! Local durable store implementation
//!
//! The only shared mutable resource in the engine. Every component goes
//! through this contract; none of them read each other's in-memory state.
//! Operations are transactional at the single-record level and never touch
//! the network.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::{
    AnswerPayload, DraftKey, DraftRecord, FieldId, MutationPayload, OperationKind, QueuedMutation,
    SessionCheckpoint, SessionId, SyncStatus, ViolationCounts, ViolationEvent, ViolationKind,
};

/// Contract for the engine's local persistence layer
pub trait LocalStore {
    /// Upsert a draft for the given key with status reset to `pending`.
    /// The latest local write always wins over an older one for the same key.
    fn put_draft(&self, key: DraftKey, payload: &AnswerPayload) -> Result<DraftRecord>;

    /// Fetch one draft by key
    fn get_draft(&self, key: DraftKey) -> Result<Option<DraftRecord>>;

    /// All drafts for one attempt, in field order of first write
    fn drafts_by_session(&self, session_id: SessionId) -> Result<Vec<DraftRecord>>;

    /// All drafts eligible for a sync pass (`pending` or `error`), across
    /// every session, oldest local write first
    fn drafts_needing_sync(&self) -> Result<Vec<DraftRecord>>;

    /// Transition a draft to `syncing` ahead of a push attempt
    fn mark_syncing(&self, key: DraftKey) -> Result<()>;

    /// Transition a draft to `synced`, but only if no newer local write
    /// landed since `written_at` was read. Returns whether the mark applied.
    fn mark_synced(&self, key: DraftKey, written_at: i64, confirmed_at: i64) -> Result<bool>;

    /// Transition a draft to `error`, leaving it eligible for the next pass
    fn mark_error(&self, key: DraftKey) -> Result<()>;

    /// Reset any draft stuck in `syncing` back to `pending` for one session.
    /// A push task torn down mid-flight leaves this state behind; re-sending
    /// is safe because the remote upsert is idempotent.
    fn requeue_stuck_syncing(&self, session_id: SessionId) -> Result<usize>;

    /// Append a mutation to the replay queue, returning its sequence id.
    /// The payload is validated here; malformed payloads never enter.
    fn enqueue_mutation(&self, op: OperationKind, payload: &MutationPayload) -> Result<i64>;

    /// The full queue in insertion (FIFO) order
    fn list_queue(&self) -> Result<Vec<QueuedMutation>>;

    /// Remove a queue item (confirmed success, or dead-letter drop)
    fn remove_queue_item(&self, id: i64) -> Result<()>;

    /// Remove every queued mutation for one (session, collection) pair.
    /// Used to coalesce superseded snapshot payloads (violation counters)
    /// before a fresher one is enqueued or confirmed.
    fn remove_queue_for_collection(&self, session_id: SessionId, collection: &str) -> Result<()>;

    /// Record a failed attempt: bump the retry counter, store the error, and
    /// set the backoff-ready time for the next pass
    fn record_queue_failure(&self, id: i64, error: &str, next_attempt_at: i64) -> Result<()>;

    /// Clear the backoff windows of a session's queued mutations so the next
    /// pass retries them immediately (used by the pre-finalize drain)
    fn expedite_queue_for_session(&self, session_id: SessionId) -> Result<()>;

    /// Upsert the timer checkpoint for a session. The stored elapsed value
    /// never decreases, whatever the caller passes.
    fn put_checkpoint(&self, checkpoint: &SessionCheckpoint) -> Result<()>;

    /// Fetch the checkpoint for a session
    fn get_checkpoint(&self, session_id: SessionId) -> Result<Option<SessionCheckpoint>>;

    /// Append one violation event and return the updated aggregate counts
    fn append_violation(
        &self,
        session_id: SessionId,
        event: ViolationEvent,
    ) -> Result<ViolationCounts>;

    /// Full append-only violation list for a session, oldest first
    fn list_violations(&self, session_id: SessionId) -> Result<Vec<ViolationEvent>>;

    /// Bulk purge of every record belonging to a session that reached a
    /// terminal state
    fn purge_session(&self, session_id: SessionId) -> Result<()>;
}

/// `SQLite` implementation of `LocalStore`
pub struct SqliteLocalStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteLocalStore<'a> {
    /// Create a new store over the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_draft(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<DraftRecord>> {
        let session_id: String = row.get(0)?;
        let field_id: String = row.get(1)?;
        let payload: String = row.get(2)?;
        let status: String = row.get(5)?;

        // Rows with unreadable keys or payloads are surfaced as None and
        // skipped by the caller with a warning; fabricating replacement ids
        // would detach the draft from its session.
        let (Ok(session_id), Ok(field_id), Ok(payload)) = (
            session_id.parse::<SessionId>(),
            field_id.parse::<FieldId>(),
            serde_json::from_str::<AnswerPayload>(&payload),
        ) else {
            return Ok(None);
        };

        Ok(Some(DraftRecord {
            key: DraftKey {
                session_id,
                field_id,
            },
            payload,
            written_at: row.get(3)?,
            confirmed_at: row.get(4)?,
            status: SyncStatus::parse(&status),
        }))
    }

    fn collect_drafts(items: Vec<Option<DraftRecord>>) -> Vec<DraftRecord> {
        let mut drafts = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Some(draft) => drafts.push(draft),
                None => tracing::warn!("skipping unreadable draft row"),
            }
        }
        drafts
    }

    fn parse_queue_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<QueuedMutation>> {
        let op: String = row.get(1)?;
        let payload: String = row.get(2)?;

        // Rows with unreadable payloads are surfaced as None and skipped by
        // the caller with a warning instead of poisoning the whole drain.
        let (Some(op), Ok(payload)) = (
            OperationKind::parse(&op),
            serde_json::from_str::<MutationPayload>(&payload),
        ) else {
            return Ok(None);
        };

        Ok(Some(QueuedMutation {
            id: row.get(0)?,
            op,
            payload,
            retries: row.get(3)?,
            last_attempt_at: row.get(4)?,
            last_error: row.get(5)?,
            next_attempt_at: row.get(6)?,
        }))
    }
}

impl LocalStore for SqliteLocalStore<'_> {
    fn put_draft(&self, key: DraftKey, payload: &AnswerPayload) -> Result<DraftRecord> {
        payload.validate()?;
        let record = DraftRecord::new(key, payload.clone());
        let payload_json = serde_json::to_string(&record.payload)?;

        self.conn.execute(
            "INSERT INTO drafts (session_id, field_id, payload, written_at, confirmed_at, status)
             VALUES (?, ?, ?, ?, NULL, 'pending')
             ON CONFLICT(session_id, field_id) DO UPDATE SET
                payload = excluded.payload,
                written_at = excluded.written_at,
                status = 'pending'",
            params![
                key.session_id.as_str(),
                key.field_id.as_str(),
                payload_json,
                record.written_at
            ],
        )?;

        Ok(record)
    }

    fn get_draft(&self, key: DraftKey) -> Result<Option<DraftRecord>> {
        let result = self
            .conn
            .query_row(
                "SELECT session_id, field_id, payload, written_at, confirmed_at, status
                 FROM drafts WHERE session_id = ? AND field_id = ?",
                params![key.session_id.as_str(), key.field_id.as_str()],
                Self::parse_draft,
            )
            .optional()?;
        match result {
            Some(Some(record)) => Ok(Some(record)),
            Some(None) => {
                tracing::warn!(%key, "skipping unreadable draft row");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn drafts_by_session(&self, session_id: SessionId) -> Result<Vec<DraftRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, field_id, payload, written_at, confirmed_at, status
             FROM drafts WHERE session_id = ? ORDER BY rowid",
        )?;
        let drafts = stmt
            .query_map(params![session_id.as_str()], Self::parse_draft)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Self::collect_drafts(drafts))
    }

    fn drafts_needing_sync(&self) -> Result<Vec<DraftRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, field_id, payload, written_at, confirmed_at, status
             FROM drafts WHERE status IN ('pending', 'error') ORDER BY written_at",
        )?;
        let drafts = stmt
            .query_map([], Self::parse_draft)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Self::collect_drafts(drafts))
    }

    fn mark_syncing(&self, key: DraftKey) -> Result<()> {
        self.conn.execute(
            "UPDATE drafts SET status = 'syncing' WHERE session_id = ? AND field_id = ?",
            params![key.session_id.as_str(), key.field_id.as_str()],
        )?;
        Ok(())
    }

    fn mark_synced(&self, key: DraftKey, written_at: i64, confirmed_at: i64) -> Result<bool> {
        // The written_at guard keeps a slow push from stamping `synced` over
        // a draft the user edited while the push was in flight.
        let rows = self.conn.execute(
            "UPDATE drafts SET status = 'synced', confirmed_at = ?
             WHERE session_id = ? AND field_id = ? AND written_at = ?",
            params![
                confirmed_at,
                key.session_id.as_str(),
                key.field_id.as_str(),
                written_at
            ],
        )?;
        Ok(rows > 0)
    }

    fn mark_error(&self, key: DraftKey) -> Result<()> {
        // Only a completed push may overwrite a newer pending edit's status,
        // so the error mark skips rows that were rewritten meanwhile.
        self.conn.execute(
            "UPDATE drafts SET status = 'error'
             WHERE session_id = ? AND field_id = ? AND status = 'syncing'",
            params![key.session_id.as_str(), key.field_id.as_str()],
        )?;
        Ok(())
    }

    fn requeue_stuck_syncing(&self, session_id: SessionId) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE drafts SET status = 'pending'
             WHERE session_id = ? AND status = 'syncing'",
            params![session_id.as_str()],
        )?;
        Ok(changed)
    }

    fn enqueue_mutation(&self, op: OperationKind, payload: &MutationPayload) -> Result<i64> {
        payload.validate()?;
        let payload_json = serde_json::to_string(payload)?;

        self.conn.execute(
            "INSERT INTO mutation_queue (session_id, collection, op, payload, retries, next_attempt_at)
             VALUES (?, ?, ?, ?, 0, 0)",
            params![
                payload.session_id().as_str(),
                payload.collection(),
                op.as_str(),
                payload_json
            ],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    fn list_queue(&self) -> Result<Vec<QueuedMutation>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, op, payload, retries, last_attempt_at, last_error, next_attempt_at
             FROM mutation_queue ORDER BY id",
        )?;
        let items = stmt
            .query_map([], Self::parse_queue_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut queue = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Some(item) => queue.push(item),
                None => tracing::warn!("skipping unreadable mutation queue row"),
            }
        }
        Ok(queue)
    }

    fn remove_queue_item(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM mutation_queue WHERE id = ?", params![id])?;
        Ok(())
    }

    fn remove_queue_for_collection(&self, session_id: SessionId, collection: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM mutation_queue WHERE session_id = ? AND collection = ?",
            params![session_id.as_str(), collection],
        )?;
        Ok(())
    }

    fn record_queue_failure(&self, id: i64, error: &str, next_attempt_at: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let rows = self.conn.execute(
            "UPDATE mutation_queue
             SET retries = retries + 1, last_attempt_at = ?, last_error = ?, next_attempt_at = ?
             WHERE id = ?",
            params![now, error, next_attempt_at, id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("queue item {id}")));
        }
        Ok(())
    }

    fn expedite_queue_for_session(&self, session_id: SessionId) -> Result<()> {
        self.conn.execute(
            "UPDATE mutation_queue SET next_attempt_at = 0 WHERE session_id = ?",
            params![session_id.as_str()],
        )?;
        Ok(())
    }

    fn put_checkpoint(&self, checkpoint: &SessionCheckpoint) -> Result<()> {
        // MAX() on both counters keeps the stored row monotonic even if a
        // stale writer hands us an older snapshot.
        self.conn.execute(
            "INSERT INTO checkpoints (session_id, exam_id, elapsed_seconds, synced_elapsed_seconds, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                exam_id = excluded.exam_id,
                elapsed_seconds = MAX(elapsed_seconds, excluded.elapsed_seconds),
                synced_elapsed_seconds = MAX(synced_elapsed_seconds, excluded.synced_elapsed_seconds),
                updated_at = excluded.updated_at",
            params![
                checkpoint.session_id.as_str(),
                checkpoint.exam_id,
                checkpoint.elapsed_seconds,
                checkpoint.synced_elapsed_seconds,
                checkpoint.updated_at
            ],
        )?;
        Ok(())
    }

    fn get_checkpoint(&self, session_id: SessionId) -> Result<Option<SessionCheckpoint>> {
        let result = self
            .conn
            .query_row(
                "SELECT session_id, exam_id, elapsed_seconds, synced_elapsed_seconds, updated_at
                 FROM checkpoints WHERE session_id = ?",
                params![session_id.as_str()],
                |row| {
                    let id: String = row.get(0)?;
                    Ok(SessionCheckpoint {
                        session_id: id.parse().unwrap_or_default(),
                        exam_id: row.get(1)?,
                        elapsed_seconds: row.get(2)?,
                        synced_elapsed_seconds: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    fn append_violation(
        &self,
        session_id: SessionId,
        event: ViolationEvent,
    ) -> Result<ViolationCounts> {
        self.conn.execute(
            "INSERT INTO violations (session_id, kind, at) VALUES (?, ?, ?)",
            params![session_id.as_str(), event.kind.as_str(), event.at],
        )?;

        let events = self.list_violations(session_id)?;
        Ok(ViolationCounts::from_events(&events))
    }

    fn list_violations(&self, session_id: SessionId) -> Result<Vec<ViolationEvent>> {
        let mut stmt = self
            .conn
            .prepare("SELECT kind, at FROM violations WHERE session_id = ? ORDER BY id")?;
        let rows = stmt
            .query_map(params![session_id.as_str()], |row| {
                let kind: String = row.get(0)?;
                let at: i64 = row.get(1)?;
                Ok((kind, at))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(kind, at)| {
                ViolationKind::parse(&kind).map(|kind| ViolationEvent { kind, at })
            })
            .collect())
    }

    fn purge_session(&self, session_id: SessionId) -> Result<()> {
        let id = session_id.as_str();
        self.conn
            .execute("DELETE FROM drafts WHERE session_id = ?", params![&id])?;
        self.conn.execute(
            "DELETE FROM mutation_queue WHERE session_id = ?",
            params![&id],
        )?;
        self.conn
            .execute("DELETE FROM checkpoints WHERE session_id = ?", params![&id])?;
        self.conn
            .execute("DELETE FROM violations WHERE session_id = ?", params![&id])?;
        Ok(())
    }
}
