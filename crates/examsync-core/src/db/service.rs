//! Async store handle shared by the engine's components

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::{
    AnswerPayload, DraftKey, DraftRecord, MutationPayload, OperationKind, QueuedMutation,
    SessionCheckpoint, SessionId, ViolationCounts, ViolationEvent,
};

use super::connection::Database;
use super::store::{LocalStore, SqliteLocalStore};

/// Thread-safe async access to the local durable store.
///
/// Clones share one connection; each call locks, runs the single-record
/// operation, and releases. No lock is ever held across a network await.
#[derive(Clone)]
pub struct StoreService {
    db: Arc<Mutex<Database>>,
}

impl StoreService {
    /// Open the durable store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: Arc::new(Mutex::new(Database::open(path)?)),
        })
    }

    /// In-memory store (tests, and the degraded no-storage mode)
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            db: Arc::new(Mutex::new(Database::open_in_memory()?)),
        })
    }

    /// Open the durable store, degrading to in-memory when local persistence
    /// is unavailable (e.g. storage disabled). The degraded mode keeps the
    /// engine working online-only instead of crashing.
    pub fn open_or_memory(path: impl AsRef<Path>) -> Result<Self> {
        match Database::open(path.as_ref()) {
            Ok(db) => Ok(Self {
                db: Arc::new(Mutex::new(db)),
            }),
            Err(error) => {
                tracing::warn!(
                    path = %path.as_ref().display(),
                    %error,
                    "local storage unavailable, falling back to in-memory store"
                );
                Self::in_memory()
            }
        }
    }

    /// Whether writes survive a reload
    pub async fn is_durable(&self) -> bool {
        self.db.lock().await.is_durable()
    }

    pub async fn put_draft(&self, key: DraftKey, payload: &AnswerPayload) -> Result<DraftRecord> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).put_draft(key, payload)
    }

    pub async fn get_draft(&self, key: DraftKey) -> Result<Option<DraftRecord>> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).get_draft(key)
    }

    pub async fn drafts_by_session(&self, session_id: SessionId) -> Result<Vec<DraftRecord>> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).drafts_by_session(session_id)
    }

    pub async fn drafts_needing_sync(&self) -> Result<Vec<DraftRecord>> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).drafts_needing_sync()
    }

    pub async fn mark_syncing(&self, key: DraftKey) -> Result<()> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).mark_syncing(key)
    }

    pub async fn mark_synced(
        &self,
        key: DraftKey,
        written_at: i64,
        confirmed_at: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).mark_synced(key, written_at, confirmed_at)
    }

    pub async fn mark_error(&self, key: DraftKey) -> Result<()> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).mark_error(key)
    }

    pub async fn requeue_stuck_syncing(&self, session_id: SessionId) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).requeue_stuck_syncing(session_id)
    }

    pub async fn enqueue_mutation(
        &self,
        op: OperationKind,
        payload: &MutationPayload,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).enqueue_mutation(op, payload)
    }

    pub async fn list_queue(&self) -> Result<Vec<QueuedMutation>> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).list_queue()
    }

    pub async fn remove_queue_item(&self, id: i64) -> Result<()> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).remove_queue_item(id)
    }

    pub async fn remove_queue_for_collection(
        &self,
        session_id: SessionId,
        collection: &str,
    ) -> Result<()> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).remove_queue_for_collection(session_id, collection)
    }

    pub async fn record_queue_failure(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: i64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).record_queue_failure(id, error, next_attempt_at)
    }

    pub async fn expedite_queue_for_session(&self, session_id: SessionId) -> Result<()> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).expedite_queue_for_session(session_id)
    }

    pub async fn put_checkpoint(&self, checkpoint: &SessionCheckpoint) -> Result<()> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).put_checkpoint(checkpoint)
    }

    pub async fn get_checkpoint(&self, session_id: SessionId) -> Result<Option<SessionCheckpoint>> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).get_checkpoint(session_id)
    }

    pub async fn append_violation(
        &self,
        session_id: SessionId,
        event: ViolationEvent,
    ) -> Result<ViolationCounts> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).append_violation(session_id, event)
    }

    pub async fn list_violations(&self, session_id: SessionId) -> Result<Vec<ViolationEvent>> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).list_violations(session_id)
    }

    pub async fn purge_session(&self, session_id: SessionId) -> Result<()> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).purge_session(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldId;

    #[tokio::test(flavor = "multi_thread")]
    async fn clones_share_one_store() {
        let store = StoreService::in_memory().unwrap();
        let clone = store.clone();

        let key = DraftKey::new(SessionId::new(), FieldId::new());
        store
            .put_draft(key, &AnswerPayload::text("shared"))
            .await
            .unwrap();

        let record = clone.get_draft(key).await.unwrap().unwrap();
        assert_eq!(record.payload, AnswerPayload::text("shared"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_or_memory_degrades_gracefully() {
        // A path that cannot be created (file used as a directory)
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let bad_path = tmp.path().join("nested").join("local.db");

        let store = StoreService::open_or_memory(bad_path).unwrap();
        assert!(!store.is_durable().await);
    }
}
