//! Debounced write path from UI edits into the local store
//!
//! Every edit lands in an in-memory cache immediately so the UI reflects it
//! with zero latency; the durable write plus one opportunistic remote push
//! happen after a per-key quiet window. A new edit cancels and restarts the
//! window, so only the last payload of a burst is ever persisted or sent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::db::StoreService;
use crate::error::Result;
use crate::models::{AnswerPayload, DraftKey, SessionId, SyncStatus};
use crate::remote::{Connectivity, RemoteKey, SharedRemote};

struct WriterInner {
    store: StoreService,
    remote: SharedRemote,
    connectivity: Connectivity,
    debounce: Duration,
    /// Latest payload per key, authoritative for the UI and for commits
    cache: Mutex<HashMap<DraftKey, AnswerPayload>>,
    /// At most one outstanding debounce timer per key
    timers: Mutex<HashMap<DraftKey, JoinHandle<()>>>,
}

/// Debounced draft writer. Clones share the cache and timers.
#[derive(Clone)]
pub struct DraftWriter {
    inner: Arc<WriterInner>,
}

impl DraftWriter {
    #[must_use]
    pub fn new(
        store: StoreService,
        remote: SharedRemote,
        connectivity: Connectivity,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                store,
                remote,
                connectivity,
                debounce,
                cache: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Record an edit. Validates the payload, updates the in-memory copy,
    /// and (re)starts the debounce timer for this key.
    pub fn write(&self, key: DraftKey, payload: AnswerPayload) -> Result<()> {
        payload.validate()?;
        self.inner.cache.lock().unwrap().insert(key, payload);

        let writer = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(writer.inner.debounce).await;
            writer.commit(key).await;
            writer.inner.timers.lock().unwrap().remove(&key);
        });

        // Last writer wins: the previous timer for this key is cancelled
        if let Some(stale) = self.inner.timers.lock().unwrap().insert(key, handle) {
            stale.abort();
        }
        Ok(())
    }

    /// Latest in-memory payload for a key (zero-latency UI read)
    #[must_use]
    pub fn latest(&self, key: DraftKey) -> Option<AnswerPayload> {
        self.inner.cache.lock().unwrap().get(&key).cloned()
    }

    /// Persisted sync status for a key, for the per-field save indicator
    pub async fn status(&self, key: DraftKey) -> Result<Option<SyncStatus>> {
        Ok(self
            .inner
            .store
            .get_draft(key)
            .await?
            .map(|record| record.status))
    }

    /// Cancel all outstanding debounce timers for a session and persist every
    /// cached payload immediately as `pending`. Used when a session enters
    /// `Submitting`, so no stale write can land after finalize.
    pub async fn flush_session(&self, session_id: SessionId) -> Result<()> {
        {
            let mut timers = self.inner.timers.lock().unwrap();
            timers.retain(|key, handle| {
                if key.session_id == session_id {
                    handle.abort();
                    false
                } else {
                    true
                }
            });
        }

        // Every key ever written goes through the cache, so the cache is the
        // complete set of fields to flush for this session.
        let keys: Vec<DraftKey> = self
            .inner
            .cache
            .lock()
            .unwrap()
            .keys()
            .filter(|key| key.session_id == session_id)
            .copied()
            .collect();

        for key in keys {
            let Some(payload) = self.latest(key) else {
                continue;
            };
            // Skip payloads the debounce path already made durable; writing
            // them again would knock a synced draft back to pending.
            match self.inner.store.get_draft(key).await? {
                Some(record) if record.payload == payload => {}
                _ => {
                    self.inner.store.put_draft(key, &payload).await?;
                }
            }
        }
        Ok(())
    }

    /// Persist the debounced result and attempt one direct push
    async fn commit(&self, key: DraftKey) {
        let Some(payload) = self.latest(key) else {
            return;
        };

        let record = match self.inner.store.put_draft(key, &payload).await {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(%key, %error, "failed to persist draft");
                return;
            }
        };

        // Opportunistic push; the sync engine retries anything left behind
        if !self.inner.connectivity.is_online() {
            return;
        }

        if let Err(error) = self.push(key, &record.payload, record.written_at).await {
            tracing::debug!(%key, %error, "direct draft push failed, left for sync engine");
        }
    }

    async fn push(&self, key: DraftKey, payload: &AnswerPayload, written_at: i64) -> Result<()> {
        self.inner.store.mark_syncing(key).await?;

        let doc = crate::models::AnswerDoc {
            session_id: key.session_id,
            field_id: key.field_id,
            answer: payload.clone(),
            updated_at: written_at,
        };
        let remote_key = RemoteKey::field(key.session_id, key.field_id);

        match self
            .inner
            .remote
            .upsert("answers", remote_key, serde_json::to_value(&doc)?)
            .await
        {
            Ok(()) => {
                let confirmed_at = chrono::Utc::now().timestamp_millis();
                self.inner
                    .store
                    .mark_synced(key, written_at, confirmed_at)
                    .await?;
                Ok(())
            }
            Err(error) => {
                self.inner.store.mark_error(key).await?;
                Err(error)
            }
        }
    }
}
