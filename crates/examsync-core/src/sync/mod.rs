//! Background reconciliation engine
//!
//! Drains pending drafts and the mutation queue against the remote store.
//! One pass runs at a time (re-entrant calls are no-ops), passes are
//! triggered by a periodic timer, by reconnect events, and manually after
//! writes. A failed pass only ever delays work; nothing is discarded short
//! of the retry ceiling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::EngineConfig;
use crate::db::StoreService;
use crate::error::Result;
use crate::models::{
    AnswerDoc, DraftKey, MutationPayload, OperationKind, QueuedMutation, ViolationCounts,
    ViolationsDoc,
};
use crate::remote::{Connectivity, RemoteKey, SharedRemote};

/// Lifecycle events emitted to subscribers (UI save indicators, diagnostics)
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A pass started draining
    Started,
    /// One draft reached the remote and was confirmed
    DraftSynced { key: DraftKey },
    /// One draft push failed; it stays eligible for the next pass
    DraftFailed { key: DraftKey, error: String },
    /// One queued mutation was applied and removed
    MutationApplied { id: i64, collection: String },
    /// One queued mutation exceeded the retry ceiling and was dropped
    DeadLettered {
        id: i64,
        collection: String,
        attempts: u32,
    },
    /// A pass finished
    Completed(SyncSummary),
    /// A pass aborted on a storage error; the queue is untouched
    SyncError { error: String },
}

/// Outcome counts of one sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub drafts_synced: usize,
    pub drafts_failed: usize,
    pub mutations_applied: usize,
    pub mutations_failed: usize,
    pub dead_lettered: usize,
}

impl SyncSummary {
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.drafts_failed == 0 && self.mutations_failed == 0 && self.dead_lettered == 0
    }
}

struct EngineInner {
    store: StoreService,
    remote: SharedRemote,
    connectivity: Connectivity,
    config: EngineConfig,
    busy: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The background sync engine.
///
/// Explicitly constructed and owned by the session controller; `start`/`stop`
/// bound the periodic and reconnect-triggered tasks to that owner's lifetime.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(
        store: StoreService,
        remote: SharedRemote,
        connectivity: Connectivity,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(EngineInner {
                store,
                remote,
                connectivity,
                config,
                busy: AtomicBool::new(false),
                events,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to sync lifecycle events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Spawn the periodic pass and the reconnect trigger.
    /// Idempotent: a second call while running does nothing.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock().unwrap();
        if !tasks.is_empty() {
            return;
        }

        let engine = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.inner.config.sync_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; periodic work starts one
            // interval from now.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(error) = engine.sync().await {
                    tracing::warn!(%error, "periodic sync pass failed");
                }
            }
        }));

        let engine = self.clone();
        let mut online = self.inner.connectivity.watch();
        tasks.push(tokio::spawn(async move {
            while online.changed().await.is_ok() {
                if *online.borrow_and_update() {
                    tracing::debug!("connectivity restored, draining");
                    if let Err(error) = engine.sync().await {
                        tracing::warn!(%error, "reconnect sync pass failed");
                    }
                }
            }
        }));
    }

    /// Cancel the background tasks. In-flight passes finish their current
    /// record but no new ones are scheduled.
    pub fn stop(&self) {
        let mut tasks = self.inner.tasks.lock().unwrap();
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Run one reconciliation pass.
    ///
    /// Re-entrant-safe: a call while a pass is already running is a no-op.
    /// Exits immediately while offline to avoid pointless backoff churn.
    /// Storage errors abort the pass; network errors are per-record.
    pub async fn sync(&self) -> Result<SyncSummary> {
        if self.inner.busy.swap(true, Ordering::SeqCst) {
            return Ok(SyncSummary::default());
        }

        let result = self.run_pass().await;
        self.inner.busy.store(false, Ordering::SeqCst);

        if let Err(error) = &result {
            self.emit(SyncEvent::SyncError {
                error: error.to_string(),
            });
        }
        result
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.inner.events.send(event);
    }

    async fn run_pass(&self) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();

        if !self.inner.connectivity.is_online() {
            tracing::debug!("offline, skipping sync pass");
            return Ok(summary);
        }

        self.emit(SyncEvent::Started);

        summary = self.drain_drafts(summary).await?;
        summary = self.drain_queue(summary).await?;

        self.emit(SyncEvent::Completed(summary));
        Ok(summary)
    }

    /// Push every pending/error draft across all sessions
    async fn drain_drafts(&self, mut summary: SyncSummary) -> Result<SyncSummary> {
        let drafts = self.inner.store.drafts_needing_sync().await?;

        for draft in drafts {
            let key = draft.key;
            self.inner.store.mark_syncing(key).await?;

            let doc = AnswerDoc {
                session_id: key.session_id,
                field_id: key.field_id,
                answer: draft.payload.clone(),
                updated_at: draft.written_at,
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
                    if self
                        .inner
                        .store
                        .mark_synced(key, draft.written_at, confirmed_at)
                        .await?
                    {
                        summary.drafts_synced += 1;
                        self.emit(SyncEvent::DraftSynced { key });
                    }
                }
                Err(error) => {
                    self.inner.store.mark_error(key).await?;
                    summary.drafts_failed += 1;
                    tracing::debug!(%key, %error, "draft push failed");
                    self.emit(SyncEvent::DraftFailed {
                        key,
                        error: error.to_string(),
                    });
                }
            }
        }

        Ok(summary)
    }

    /// Replay the mutation queue in insertion order
    async fn drain_queue(&self, mut summary: SyncSummary) -> Result<SyncSummary> {
        let now = chrono::Utc::now().timestamp_millis();

        for item in self.inner.store.list_queue().await? {
            if item.retries >= self.inner.config.max_retries {
                // Dead-letter by drop: no retry past the ceiling
                self.inner.store.remove_queue_item(item.id).await?;
                summary.dead_lettered += 1;
                tracing::warn!(
                    id = item.id,
                    collection = item.payload.collection(),
                    attempts = item.retries,
                    last_error = item.last_error.as_deref().unwrap_or("unknown"),
                    "mutation exceeded retry ceiling, dropped"
                );
                self.emit(SyncEvent::DeadLettered {
                    id: item.id,
                    collection: item.payload.collection().to_string(),
                    attempts: item.retries,
                });
                continue;
            }

            // Failed items wait out their backoff window across passes
            // instead of blocking the items queued behind them.
            if !item.is_due(now) {
                continue;
            }

            match self.apply_mutation(&item).await {
                Ok(()) => {
                    self.inner.store.remove_queue_item(item.id).await?;
                    summary.mutations_applied += 1;
                    self.emit(SyncEvent::MutationApplied {
                        id: item.id,
                        collection: item.payload.collection().to_string(),
                    });
                }
                Err(error) => {
                    let delay = self.inner.config.backoff_after(item.retries);
                    let next_attempt_at = now + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                    self.inner
                        .store
                        .record_queue_failure(item.id, &error.to_string(), next_attempt_at)
                        .await?;
                    summary.mutations_failed += 1;
                    tracing::debug!(id = item.id, %error, "queued mutation failed");
                }
            }
        }

        Ok(summary)
    }

    async fn apply_mutation(&self, item: &QueuedMutation) -> Result<()> {
        let collection = item.payload.collection();
        let key = RemoteKey {
            session_id: item.payload.session_id(),
            field_id: item.payload.field_id(),
        };

        match item.op {
            OperationKind::Insert | OperationKind::Update => {
                let doc = match &item.payload {
                    // A queued violations snapshot can be overtaken by a
                    // fresher direct push between listing and applying; the
                    // remote upsert is last-writer-wins, so a stale replay
                    // would rewind the counters. The local event table is
                    // append-only, so rebuilding from it at apply time always
                    // yields the current counts.
                    MutationPayload::Violations(stale) => {
                        let events = self.inner.store.list_violations(stale.session_id).await?;
                        if events.is_empty() {
                            // Session purged while the item sat in the queue
                            return Ok(());
                        }
                        serde_json::to_value(ViolationsDoc {
                            session_id: stale.session_id,
                            counts: ViolationCounts::from_events(&events),
                            events,
                            updated_at: chrono::Utc::now().timestamp_millis(),
                        })?
                    }
                    payload => document_value(payload)?,
                };
                self.inner.remote.upsert(collection, key, doc).await
            }
            OperationKind::Delete => self.inner.remote.delete(collection, key).await,
        }
    }
}

/// Serialize just the document body (without the collection tag)
fn document_value(payload: &MutationPayload) -> Result<serde_json::Value> {
    let value = match payload {
        MutationPayload::Answers(doc) => serde_json::to_value(doc)?,
        MutationPayload::Progress(doc) => serde_json::to_value(doc)?,
        MutationPayload::Violations(doc) => serde_json::to_value(doc)?,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AnswerPayload, FieldId, ProgressDoc, SessionId, SyncStatus, ViolationEvent, ViolationKind,
    };
    use crate::remote::MemoryRemote;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn engine_with(
        remote: Arc<MemoryRemote>,
        connectivity: Connectivity,
        config: EngineConfig,
    ) -> (SyncEngine, StoreService) {
        let store = StoreService::in_memory().unwrap();
        let engine = SyncEngine::new(store.clone(), remote, connectivity, config);
        (engine, store)
    }

    fn progress(session_id: SessionId, elapsed: u32) -> MutationPayload {
        MutationPayload::Progress(ProgressDoc {
            session_id,
            exam_id: "exam-1".into(),
            elapsed_seconds: elapsed,
            updated_at: 0,
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_pass_is_a_noop() {
        let remote = Arc::new(MemoryRemote::new());
        let (engine, store) = engine_with(
            Arc::clone(&remote),
            Connectivity::new(false),
            EngineConfig::default(),
        );

        let key = DraftKey::new(SessionId::new(), FieldId::new());
        store
            .put_draft(key, &AnswerPayload::text("offline"))
            .await
            .unwrap();

        let summary = engine.sync().await.unwrap();
        assert_eq!(summary, SyncSummary::default());
        assert_eq!(
            store.get_draft(key).await.unwrap().unwrap().status,
            SyncStatus::Pending
        );
        assert_eq!(
            remote.upsert_count("answers", RemoteKey::field(key.session_id, key.field_id)),
            0
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drains_pending_drafts_across_sessions() {
        let remote = Arc::new(MemoryRemote::new());
        let (engine, store) = engine_with(
            Arc::clone(&remote),
            Connectivity::new(true),
            EngineConfig::default(),
        );

        let key_a = DraftKey::new(SessionId::new(), FieldId::new());
        let key_b = DraftKey::new(SessionId::new(), FieldId::new());
        store.put_draft(key_a, &AnswerPayload::text("a")).await.unwrap();
        store.put_draft(key_b, &AnswerPayload::text("b")).await.unwrap();

        let summary = engine.sync().await.unwrap();
        assert_eq!(summary.drafts_synced, 2);

        for key in [key_a, key_b] {
            let record = store.get_draft(key).await.unwrap().unwrap();
            assert_eq!(record.status, SyncStatus::Synced);
            assert_eq!(
                remote.upsert_count("answers", RemoteKey::field(key.session_id, key.field_id)),
                1
            );
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_draft_stays_eligible() {
        let remote = Arc::new(MemoryRemote::new());
        let (engine, store) = engine_with(
            Arc::clone(&remote),
            Connectivity::new(true),
            EngineConfig::default(),
        );

        let key = DraftKey::new(SessionId::new(), FieldId::new());
        store.put_draft(key, &AnswerPayload::text("x")).await.unwrap();

        remote.fail_next(1);
        let summary = engine.sync().await.unwrap();
        assert_eq!(summary.drafts_failed, 1);
        assert_eq!(
            store.get_draft(key).await.unwrap().unwrap().status,
            SyncStatus::Error
        );

        // Next pass picks it back up
        let summary = engine.sync().await.unwrap();
        assert_eq!(summary.drafts_synced, 1);
        assert_eq!(
            store.get_draft(key).await.unwrap().unwrap().status,
            SyncStatus::Synced
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queue_dead_letters_after_exact_ceiling() {
        let remote = Arc::new(MemoryRemote::new());
        let config = EngineConfig::default().with_base_backoff(Duration::ZERO);
        let (engine, store) = engine_with(Arc::clone(&remote), Connectivity::new(true), config);

        let session_id = SessionId::new();
        store
            .enqueue_mutation(OperationKind::Update, &progress(session_id, 1))
            .await
            .unwrap();

        remote.set_unreachable(true);
        for expected_retries in 1..=3 {
            engine.sync().await.unwrap();
            let queue = store.list_queue().await.unwrap();
            assert_eq!(queue.len(), 1);
            assert_eq!(queue[0].retries, expected_retries);
        }

        // Fourth pass drops it without another attempt, even though the
        // remote is back.
        remote.set_unreachable(false);
        let summary = engine.sync().await.unwrap();
        assert_eq!(summary.dead_lettered, 1);
        assert!(store.list_queue().await.unwrap().is_empty());
        assert!(remote
            .document("progress", RemoteKey::session(session_id))
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn backoff_defers_failed_items_to_later_passes() {
        let remote = Arc::new(MemoryRemote::new());
        let config = EngineConfig::default().with_base_backoff(Duration::from_secs(3600));
        let (engine, store) = engine_with(Arc::clone(&remote), Connectivity::new(true), config);

        let session_id = SessionId::new();
        store
            .enqueue_mutation(OperationKind::Update, &progress(session_id, 1))
            .await
            .unwrap();

        remote.fail_next(1);
        let summary = engine.sync().await.unwrap();
        assert_eq!(summary.mutations_failed, 1);

        // Backoff window has not elapsed: the item is skipped, not retried
        let summary = engine.sync().await.unwrap();
        assert_eq!(summary.mutations_applied, 0);
        assert_eq!(summary.mutations_failed, 0);
        assert_eq!(store.list_queue().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_failing_item_does_not_block_later_items() {
        let remote = Arc::new(MemoryRemote::new());
        let config = EngineConfig::default().with_base_backoff(Duration::from_secs(3600));
        let (engine, store) = engine_with(Arc::clone(&remote), Connectivity::new(true), config);

        let blocked = SessionId::new();
        let healthy = SessionId::new();
        store
            .enqueue_mutation(OperationKind::Update, &progress(blocked, 1))
            .await
            .unwrap();
        store
            .enqueue_mutation(OperationKind::Update, &progress(healthy, 2))
            .await
            .unwrap();

        remote.fail_next(1);
        let summary = engine.sync().await.unwrap();
        assert_eq!(summary.mutations_failed, 1);
        assert_eq!(summary.mutations_applied, 1);
        assert!(remote
            .document("progress", RemoteKey::session(healthy))
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconnect_triggers_a_pass() {
        let remote = Arc::new(MemoryRemote::new());
        let connectivity = Connectivity::new(false);
        let (engine, store) = engine_with(
            Arc::clone(&remote),
            connectivity.clone(),
            EngineConfig::default(),
        );

        let key = DraftKey::new(SessionId::new(), FieldId::new());
        store
            .put_draft(key, &AnswerPayload::text("queued while offline"))
            .await
            .unwrap();

        engine.start();
        connectivity.set_online(true);

        // Give the reconnect task a moment to drain
        let mut synced = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if store.get_draft(key).await.unwrap().unwrap().status == SyncStatus::Synced {
                synced = true;
                break;
            }
        }
        engine.stop();

        assert!(synced);
        assert_eq!(
            remote.upsert_count("answers", RemoteKey::field(key.session_id, key.field_id)),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queued_violation_replay_carries_current_counters() {
        let remote = Arc::new(MemoryRemote::new());
        let (engine, store) = engine_with(
            Arc::clone(&remote),
            Connectivity::new(true),
            EngineConfig::default(),
        );

        // One violation queued as a snapshot while the remote was down
        let session_id = SessionId::new();
        let counts = store
            .append_violation(session_id, ViolationEvent::now(ViolationKind::TabSwitch))
            .await
            .unwrap();
        let snapshot = ViolationsDoc {
            session_id,
            counts,
            events: store.list_violations(session_id).await.unwrap(),
            updated_at: 0,
        };
        store
            .enqueue_mutation(OperationKind::Update, &MutationPayload::Violations(snapshot))
            .await
            .unwrap();

        // A second violation lands before the queue drains; replaying the
        // older snapshot verbatim would rewind the remote counter
        store
            .append_violation(session_id, ViolationEvent::now(ViolationKind::TabSwitch))
            .await
            .unwrap();

        engine.sync().await.unwrap();

        let doc = remote
            .document("violations", RemoteKey::session(session_id))
            .expect("violations doc must exist");
        assert_eq!(doc["counts"]["tab_switches"], 2);
        assert_eq!(doc["events"].as_array().unwrap().len(), 2);
    }
}
