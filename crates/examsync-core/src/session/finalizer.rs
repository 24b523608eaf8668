//! Submission finalization

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::db::StoreService;
use crate::error::{Error, Result};
use crate::models::{SessionId, SyncStatus};
use crate::remote::SharedRemote;
use crate::sync::SyncEngine;
use crate::writer::DraftWriter;

/// Finalizes one attempt exactly once (semantically).
///
/// The call itself may be issued more than once: an auto-submit racing a
/// manual click, or a reload retrying a failed submit. A duplicate after a
/// successful submit is a local no-op, a concurrent duplicate inside this
/// process is dropped by the in-flight guard, and a duplicate across reloads
/// is absorbed by the remote's idempotent finalize, which reports an
/// already-terminal attempt as success.
#[derive(Clone)]
pub struct SubmissionFinalizer {
    store: StoreService,
    remote: SharedRemote,
    writer: DraftWriter,
    engine: SyncEngine,
    in_flight: Arc<AtomicBool>,
    completed: Arc<Mutex<HashSet<SessionId>>>,
}

impl SubmissionFinalizer {
    #[must_use]
    pub fn new(
        store: StoreService,
        remote: SharedRemote,
        writer: DraftWriter,
        engine: SyncEngine,
    ) -> Self {
        Self {
            store,
            remote,
            writer,
            engine,
            in_flight: Arc::new(AtomicBool::new(false)),
            completed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Flush all local state for the attempt, finalize it remotely, and purge
    /// its local records on success.
    ///
    /// On failure nothing is discarded, so a retry can finalize again. In
    /// particular, finalize refuses to run while any of the attempt's records
    /// have not been confirmed by the remote.
    pub async fn finalize(&self, session_id: SessionId) -> Result<()> {
        if self.completed.lock().unwrap().contains(&session_id) {
            tracing::debug!(session = %session_id, "attempt already submitted, ignoring duplicate");
            return Ok(());
        }
        if self.in_flight.swap(true, Ordering::SeqCst) {
            // A concurrent duplicate (manual click racing auto-submit) is a
            // harmless no-op; the first call carries the submission.
            tracing::debug!(session = %session_id, "finalize already in flight");
            return Ok(());
        }

        let result = self.run(session_id).await;
        if result.is_ok() {
            self.completed.lock().unwrap().insert(session_id);
        }
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn run(&self, session_id: SessionId) -> Result<()> {
        // No further edits land after this: debounce timers are cancelled and
        // every cached payload is persisted, including blanks.
        self.writer.flush_session(session_id).await?;

        // A push torn down mid-flight can strand a draft in `syncing`; make
        // those visible to the final drain again. Queued mutations waiting
        // out a backoff window are made due immediately for the same reason.
        let requeued = self.store.requeue_stuck_syncing(session_id).await?;
        if requeued > 0 {
            tracing::debug!(session = %session_id, requeued, "reset stuck syncing drafts");
        }
        self.store.expedite_queue_for_session(session_id).await?;

        if let Err(error) = self.engine.sync().await {
            tracing::warn!(session = %session_id, %error, "final drain failed before finalize");
        }

        // The drain is best-effort (it can fail per record, or no-op against
        // a pass already in flight), so purging is gated on the store: an
        // answer that never reached the remote must survive for a retry.
        let pending = self.unsynced_records(session_id).await?;
        if pending > 0 {
            return Err(Error::FinalizeIncomplete {
                session_id: session_id.as_str(),
                pending,
            });
        }

        match self.remote.finalize(session_id).await {
            Ok(()) => {}
            Err(error) if error.is_finalize_conflict() => {
                tracing::debug!(session = %session_id, "attempt already finalized remotely");
            }
            Err(error) => return Err(error),
        }

        self.store.purge_session(session_id).await?;
        tracing::info!(session = %session_id, "attempt finalized and purged");
        Ok(())
    }

    /// Count of the attempt's records still awaiting remote confirmation
    async fn unsynced_records(&self, session_id: SessionId) -> Result<usize> {
        let drafts = self
            .store
            .drafts_by_session(session_id)
            .await?
            .into_iter()
            .filter(|draft| draft.status != SyncStatus::Synced)
            .count();
        let queued = self
            .store
            .list_queue()
            .await?
            .into_iter()
            .filter(|item| item.payload.session_id() == session_id)
            .count();
        Ok(drafts + queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::models::{AnswerPayload, DraftKey, FieldId};
    use crate::remote::{Connectivity, MemoryRemote, RemoteKey};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn finalizer_with(
        remote: Arc<MemoryRemote>,
    ) -> (SubmissionFinalizer, StoreService, DraftWriter) {
        let store = StoreService::in_memory().unwrap();
        let connectivity = Connectivity::new(true);
        let writer = DraftWriter::new(
            store.clone(),
            Arc::clone(&remote) as _,
            connectivity.clone(),
            Duration::from_secs(60),
        );
        let engine = SyncEngine::new(
            store.clone(),
            Arc::clone(&remote) as _,
            connectivity,
            EngineConfig::default(),
        );
        (
            SubmissionFinalizer::new(store.clone(), remote, writer.clone(), engine),
            store,
            writer,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn finalize_flushes_drafts_and_purges() {
        let remote = Arc::new(MemoryRemote::new());
        let (finalizer, store, writer) = finalizer_with(Arc::clone(&remote));

        let session_id = SessionId::new();
        let key = DraftKey::new(session_id, FieldId::new());
        // Debounce window is long; only the flush inside finalize persists it
        writer.write(key, AnswerPayload::text("final answer")).unwrap();

        finalizer.finalize(session_id).await.unwrap();

        assert!(remote.is_finalized(session_id));
        assert_eq!(
            remote.upsert_count("answers", RemoteKey::field(session_id, key.field_id)),
            1
        );
        // Local state purged on success
        assert!(store.get_draft(key).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_finalize_keeps_local_state() {
        let remote = Arc::new(MemoryRemote::new());
        let (finalizer, store, writer) = finalizer_with(Arc::clone(&remote));

        let session_id = SessionId::new();
        let key = DraftKey::new(session_id, FieldId::new());
        writer.write(key, AnswerPayload::text("keep me")).unwrap();

        remote.set_unreachable(true);
        assert!(finalizer.finalize(session_id).await.is_err());

        assert!(!remote.is_finalized(session_id));
        assert!(store.get_draft(key).await.unwrap().is_some());

        // A retry after reconnect completes the submission
        remote.set_unreachable(false);
        finalizer.finalize(session_id).await.unwrap();
        assert!(remote.is_finalized(session_id));
        assert!(store.get_draft(key).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unsynced_answer_blocks_purge_until_it_lands() {
        let remote = Arc::new(MemoryRemote::new());
        let (finalizer, store, writer) = finalizer_with(Arc::clone(&remote));

        let session_id = SessionId::new();
        let key = DraftKey::new(session_id, FieldId::new());
        writer.write(key, AnswerPayload::text("must survive")).unwrap();

        // One transient push failure during the final drain
        remote.fail_next(1);
        let error = finalizer.finalize(session_id).await.unwrap_err();
        assert!(matches!(error, Error::FinalizeIncomplete { pending: 1, .. }));

        // Nothing was finalized or purged; the answer never left the store
        assert!(!remote.is_finalized(session_id));
        assert_eq!(
            remote.upsert_count("answers", RemoteKey::field(session_id, key.field_id)),
            0
        );
        assert!(store.get_draft(key).await.unwrap().is_some());

        // The retry drains the answer first, then finalizes and purges
        finalizer.finalize(session_id).await.unwrap();
        assert_eq!(
            remote.upsert_count("answers", RemoteKey::field(session_id, key.field_id)),
            1
        );
        assert!(remote.is_finalized(session_id));
        assert!(store.get_draft(key).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_duplicate_calls_submit_once() {
        let remote = Arc::new(MemoryRemote::new());
        let (finalizer, _store, _writer) = finalizer_with(Arc::clone(&remote));

        let session_id = SessionId::new();
        let first = finalizer.clone();
        let second = finalizer.clone();
        let (a, b) = tokio::join!(first.finalize(session_id), second.finalize(session_id));
        a.unwrap();
        b.unwrap();

        assert!(remote.is_finalized(session_id));
        // At most one terminal transition; the duplicate was a local no-op
        // whether it overlapped the first call or followed it.
        assert_eq!(remote.finalize_calls(), 1);
    }
}
