//! Violation capture and telemetry

use crate::db::StoreService;
use crate::error::Result;
use crate::models::{
    MutationPayload, OperationKind, SessionId, ViolationCounts, ViolationEvent, ViolationKind,
    ViolationsDoc,
};
use crate::remote::{RemoteKey, SharedRemote};

/// Accumulates anti-cheating violations for one attempt.
///
/// Events are append-only in the local store; counters are derived by
/// aggregation, so they can only grow for the life of the session. Each
/// recorded violation immediately attempts a remote update of the counters
/// alongside the full event list; on failure the freshest snapshot is queued
/// for the sync engine, superseding any older queued snapshot, so a retry can
/// never regress the counters.
#[derive(Clone)]
pub struct ViolationMonitor {
    store: StoreService,
    remote: SharedRemote,
    session_id: SessionId,
}

impl ViolationMonitor {
    #[must_use]
    pub const fn new(store: StoreService, remote: SharedRemote, session_id: SessionId) -> Self {
        Self {
            store,
            remote,
            session_id,
        }
    }

    /// Record one observed violation, returning the updated counters
    pub async fn record(&self, kind: ViolationKind) -> Result<ViolationCounts> {
        let counts = self
            .store
            .append_violation(self.session_id, ViolationEvent::now(kind))
            .await?;
        let events = self.store.list_violations(self.session_id).await?;

        let doc = ViolationsDoc {
            session_id: self.session_id,
            counts,
            events,
            updated_at: chrono::Utc::now().timestamp_millis(),
        };

        let pushed = self
            .remote
            .upsert(
                "violations",
                RemoteKey::session(self.session_id),
                serde_json::to_value(&doc)?,
            )
            .await;

        // Any snapshot queued earlier is now stale; this one covers it.
        self.store
            .remove_queue_for_collection(self.session_id, "violations")
            .await?;

        if let Err(error) = pushed {
            tracing::debug!(
                session = %self.session_id,
                %error,
                "violation push failed, queued for sync"
            );
            self.store
                .enqueue_mutation(OperationKind::Update, &MutationPayload::Violations(doc))
                .await?;
        }

        Ok(counts)
    }

    /// Current aggregate counters
    pub async fn counts(&self) -> Result<ViolationCounts> {
        let events = self.store.list_violations(self.session_id).await?;
        Ok(ViolationCounts::from_events(&events))
    }
}
