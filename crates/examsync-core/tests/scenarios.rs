//! End-to-end scenarios for the offline sync engine

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use examsync_core::config::EngineConfig;
use examsync_core::controller::ExamClient;
use examsync_core::db::StoreService;
use examsync_core::models::{AnswerPayload, DraftKey, FieldId, SessionId, SyncStatus, ViolationKind};
use examsync_core::remote::{Connectivity, MemoryRemote, RemoteKey, RemoteStore};
use examsync_core::session::{SessionConfig, SessionEvent, SessionPhase};
use pretty_assertions::assert_eq;

const TICK: Duration = Duration::from_millis(20);

fn client_with(remote: Arc<MemoryRemote>, online: bool) -> ExamClient {
    let store = StoreService::in_memory().unwrap();
    let config = EngineConfig::default()
        .with_debounce(Duration::from_millis(30))
        .with_sync_interval(Duration::from_millis(100));
    ExamClient::new(store, remote, Connectivity::new(online), config)
}

async fn wait_for_status(store: &StoreService, key: DraftKey, wanted: SyncStatus) {
    for _ in 0..200 {
        let status = store.get_draft(key).await.unwrap().map(|r| r.status);
        if status == Some(wanted) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for draft status {wanted:?}");
}

/// Scenario A: an answer typed right before going offline survives locally
/// and reaches the remote exactly once after reconnection.
#[tokio::test(flavor = "multi_thread")]
async fn offline_edit_syncs_once_after_reconnect() {
    let remote = Arc::new(MemoryRemote::new());
    let client = client_with(Arc::clone(&remote), false);
    client.start();

    let key = DraftKey::new(SessionId::new(), FieldId::new());
    let remote_key = RemoteKey::field(key.session_id, key.field_id);

    client
        .writer()
        .write(key, AnswerPayload::text("my answer"))
        .unwrap();

    // Debounce elapses while offline: durable locally, nothing on the wire
    tokio::time::sleep(Duration::from_millis(150)).await;
    let record = client.store().get_draft(key).await.unwrap().unwrap();
    assert_eq!(record.status, SyncStatus::Pending);
    assert_eq!(remote.upsert_count("answers", remote_key), 0);

    client.connectivity().set_online(true);

    wait_for_status(client.store(), key, SyncStatus::Synced).await;

    assert_eq!(remote.upsert_count("answers", remote_key), 1);
    client.stop();
}

/// Scenario B: the timer reaching zero flushes every field's latest local
/// state, blanks included, and finalizes exactly once from the auto-submit
/// path.
#[tokio::test(flavor = "multi_thread")]
async fn auto_submit_flushes_all_fields_and_finalizes_once() {
    let remote = Arc::new(MemoryRemote::new());
    let client = client_with(Arc::clone(&remote), true);

    let session_id = SessionId::new();
    let fields: Vec<FieldId> = (0..5).map(|_| FieldId::new()).collect();

    // 2 answered, 3 left blank
    for (i, field_id) in fields.iter().enumerate() {
        let payload = if i < 2 {
            AnswerPayload::text(format!("answer {i}"))
        } else {
            AnswerPayload::blank()
        };
        client
            .writer()
            .write(DraftKey::new(session_id, *field_id), payload)
            .unwrap();
    }

    let config =
        SessionConfig::new(session_id, "exam-1", Duration::from_secs(3)).with_tick(TICK);
    let handle = client.begin_session(config).await.unwrap();
    let mut events = handle.subscribe();

    handle.wait().await;
    assert_eq!(handle.phase(), SessionPhase::Submitted);

    // The tick stream can outrun the broadcast buffer; lag only drops the
    // oldest events, and the one we want is near the end.
    let mut saw_auto_submit = false;
    loop {
        match events.try_recv() {
            Ok(SessionEvent::AutoSubmitStarted) => saw_auto_submit = true,
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    assert!(saw_auto_submit, "auto-submit event not emitted");

    assert!(remote.is_finalized(session_id));
    assert_eq!(remote.finalize_calls(), 1);
    for field_id in &fields {
        assert_eq!(
            remote.upsert_count("answers", RemoteKey::field(session_id, *field_id)),
            1,
            "every field, blank or not, is flushed exactly once"
        );
    }
}

/// Scenario C: violation counters reach the remote intact regardless of how
/// many pushes failed in between.
#[tokio::test(flavor = "multi_thread")]
async fn violation_counters_survive_retries() {
    let remote = Arc::new(MemoryRemote::new());
    let client = client_with(Arc::clone(&remote), true);

    let session_id = SessionId::new();
    let config = SessionConfig::new(session_id, "exam-1", Duration::from_secs(3600))
        .with_tick(Duration::from_secs(3600));
    let handle = client.begin_session(config).await.unwrap();
    let mut events = handle.subscribe();

    // First tab switch lands; the second plus the paste hit a dead remote
    handle.record_violation(ViolationKind::TabSwitch).await;
    remote.set_unreachable(true);
    handle.record_violation(ViolationKind::TabSwitch).await;
    handle.record_violation(ViolationKind::PasteAttempt).await;

    // Wait until all three are recorded locally
    let mut recorded = 0;
    while recorded < 3 {
        if let Ok(SessionEvent::ViolationRecorded { .. }) = events.recv().await {
            recorded += 1;
        }
    }

    remote.set_unreachable(false);
    client.engine().sync().await.unwrap();

    let doc = remote
        .document("violations", RemoteKey::session(session_id))
        .expect("violations doc must exist");
    assert_eq!(doc["counts"]["tab_switches"], 2);
    assert_eq!(doc["counts"]["paste_attempts"], 1);

    handle.stop().await;
    handle.wait().await;
}

/// Scenario D: duplicate finalize calls produce one terminal state; the
/// second call is a success, not an error.
#[tokio::test(flavor = "multi_thread")]
async fn duplicate_finalize_is_harmless() {
    let remote = Arc::new(MemoryRemote::new());
    let client = client_with(Arc::clone(&remote), true);

    let session_id = SessionId::new();
    client
        .writer()
        .write(
            DraftKey::new(session_id, FieldId::new()),
            AnswerPayload::text("42"),
        )
        .unwrap();

    client.finalizer().finalize(session_id).await.unwrap();
    // A second submission attempt (crash/reload, manual click after auto)
    client.finalizer().finalize(session_id).await.unwrap();

    assert!(remote.is_finalized(session_id));
}

/// An attempt resumed after its time already ran out goes straight to
/// auto-submit; no extra answering window opens.
#[tokio::test(flavor = "multi_thread")]
async fn expired_resume_submits_immediately() {
    let remote = Arc::new(MemoryRemote::new());
    let session_id = SessionId::new();
    remote
        .upsert(
            "progress",
            RemoteKey::session(session_id),
            serde_json::json!({"elapsed_seconds": 600}),
        )
        .await
        .unwrap();

    let client = client_with(Arc::clone(&remote), true);
    let config = SessionConfig::new(session_id, "exam-1", Duration::from_secs(600))
        .with_tick(Duration::from_secs(3600));
    let handle = client.begin_session(config).await.unwrap();

    handle.wait().await;
    assert_eq!(handle.phase(), SessionPhase::Submitted);
    assert!(remote.is_finalized(session_id));
}

/// A session resumed from a checkpoint keeps the clock monotonic: the larger
/// of the local and remote elapsed values wins.
#[tokio::test(flavor = "multi_thread")]
async fn resumed_session_does_not_rewind_the_clock() {
    let remote = Arc::new(MemoryRemote::new());
    let session_id = SessionId::new();

    // Remote believes 40s elapsed (an earlier flush from a lost device)
    remote
        .upsert(
            "progress",
            RemoteKey::session(session_id),
            serde_json::json!({"elapsed_seconds": 40}),
        )
        .await
        .unwrap();

    let client = client_with(Arc::clone(&remote), true);
    let config = SessionConfig::new(session_id, "exam-1", Duration::from_secs(3600))
        .with_tick(Duration::from_secs(3600));
    let handle = client.begin_session(config).await.unwrap();

    // Subscribers may attach after the task already announced itself, so the
    // phase watch is the reliable signal that the session is live.
    let mut phase = handle.phase_watch();
    while *phase.borrow() != SessionPhase::Running {
        phase.changed().await.unwrap();
    }

    let checkpoint = client
        .store()
        .get_checkpoint(session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.elapsed_seconds, 40);

    handle.stop().await;
    handle.wait().await;
}
