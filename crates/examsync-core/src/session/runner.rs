//! Session clock task

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::db::StoreService;
use crate::error::Result;
use crate::models::{ProgressDoc, SessionCheckpoint, SessionId};
use crate::remote::{Connectivity, RemoteKey, SharedRemote};
use crate::writer::DraftWriter;

use super::finalizer::SubmissionFinalizer;
use super::monitor::ViolationMonitor;
use super::{SessionCommand, SessionConfig, SessionEvent, SessionPhase};

/// Spawns and owns the background task for one timed attempt.
///
/// The task drives the countdown, checkpoints elapsed time, records
/// violations, and auto-submits at zero remaining. The host communicates
/// over the returned [`SessionHandle`] only.
pub struct SessionRunner {
    store: StoreService,
    remote: SharedRemote,
    connectivity: Connectivity,
    writer: DraftWriter,
    finalizer: SubmissionFinalizer,
    checkpoint_flush_ticks: u32,
}

impl SessionRunner {
    #[must_use]
    pub const fn new(
        store: StoreService,
        remote: SharedRemote,
        connectivity: Connectivity,
        writer: DraftWriter,
        finalizer: SubmissionFinalizer,
        checkpoint_flush_ticks: u32,
    ) -> Self {
        Self {
            store,
            remote,
            connectivity,
            writer,
            finalizer,
            checkpoint_flush_ticks,
        }
    }

    /// Initialize and start the session task.
    ///
    /// Elapsed time resumes from the larger of the local checkpoint and the
    /// remote-confirmed value, so neither a missed flush nor a lost local
    /// store can run the clock backwards.
    pub async fn start(&self, config: SessionConfig) -> Result<SessionHandle> {
        let session_id = config.session_id;

        let mut checkpoint = self
            .store
            .get_checkpoint(session_id)
            .await?
            .unwrap_or_else(|| SessionCheckpoint::new(session_id, config.exam_id.clone()));

        let remote_elapsed = if self.connectivity.is_online() {
            match self.remote.fetch_elapsed(session_id).await {
                Ok(value) => value.unwrap_or(0),
                Err(error) => {
                    tracing::warn!(session = %session_id, %error,
                        "could not fetch remote elapsed time, using local checkpoint");
                    0
                }
            }
        } else {
            0
        };
        checkpoint.advance_to(checkpoint.elapsed_seconds.max(remote_elapsed));
        self.store.put_checkpoint(&checkpoint).await?;

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (events_tx, _) = broadcast::channel(64);
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Initializing);

        let task = SessionTask {
            config,
            checkpoint,
            store: self.store.clone(),
            connectivity: self.connectivity.clone(),
            remote: Arc::clone(&self.remote),
            monitor: ViolationMonitor::new(
                self.store.clone(),
                Arc::clone(&self.remote),
                session_id,
            ),
            writer: self.writer.clone(),
            finalizer: self.finalizer.clone(),
            checkpoint_flush_ticks: self.checkpoint_flush_ticks.max(1),
            events: events_tx.clone(),
            phase: phase_tx,
        };
        let join = tokio::spawn(task.run(commands_rx));

        Ok(SessionHandle {
            session_id,
            commands: commands_tx,
            events: events_tx,
            phase: phase_rx,
            task: Arc::new(Mutex::new(Some(join))),
        })
    }
}

/// Host-facing handle to a running session task
#[derive(Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    commands: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    phase: watch::Receiver<SessionPhase>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionHandle {
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Current phase of the attempt
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    /// Watch phase transitions
    #[must_use]
    pub fn phase_watch(&self) -> watch::Receiver<SessionPhase> {
        self.phase.clone()
    }

    async fn send(&self, command: SessionCommand) {
        // A closed channel means the task already reached a terminal phase;
        // late commands are intentionally dropped.
        if self.commands.send(command).await.is_err() {
            tracing::debug!(session = %self.session_id, ?command, "session task already finished");
        }
    }

    /// Report an observed violation (visibility change, blocked paste)
    pub async fn record_violation(&self, kind: crate::models::ViolationKind) {
        self.send(SessionCommand::Violation(kind)).await;
    }

    /// Explicit user submission
    pub async fn submit(&self) {
        self.send(SessionCommand::Submit).await;
    }

    /// Tear the session task down without submitting. An auto-submit already
    /// in flight still runs to completion.
    pub async fn stop(&self) {
        self.send(SessionCommand::Stop).await;
    }

    /// Wait for the session task to finish
    pub async fn wait(&self) {
        let join = self.task.lock().unwrap().take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

struct SessionTask {
    config: SessionConfig,
    checkpoint: SessionCheckpoint,
    store: StoreService,
    remote: SharedRemote,
    connectivity: Connectivity,
    monitor: ViolationMonitor,
    writer: DraftWriter,
    finalizer: SubmissionFinalizer,
    checkpoint_flush_ticks: u32,
    events: broadcast::Sender<SessionEvent>,
    phase: watch::Sender<SessionPhase>,
}

impl SessionTask {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn total_seconds(&self) -> u32 {
        u32::try_from(self.config.duration.as_secs()).unwrap_or(u32::MAX)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        let total = self.total_seconds();
        let mut remaining = total.saturating_sub(self.checkpoint.elapsed_seconds);

        let _ = self.phase.send(SessionPhase::Running);
        self.emit(SessionEvent::Started {
            remaining_seconds: remaining,
        });

        // A resumed attempt may already be out of time
        if remaining == 0 {
            self.submit(true).await;
            return;
        }

        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await; // immediate first tick
        let mut ticks_since_flush = 0u32;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let elapsed = self.checkpoint.elapsed_seconds.saturating_add(1);
                    self.checkpoint.advance_to(elapsed);
                    if let Err(error) = self.store.put_checkpoint(&self.checkpoint).await {
                        tracing::warn!(session = %self.config.session_id, %error,
                            "failed to persist timer checkpoint");
                    }

                    remaining = total.saturating_sub(elapsed);
                    self.emit(SessionEvent::Tick {
                        elapsed_seconds: elapsed,
                        remaining_seconds: remaining,
                    });

                    ticks_since_flush += 1;
                    if ticks_since_flush >= self.checkpoint_flush_ticks {
                        ticks_since_flush = 0;
                        self.flush_progress().await;
                    }

                    if remaining == 0 {
                        self.submit(true).await;
                        return;
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(SessionCommand::Violation(kind)) => {
                            match self.monitor.record(kind).await {
                                Ok(counts) => self.emit(SessionEvent::ViolationRecorded { kind, counts }),
                                Err(error) => tracing::warn!(
                                    session = %self.config.session_id, %error,
                                    "failed to record violation"),
                            }
                        }
                        Some(SessionCommand::Submit) => {
                            self.submit(false).await;
                            return;
                        }
                        Some(SessionCommand::Stop) | None => return,
                    }
                }
            }
        }
    }

    /// Best-effort flush of the elapsed counter to the remote. Failures are
    /// swallowed: the value is durably checkpointed locally and the next
    /// flush (or finalize) catches the remote up.
    async fn flush_progress(&mut self) {
        if !self.connectivity.is_online() {
            return;
        }

        let doc = ProgressDoc {
            session_id: self.config.session_id,
            exam_id: self.config.exam_id.clone(),
            elapsed_seconds: self.checkpoint.elapsed_seconds,
            updated_at: chrono::Utc::now().timestamp_millis(),
        };
        let payload = match serde_json::to_value(&doc) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "could not serialize progress doc");
                return;
            }
        };

        match self
            .remote
            .upsert(
                "progress",
                RemoteKey::session(self.config.session_id),
                payload,
            )
            .await
        {
            Ok(()) => {
                self.checkpoint.confirm_synced(doc.elapsed_seconds);
                if let Err(error) = self.store.put_checkpoint(&self.checkpoint).await {
                    tracing::warn!(%error, "failed to persist synced checkpoint");
                }
                self.emit(SessionEvent::CheckpointFlushed {
                    elapsed_seconds: doc.elapsed_seconds,
                });
            }
            Err(error) => {
                tracing::debug!(session = %self.config.session_id, %error,
                    "progress flush failed, will catch up on the next one");
            }
        }
    }

    /// Enter `Submitting` and drive the attempt to a terminal phase.
    /// Not cancellable once entered.
    async fn submit(&mut self, auto: bool) {
        let _ = self.phase.send(SessionPhase::Submitting);
        if auto {
            self.emit(SessionEvent::AutoSubmitStarted);
        }

        // One last remote progress flush so the final elapsed value lands
        self.flush_progress().await;
        // flush_session inside finalize also covers this, but cancelling the
        // debounce timers first closes the stale-write window sooner.
        if let Err(error) = self.writer.flush_session(self.config.session_id).await {
            tracing::warn!(session = %self.config.session_id, %error,
                "flush before finalize failed");
        }

        match self.finalizer.finalize(self.config.session_id).await {
            Ok(()) => {
                let _ = self.phase.send(SessionPhase::Submitted);
                self.emit(SessionEvent::Submitted);
            }
            Err(error) => {
                let _ = self.phase.send(SessionPhase::Failed);
                self.emit(SessionEvent::SubmitFailed {
                    error: error.to_string(),
                });
            }
        }
    }
}
