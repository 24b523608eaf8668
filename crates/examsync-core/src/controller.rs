//! Top-level wiring of the engine's components
//!
//! One explicitly constructed controller owns the store handle, the draft
//! writer, the sync engine, and the finalizer, and spawns session tasks.
//! Background work starts and stops with this owner; nothing lives in
//! module-level globals.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::db::StoreService;
use crate::error::Result;
use crate::remote::{Connectivity, SharedRemote};
use crate::session::{SessionConfig, SessionHandle, SessionRunner, SubmissionFinalizer};
use crate::sync::SyncEngine;
use crate::writer::DraftWriter;

/// Owner of the offline sync machinery for one client
pub struct ExamClient {
    store: StoreService,
    connectivity: Connectivity,
    writer: DraftWriter,
    engine: SyncEngine,
    finalizer: SubmissionFinalizer,
    runner: SessionRunner,
}

impl ExamClient {
    /// Wire up the engine over the given store and remote
    #[must_use]
    pub fn new(
        store: StoreService,
        remote: SharedRemote,
        connectivity: Connectivity,
        config: EngineConfig,
    ) -> Self {
        let writer = DraftWriter::new(
            store.clone(),
            Arc::clone(&remote),
            connectivity.clone(),
            config.debounce(),
        );
        let engine = SyncEngine::new(
            store.clone(),
            Arc::clone(&remote),
            connectivity.clone(),
            config.clone(),
        );
        let finalizer = SubmissionFinalizer::new(
            store.clone(),
            Arc::clone(&remote),
            writer.clone(),
            engine.clone(),
        );
        let runner = SessionRunner::new(
            store.clone(),
            remote,
            connectivity.clone(),
            writer.clone(),
            finalizer.clone(),
            config.checkpoint_flush_ticks,
        );

        Self {
            store,
            connectivity,
            writer,
            engine,
            finalizer,
            runner,
        }
    }

    /// Start background sync (periodic pass + reconnect trigger)
    pub fn start(&self) {
        self.engine.start();
    }

    /// Stop all background sync tasks
    pub fn stop(&self) {
        self.engine.stop();
    }

    /// Begin (or resume) a timed attempt
    pub async fn begin_session(&self, config: SessionConfig) -> Result<SessionHandle> {
        self.runner.start(config).await
    }

    #[must_use]
    pub const fn store(&self) -> &StoreService {
        &self.store
    }

    #[must_use]
    pub const fn writer(&self) -> &DraftWriter {
        &self.writer
    }

    #[must_use]
    pub const fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    #[must_use]
    pub const fn finalizer(&self) -> &SubmissionFinalizer {
        &self.finalizer
    }

    #[must_use]
    pub const fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }
}
