//! examsync-core - Core library for examsync
//!
//! Offline-resilient synchronization for timed assessments: a local durable
//! store of in-flight answers and telemetry, a debounced write path, a
//! background reconciliation engine with retry/backoff, and the exam-session
//! state machine (countdown, violation capture, auto-submit).

pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod session;
pub mod sync;
pub mod writer;

pub use config::EngineConfig;
pub use controller::ExamClient;
pub use error::{Error, Result};
pub use models::{AnswerPayload, DraftKey, FieldId, SessionId, SyncStatus};
