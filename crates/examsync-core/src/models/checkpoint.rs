//! Session timer checkpoints

use serde::{Deserialize, Serialize};

use super::draft::SessionId;

/// Locally durable cache of a timed attempt's elapsed time.
///
/// `elapsed_seconds` is driven by the session clock's running accumulator
/// (never re-derived from wall clock alone) and is monotonically
/// non-decreasing; `synced_elapsed_seconds` tracks what the remote last
/// confirmed and may lag, but never exceeds, the local value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub session_id: SessionId,
    /// Parent exam identifier (opaque to the engine)
    pub exam_id: String,
    pub elapsed_seconds: u32,
    pub synced_elapsed_seconds: u32,
    /// Unix millis of the latest local checkpoint write
    pub updated_at: i64,
}

impl SessionCheckpoint {
    /// Create a checkpoint for a session that just started
    #[must_use]
    pub fn new(session_id: SessionId, exam_id: impl Into<String>) -> Self {
        Self {
            session_id,
            exam_id: exam_id.into(),
            elapsed_seconds: 0,
            synced_elapsed_seconds: 0,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Advance the accumulator. Values below the current one are ignored so a
    /// stale writer can never move the clock backwards.
    pub fn advance_to(&mut self, elapsed_seconds: u32) {
        if elapsed_seconds > self.elapsed_seconds {
            self.elapsed_seconds = elapsed_seconds;
            self.updated_at = chrono::Utc::now().timestamp_millis();
        }
    }

    /// Record a remote confirmation, clamped to the local accumulator.
    pub fn confirm_synced(&mut self, elapsed_seconds: u32) {
        let clamped = elapsed_seconds.min(self.elapsed_seconds);
        if clamped > self.synced_elapsed_seconds {
            self.synced_elapsed_seconds = clamped;
        }
    }
}
