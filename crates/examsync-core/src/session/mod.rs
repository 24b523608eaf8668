//! Timed attempt session: clock, violation capture, submission
//!
//! The session runs as a dedicated background task owning the one-second
//! tick and the state machine; the UI talks to it over a command channel and
//! listens on a broadcast of session events.

mod finalizer;
mod monitor;
mod runner;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{SessionId, ViolationCounts, ViolationKind};

pub use finalizer::SubmissionFinalizer;
pub use monitor::ViolationMonitor;
pub use runner::{SessionHandle, SessionRunner};

/// Phases of one timed attempt.
///
/// `Initializing → Running → Submitting → {Submitted | Failed}`. The two
/// rightmost phases are terminal for this process; `Failed` leaves local
/// state intact so a reload can re-enter `Submitting` and retry finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Initializing,
    Running,
    Submitting,
    Submitted,
    Failed,
}

impl SessionPhase {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Submitted | Self::Failed)
    }
}

/// Static description of the attempt being run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub session_id: SessionId,
    /// Parent exam identifier (opaque to the engine)
    pub exam_id: String,
    /// Total allowed duration of the attempt
    pub duration: Duration,
    /// Length of one clock tick. One tick advances the elapsed counter by
    /// one second; anything other than one second compresses or stretches
    /// the attempt (used by tests and the CLI simulation).
    pub tick: Duration,
}

impl SessionConfig {
    #[must_use]
    pub fn new(session_id: SessionId, exam_id: impl Into<String>, duration: Duration) -> Self {
        Self {
            session_id,
            exam_id: exam_id.into(),
            duration,
            tick: Duration::from_secs(1),
        }
    }

    /// Override the tick length (accelerated clocks in tests/simulations)
    #[must_use]
    pub const fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

/// Commands accepted by the session task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// A violation was observed by the host (visibility change, blocked paste)
    Violation(ViolationKind),
    /// Explicit user submission
    Submit,
    /// Tear down the session task without submitting
    Stop,
}

/// Events broadcast by the session task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The attempt entered `Running`
    Started { remaining_seconds: u32 },
    /// One second elapsed
    Tick {
        elapsed_seconds: u32,
        remaining_seconds: u32,
    },
    /// The elapsed counter was flushed to the remote
    CheckpointFlushed { elapsed_seconds: u32 },
    /// A violation was recorded and its counters updated
    ViolationRecorded {
        kind: ViolationKind,
        counts: ViolationCounts,
    },
    /// The timer hit zero; submission starts without user input
    AutoSubmitStarted,
    /// Finalize succeeded; the attempt is terminal
    Submitted,
    /// Finalize failed; local state kept for a retry
    SubmitFailed { error: String },
}
