//! Anti-cheating violation events and counters

use serde::{Deserialize, Serialize};

/// Kind of detected anti-cheating signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// The attempt's tab/window lost visibility
    TabSwitch,
    /// A clipboard paste was blocked
    PasteAttempt,
}

impl ViolationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TabSwitch => "tab_switch",
            Self::PasteAttempt => "paste_attempt",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tab_switch" => Some(Self::TabSwitch),
            "paste_attempt" => Some(Self::PasteAttempt),
            _ => None,
        }
    }
}

/// An immutable, append-only violation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationEvent {
    pub kind: ViolationKind,
    /// Unix millis at which the violation was observed
    pub at: i64,
}

impl ViolationEvent {
    #[must_use]
    pub fn now(kind: ViolationKind) -> Self {
        Self {
            kind,
            at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Per-kind violation counters.
///
/// Counters only ever grow for the life of a session; retries and
/// reconnections replay snapshots but never decrement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationCounts {
    pub tab_switches: u32,
    pub paste_attempts: u32,
}

impl ViolationCounts {
    /// Record one violation, returning the updated counts
    #[must_use]
    pub const fn record(mut self, kind: ViolationKind) -> Self {
        match kind {
            ViolationKind::TabSwitch => self.tab_switches += 1,
            ViolationKind::PasteAttempt => self.paste_attempts += 1,
        }
        self
    }

    /// Aggregate counts from an event list
    #[must_use]
    pub fn from_events(events: &[ViolationEvent]) -> Self {
        events
            .iter()
            .fold(Self::default(), |counts, event| counts.record(event.kind))
    }

    #[must_use]
    pub const fn total(self) -> u32 {
        self.tab_switches + self.paste_attempts
    }
}
