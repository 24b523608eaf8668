//! Draft answer model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Longest accepted free-text answer, in characters.
const MAX_ANSWER_CHARS: usize = 20_000;

/// A unique identifier for a timed attempt (one student taking one test),
/// using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

/// A unique identifier for one answerable field (question) within an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldId(Uuid);

macro_rules! uuid_id {
    ($name:ident) => {
        impl $name {
            /// Create a new unique ID using UUID v7
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Get the string representation of this ID
            #[must_use]
            pub fn as_str(&self) -> String {
                self.0.to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(SessionId);
uuid_id!(FieldId);

/// Composite key identifying one draft: (attempt, question)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DraftKey {
    pub session_id: SessionId,
    pub field_id: FieldId,
}

impl DraftKey {
    #[must_use]
    pub const fn new(session_id: SessionId, field_id: FieldId) -> Self {
        Self {
            session_id,
            field_id,
        }
    }
}

impl fmt::Display for DraftKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.field_id)
    }
}

/// The answer content for one field: free text, selected choices, or both
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    /// Free-text answer, if any
    #[serde(default)]
    pub text: Option<String>,
    /// Selected choice ids, if any
    #[serde(default)]
    pub selected_choices: Vec<String>,
}

impl AnswerPayload {
    /// A free-text answer
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            selected_choices: Vec::new(),
        }
    }

    /// A choice-selection answer
    #[must_use]
    pub fn choices(choices: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            text: None,
            selected_choices: choices.into_iter().map(Into::into).collect(),
        }
    }

    /// An intentionally blank answer (flushed as-is on submit)
    #[must_use]
    pub const fn blank() -> Self {
        Self {
            text: None,
            selected_choices: Vec::new(),
        }
    }

    /// Whether the payload carries no answer content
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.text.as_deref().is_none_or(|t| t.trim().is_empty())
            && self.selected_choices.is_empty()
    }

    /// Reject malformed payloads before they enter the store or queue.
    pub fn validate(&self) -> Result<()> {
        if let Some(text) = &self.text {
            if text.chars().count() > MAX_ANSWER_CHARS {
                return Err(Error::InvalidInput(format!(
                    "answer text exceeds {MAX_ANSWER_CHARS} characters"
                )));
            }
        }
        if self.selected_choices.iter().any(|c| c.trim().is_empty()) {
            return Err(Error::InvalidInput(
                "selected choice ids must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Sync state of one draft, as shown in the per-field save indicator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Written locally, not yet pushed
    #[default]
    Pending,
    /// A push for this draft is in flight
    Syncing,
    /// Remote confirmed the latest local write
    Synced,
    /// The last push failed; the sync engine will retry
    Error,
}

impl SyncStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "syncing" => Self::Syncing,
            "synced" => Self::Synced,
            "error" => Self::Error,
            _ => Self::Pending,
        }
    }
}

/// A locally cached, not-yet-confirmed answer for one question in one attempt.
///
/// At most one record exists per key; a newer local write overwrites the
/// payload and resets the status to pending (last-writer-wins at field level).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftRecord {
    pub key: DraftKey,
    pub payload: AnswerPayload,
    /// Unix millis of the latest local write
    pub written_at: i64,
    /// Unix millis of the latest remote confirmation, if any
    pub confirmed_at: Option<i64>,
    pub status: SyncStatus,
}

impl DraftRecord {
    /// Create a fresh pending draft for the given key
    #[must_use]
    pub fn new(key: DraftKey, payload: AnswerPayload) -> Self {
        Self {
            key,
            payload,
            written_at: chrono::Utc::now().timestamp_millis(),
            confirmed_at: None,
            status: SyncStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn payload_validation_rejects_oversized_text() {
        let payload = AnswerPayload::text("x".repeat(MAX_ANSWER_CHARS + 1));
        assert!(payload.validate().is_err());
    }

    #[test]
    fn payload_validation_rejects_blank_choice_ids() {
        let payload = AnswerPayload::choices(["a", "  "]);
        assert!(payload.validate().is_err());
    }

    #[test]
    fn blank_payload_is_valid_and_blank() {
        let payload = AnswerPayload::blank();
        payload.validate().unwrap();
        assert!(payload.is_blank());
        assert!(AnswerPayload::text("   ").is_blank());
        assert!(!AnswerPayload::text("42").is_blank());
    }

    #[test]
    fn sync_status_round_trips_through_strings() {
        for status in [
            SyncStatus::Pending,
            SyncStatus::Syncing,
            SyncStatus::Synced,
            SyncStatus::Error,
        ] {
            assert_eq!(SyncStatus::parse(status.as_str()), status);
        }
        assert_eq!(SyncStatus::parse("garbage"), SyncStatus::Pending);
    }

    #[test]
    fn session_id_round_trips_through_string() {
        let id = SessionId::new();
        let parsed: SessionId = id.as_str().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
