//! Generic mutation queue model
//!
//! Queued mutations are replayed against the remote store when a direct write
//! could not be applied. Payloads are a closed tagged union over the known
//! remote collections, validated where a mutation is enqueued, rather than
//! free-form maps.

use serde::{Deserialize, Serialize};

use super::draft::{AnswerPayload, FieldId, SessionId};
use super::violation::{ViolationCounts, ViolationEvent};
use crate::error::{Error, Result};

/// Operation kinds replayable against a remote collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Answer document as the remote collection stores it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerDoc {
    pub session_id: SessionId,
    pub field_id: FieldId,
    pub answer: AnswerPayload,
    pub updated_at: i64,
}

/// Timer progress document keyed by the attempt record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDoc {
    pub session_id: SessionId,
    pub exam_id: String,
    pub elapsed_seconds: u32,
    pub updated_at: i64,
}

/// Violation counters plus the full event list, keyed by the attempt record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationsDoc {
    pub session_id: SessionId,
    pub counts: ViolationCounts,
    pub events: Vec<ViolationEvent>,
    pub updated_at: i64,
}

/// Typed payload of one queued mutation, tagged by target collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "collection", content = "doc", rename_all = "snake_case")]
pub enum MutationPayload {
    Answers(AnswerDoc),
    Progress(ProgressDoc),
    Violations(ViolationsDoc),
}

impl MutationPayload {
    /// Target collection name on the remote store
    #[must_use]
    pub const fn collection(&self) -> &'static str {
        match self {
            Self::Answers(_) => "answers",
            Self::Progress(_) => "progress",
            Self::Violations(_) => "violations",
        }
    }

    /// The session this mutation belongs to
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        match self {
            Self::Answers(doc) => doc.session_id,
            Self::Progress(doc) => doc.session_id,
            Self::Violations(doc) => doc.session_id,
        }
    }

    /// Secondary key within the collection, if the collection is field-keyed
    #[must_use]
    pub const fn field_id(&self) -> Option<FieldId> {
        match self {
            Self::Answers(doc) => Some(doc.field_id),
            Self::Progress(_) | Self::Violations(_) => None,
        }
    }

    /// Validate at the enqueue boundary; malformed payloads never enter the
    /// queue and are never retried.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Answers(doc) => doc.answer.validate(),
            Self::Progress(doc) => {
                if doc.exam_id.trim().is_empty() {
                    return Err(Error::InvalidInput("exam_id must not be empty".into()));
                }
                Ok(())
            }
            Self::Violations(doc) => {
                let derived = ViolationCounts::from_events(&doc.events);
                if doc.counts.tab_switches < derived.tab_switches
                    || doc.counts.paste_attempts < derived.paste_attempts
                {
                    return Err(Error::InvalidInput(
                        "violation counters must cover the event list".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// One entry in the local mutation queue.
///
/// `retries` is monotonically non-decreasing and bounded by the engine's
/// ceiling; `next_attempt_at` holds the backoff-ready time so a sync pass can
/// skip items whose window has not elapsed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMutation {
    /// Locally generated sequence id (queue insertion order)
    pub id: i64,
    pub op: OperationKind,
    pub payload: MutationPayload,
    pub retries: u32,
    /// Unix millis of the last attempt, if any
    pub last_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    /// Unix millis before which this item must not be retried
    pub next_attempt_at: i64,
}

impl QueuedMutation {
    /// Whether this item's backoff window has elapsed at `now` (Unix millis)
    #[must_use]
    pub const fn is_due(&self, now: i64) -> bool {
        self.next_attempt_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::draft::{FieldId, SessionId};
    use crate::models::violation::ViolationKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn payload_reports_collection_and_keys() {
        let session_id = SessionId::new();
        let field_id = FieldId::new();
        let payload = MutationPayload::Answers(AnswerDoc {
            session_id,
            field_id,
            answer: AnswerPayload::text("hi"),
            updated_at: 0,
        });
        assert_eq!(payload.collection(), "answers");
        assert_eq!(payload.session_id(), session_id);
        assert_eq!(payload.field_id(), Some(field_id));

        let progress = MutationPayload::Progress(ProgressDoc {
            session_id,
            exam_id: "exam-1".into(),
            elapsed_seconds: 5,
            updated_at: 0,
        });
        assert_eq!(progress.collection(), "progress");
        assert_eq!(progress.field_id(), None);
    }

    #[test]
    fn violations_payload_rejects_undercounting() {
        let session_id = SessionId::new();
        let events = vec![
            ViolationEvent { kind: ViolationKind::TabSwitch, at: 1 },
            ViolationEvent { kind: ViolationKind::TabSwitch, at: 2 },
        ];
        let bad = MutationPayload::Violations(ViolationsDoc {
            session_id,
            counts: ViolationCounts { tab_switches: 1, paste_attempts: 0 },
            events: events.clone(),
            updated_at: 0,
        });
        assert!(bad.validate().is_err());

        // Counters may exceed the event list (events can be trimmed), never trail it
        let good = MutationPayload::Violations(ViolationsDoc {
            session_id,
            counts: ViolationCounts { tab_switches: 3, paste_attempts: 0 },
            events,
            updated_at: 0,
        });
        good.validate().unwrap();
    }

    #[test]
    fn empty_exam_id_is_rejected() {
        let payload = MutationPayload::Progress(ProgressDoc {
            session_id: SessionId::new(),
            exam_id: "  ".into(),
            elapsed_seconds: 0,
            updated_at: 0,
        });
        assert!(payload.validate().is_err());
    }

    #[test]
    fn queue_item_backoff_window() {
        let item = QueuedMutation {
            id: 1,
            op: OperationKind::Update,
            payload: MutationPayload::Progress(ProgressDoc {
                session_id: SessionId::new(),
                exam_id: "exam-1".into(),
                elapsed_seconds: 1,
                updated_at: 0,
            }),
            retries: 1,
            last_attempt_at: Some(1_000),
            last_error: Some("timeout".into()),
            next_attempt_at: 3_000,
        };
        assert!(!item.is_due(2_999));
        assert!(item.is_due(3_000));
    }
}
