//! Data models for examsync

mod checkpoint;
mod draft;
mod mutation;
mod violation;

pub use checkpoint::SessionCheckpoint;
pub use draft::{AnswerPayload, DraftKey, DraftRecord, FieldId, SessionId, SyncStatus};
pub use mutation::{
    AnswerDoc, MutationPayload, OperationKind, ProgressDoc, QueuedMutation, ViolationsDoc,
};
pub use violation::{ViolationCounts, ViolationEvent, ViolationKind};
