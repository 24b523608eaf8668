//! Remote store abstraction
//!
//! The engine treats the backend as an opaque key-addressed upsert/RPC
//! service. Both operations must be idempotent: re-sending an identical
//! upsert after success is a no-op, and finalizing an already-terminal
//! attempt reports success.

mod http;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use crate::models::{FieldId, SessionId};

pub use http::HttpRemoteStore;
pub use memory::MemoryRemote;

/// Remote addressing: every document is keyed by its attempt, field-level
/// collections additionally by the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteKey {
    pub session_id: SessionId,
    pub field_id: Option<FieldId>,
}

impl RemoteKey {
    #[must_use]
    pub const fn session(session_id: SessionId) -> Self {
        Self {
            session_id,
            field_id: None,
        }
    }

    #[must_use]
    pub const fn field(session_id: SessionId, field_id: FieldId) -> Self {
        Self {
            session_id,
            field_id: Some(field_id),
        }
    }
}

/// Operations the engine needs from the remote authority
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Idempotent upsert of one document into a named collection
    async fn upsert(
        &self,
        collection: &str,
        key: RemoteKey,
        payload: serde_json::Value,
    ) -> Result<()>;

    /// Delete one document from a named collection
    async fn delete(&self, collection: &str, key: RemoteKey) -> Result<()>;

    /// Idempotent terminal transition of one attempt. Finalizing an attempt
    /// that is already terminal is a no-op success.
    async fn finalize(&self, session_id: SessionId) -> Result<()>;

    /// Remote-confirmed elapsed seconds for an attempt, if the record exists
    async fn fetch_elapsed(&self, session_id: SessionId) -> Result<Option<u32>>;
}

/// Shared handle to a remote store implementation
pub type SharedRemote = Arc<dyn RemoteStore>;

/// Online/offline signal fed by the host (browser events, CLI flag, tests).
///
/// The sync engine watches this to skip passes while offline and to trigger
/// an immediate pass on reconnect.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Report a connectivity change
    pub fn set_online(&self, online: bool) {
        if self.tx.send_replace(online) != online {
            tracing::debug!(online, "connectivity changed");
        }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Subscribe to connectivity changes
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}
