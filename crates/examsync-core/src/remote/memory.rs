//! In-memory remote store
//!
//! Backs the CLI's simulated attempt and the test suite. Records every call
//! so tests can assert exact network traffic, and supports failure/offline
//! injection.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::SessionId;

use super::{RemoteKey, RemoteStore};

#[derive(Default)]
struct Inner {
    documents: HashMap<(String, RemoteKey), serde_json::Value>,
    finalized: HashSet<String>,
    upsert_log: Vec<(String, RemoteKey)>,
    finalize_calls: u32,
    /// Fail this many upcoming calls, then recover
    fail_next: u32,
    /// Fail every call until cleared
    unreachable: bool,
}

/// Remote store held entirely in memory
#[derive(Default)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
}

impl MemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with a network error
    pub fn fail_next(&self, n: u32) {
        self.inner.lock().unwrap().fail_next = n;
    }

    /// Toggle hard unreachability (every call fails until cleared)
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unwrap().unreachable = unreachable;
    }

    /// The stored document for a key, if any
    #[must_use]
    pub fn document(&self, collection: &str, key: RemoteKey) -> Option<serde_json::Value> {
        self.inner
            .lock()
            .unwrap()
            .documents
            .get(&(collection.to_string(), key))
            .cloned()
    }

    /// How many upserts were attempted for a key (successes only)
    #[must_use]
    pub fn upsert_count(&self, collection: &str, key: RemoteKey) -> usize {
        let target = (collection.to_string(), key);
        self.inner
            .lock()
            .unwrap()
            .upsert_log
            .iter()
            .filter(|entry| **entry == target)
            .count()
    }

    /// Total number of finalize calls received, including no-op repeats
    #[must_use]
    pub fn finalize_calls(&self) -> u32 {
        self.inner.lock().unwrap().finalize_calls
    }

    /// Whether an attempt reached the terminal state
    #[must_use]
    pub fn is_finalized(&self, session_id: SessionId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .finalized
            .contains(&session_id.as_str())
    }

    fn check_reachable(inner: &mut Inner) -> Result<()> {
        if inner.unreachable {
            return Err(Error::Network("remote unreachable".into()));
        }
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(Error::Network("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn upsert(
        &self,
        collection: &str,
        key: RemoteKey,
        payload: serde_json::Value,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_reachable(&mut inner)?;

        inner.upsert_log.push((collection.to_string(), key));
        inner
            .documents
            .insert((collection.to_string(), key), payload);
        Ok(())
    }

    async fn delete(&self, collection: &str, key: RemoteKey) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_reachable(&mut inner)?;

        inner.documents.remove(&(collection.to_string(), key));
        Ok(())
    }

    async fn finalize(&self, session_id: SessionId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_reachable(&mut inner)?;

        inner.finalize_calls += 1;
        // Idempotent terminal transition: repeats are no-op successes
        inner.finalized.insert(session_id.as_str());
        Ok(())
    }

    async fn fetch_elapsed(&self, session_id: SessionId) -> Result<Option<u32>> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_reachable(&mut inner)?;

        let doc = inner
            .documents
            .get(&("progress".to_string(), RemoteKey::session(session_id)))
            .cloned();
        Ok(doc
            .as_ref()
            .and_then(|d| d.get("elapsed_seconds"))
            .and_then(serde_json::Value::as_u64)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX)))
    }
}
