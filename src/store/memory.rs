//! In-process document store.
//!
//! Used by tests and dry runs. Can be switched into a failing mode to
//! simulate an outage.

use crate::store::document::Document;
use crate::store::{DocumentStore, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Document>>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl MemoryStore {
    /// An empty, healthy store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following insert fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Documents stored in `collection`, in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .lock()
            .map(|c| c.get(collection).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Number of insert calls, failed ones included.
    pub fn insert_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_many(
        &self,
        collection: &str,
        documents: &[Document],
    ) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Network("store offline".to_string()));
        }
        let mut collections = self
            .collections
            .lock()
            .map_err(|_| StoreError::Network("store lock poisoned".to_string()))?;
        collections
            .entry(collection.to_string())
            .or_default()
            .extend_from_slice(documents);
        Ok(())
    }
}
