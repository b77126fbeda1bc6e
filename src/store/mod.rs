//! Persistence for telemetry documents.
//!
//! A [`DocumentStore`] is the remote destination; a [`BacklogSink`] pairs one
//! collection of it with an on-disk backlog so a failed write never loses
//! documents. [`connect`] picks the client from the store URI: MongoDB
//! connection strings go through the driver, HTTPS endpoints through the
//! data API.

pub mod backlog;
pub mod document;
pub mod http;
pub mod memory;
pub mod mongo;

use async_trait::async_trait;
use std::sync::Arc;

// Re-export commonly used types
pub use backlog::{BacklogDir, BacklogReport, BacklogSink, Delivery, SinkError};
pub use document::{Document, PredictionRecord, Provenance};
pub use http::{HttpDocumentStore, StoreConfig};
pub use memory::MemoryStore;
pub use mongo::MongoDocumentStore;

/// Remote store failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store configuration error: {0}")]
    Config(String),
    #[error("store network error: {0}")]
    Network(String),
    #[error("store server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("store rejected the write: {0}")]
    Rejected(String),
    #[error("store serialization error: {0}")]
    Serialization(String),
    #[error("store acknowledged {inserted} of {sent} documents")]
    Partial { sent: usize, inserted: usize },
}

/// A remote document collection set.
///
/// `insert_many` must be all-or-nothing from the caller's side: anything short
/// of a full acknowledgement is an error.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_many(&self, collection: &str, documents: &[Document])
        -> Result<(), StoreError>;
}

/// Client family a store URI calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// `mongodb://` or `mongodb+srv://` connection string
    Mongo,
    /// `https://` (or plain `http://`) data API endpoint
    DataApi,
}

impl StoreKind {
    /// Classify `uri` by scheme; `None` for anything unsupported.
    pub fn detect(uri: &str) -> Option<Self> {
        let uri = uri.trim().to_ascii_lowercase();
        if uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://") {
            Some(StoreKind::Mongo)
        } else if uri.starts_with("https://") || uri.starts_with("http://") {
            Some(StoreKind::DataApi)
        } else {
            None
        }
    }
}

/// Build the client `config.uri` calls for.
pub async fn connect(config: StoreConfig) -> Result<Arc<dyn DocumentStore>, StoreError> {
    match StoreKind::detect(&config.uri) {
        Some(StoreKind::Mongo) => Ok(Arc::new(MongoDocumentStore::connect(&config).await?)),
        Some(StoreKind::DataApi) => Ok(Arc::new(HttpDocumentStore::new(config)?)),
        None => Err(StoreError::Config(format!(
            "unsupported store URI '{}'",
            redact_uri(&config.uri)
        ))),
    }
}

/// Replace the userinfo part of a URI with `***`.
pub fn redact_uri(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    let authority_end = rest.find(|c: char| c == '/' || c == '?').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{scheme}://***@{}", &rest[at + 1..]),
        None => uri.to_string(),
    }
}
