//! MongoDB driver client for the remote document store.
//!
//! Used for `mongodb://` and `mongodb+srv://` connection strings. Timestamps
//! are stored as BSON dates so the collections can be queried by time range.

use crate::store::document::Document;
use crate::store::http::StoreConfig;
use crate::store::{DocumentStore, StoreError};
use async_trait::async_trait;
use mongodb::bson::{self, DateTime as BsonDateTime};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::ClientOptions;
use mongodb::Client;
use tracing::debug;

const APP_NAME: &str = "har-central";

/// Remote store reached through the MongoDB driver.
#[derive(Debug, Clone)]
pub struct MongoDocumentStore {
    client: Client,
    database: String,
}

impl MongoDocumentStore {
    /// Parse the connection string and build a client.
    ///
    /// `mongodb+srv://` hosts are resolved here; the first server connection
    /// is made lazily by the first insert.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(config.uri.trim())
            .await
            .map_err(|e| StoreError::Config(e.to_string()))?;
        options.app_name.get_or_insert_with(|| APP_NAME.to_string());
        options.server_selection_timeout = Some(config.timeout);
        options.connect_timeout = Some(config.timeout);

        let client =
            Client::with_options(options).map_err(|e| StoreError::Config(e.to_string()))?;
        debug!(database = %config.database, "mongodb client ready");
        Ok(Self {
            client,
            database: config.database.clone(),
        })
    }

    /// Database every collection lives in.
    pub fn database(&self) -> &str {
        &self.database
    }
}

/// BSON form of a document, with its timestamp as a BSON date.
fn to_bson(document: &Document) -> Result<bson::Document, StoreError> {
    let mut doc =
        bson::to_document(document).map_err(|e| StoreError::Serialization(e.to_string()))?;
    doc.insert(
        "timestamp",
        BsonDateTime::from_millis(document.timestamp().timestamp_millis()),
    );
    Ok(doc)
}

fn store_error(e: MongoError) -> StoreError {
    match e.kind.as_ref() {
        ErrorKind::BsonSerialization(_) | ErrorKind::BsonDeserialization(_) => {
            StoreError::Serialization(e.to_string())
        }
        ErrorKind::Write(_) | ErrorKind::BulkWrite(_) | ErrorKind::Command(_) => {
            StoreError::Rejected(e.to_string())
        }
        _ => StoreError::Network(e.to_string()),
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn insert_many(
        &self,
        collection: &str,
        documents: &[Document],
    ) -> Result<(), StoreError> {
        if documents.is_empty() {
            return Ok(());
        }

        let batch = documents
            .iter()
            .map(to_bson)
            .collect::<Result<Vec<_>, _>>()?;

        let result = self
            .client
            .database(&self.database)
            .collection::<bson::Document>(collection)
            .insert_many(batch, None)
            .await
            .map_err(store_error)?;

        if result.inserted_ids.len() < documents.len() {
            return Err(StoreError::Partial {
                sent: documents.len(),
                inserted: result.inserted_ids.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::document::{PredictionRecord, Provenance};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn prediction() -> Document {
        Document::Prediction(PredictionRecord {
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
            label: "Walking".to_string(),
            probs: Some(vec![0.1, 0.8, 0.1]),
            provenance: Provenance::Model,
            devices: Vec::new(),
        })
    }

    #[test]
    fn test_timestamp_stored_as_date() {
        let doc = to_bson(&prediction()).unwrap();
        assert_eq!(doc.get_str("type").unwrap(), "prediction");
        assert_eq!(doc.get_str("label").unwrap(), "Walking");
        assert_eq!(
            doc.get_datetime("timestamp").unwrap().timestamp_millis(),
            1_700_000_000_123
        );
    }

    #[tokio::test]
    async fn test_bad_connection_string_is_config_error() {
        let result = MongoDocumentStore::connect(&StoreConfig::new("mongodb://", "HAR")).await;
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        let mut config = StoreConfig::new("mongodb://127.0.0.1:9/?directConnection=true", "HAR");
        config.timeout = Duration::from_millis(300);
        let store = MongoDocumentStore::connect(&config).await.unwrap();
        assert_eq!(store.database(), "HAR");

        let result = store.insert_many("Predictions", &[prediction()]).await;
        assert!(matches!(result, Err(StoreError::Network(_))));
    }
}
