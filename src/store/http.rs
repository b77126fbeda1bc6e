//! HTTP client for the remote document store.
//!
//! Speaks a Data-API style `insertMany` action:
//! `POST {uri}/action/insertMany` with `{dataSource, database, collection,
//! documents}` and an `api-key` header.

use crate::store::document::Document;
use crate::store::{redact_uri, DocumentStore, StoreError, StoreKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Connection settings for the remote store.
#[derive(Clone)]
pub struct StoreConfig {
    /// Connection string or base endpoint
    pub uri: String,
    /// Value of the `api-key` header, if any
    pub api_key: Option<String>,
    pub data_source: String,
    pub database: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("uri", &redact_uri(&self.uri))
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("data_source", &self.data_source)
            .field("database", &self.database)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl StoreConfig {
    /// Settings for `database` at `uri` with the default data source and timeout.
    pub fn new(uri: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            api_key: None,
            data_source: "Cluster0".to_string(),
            database: database.into(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Get the insert endpoint URL.
    pub fn insert_url(&self) -> String {
        format!("{}/action/insertMany", self.uri.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertManyRequest<'a> {
    data_source: &'a str,
    database: &'a str,
    collection: &'a str,
    documents: &'a [Document],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertManyResponse {
    #[serde(default)]
    inserted_ids: Vec<serde_json::Value>,
}

/// Remote store reached over HTTPS.
#[derive(Debug)]
pub struct HttpDocumentStore {
    config: StoreConfig,
    client: reqwest::Client,
}

impl HttpDocumentStore {
    /// Build a client for an `http://` or `https://` endpoint.
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        if config.uri.trim().is_empty() {
            return Err(StoreError::Config("empty store URI".to_string()));
        }
        if StoreKind::detect(&config.uri) != Some(StoreKind::DataApi) {
            return Err(StoreError::Config(format!(
                "'{}' is not an HTTP data endpoint",
                redact_uri(&config.uri)
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    /// Settings this client was built with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn insert_many(
        &self,
        collection: &str,
        documents: &[Document],
    ) -> Result<(), StoreError> {
        if documents.is_empty() {
            return Ok(());
        }

        let body = InsertManyRequest {
            data_source: &self.config.data_source,
            database: &self.config.database,
            collection,
            documents,
        };

        let mut request = self
            .client
            .post(self.config.insert_url())
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(StoreError::Server {
                status: status.as_u16(),
                message,
            });
        }

        let ack: InsertManyResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        if ack.inserted_ids.len() != documents.len() {
            return Err(StoreError::Partial {
                sent: documents.len(),
                inserted: ack.inserted_ids.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_url() {
        let config = StoreConfig::new("https://data.example.net/app/har/endpoint/data/v1/", "HAR");
        assert_eq!(
            config.insert_url(),
            "https://data.example.net/app/har/endpoint/data/v1/action/insertMany"
        );
    }

    #[test]
    fn test_request_body_layout() {
        let config = StoreConfig::new("https://x", "HAR_Project");
        let body = InsertManyRequest {
            data_source: &config.data_source,
            database: &config.database,
            collection: "SensorData",
            documents: &[],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["dataSource"], "Cluster0");
        assert_eq!(json["database"], "HAR_Project");
        assert_eq!(json["collection"], "SensorData");
        assert_eq!(json["documents"], serde_json::json!([]));
    }

    #[test]
    fn test_empty_uri_rejected() {
        assert!(matches!(
            HttpDocumentStore::new(StoreConfig::new("  ", "db")),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn test_connection_string_is_not_an_endpoint() {
        let config = StoreConfig::new("mongodb+srv://har:pw@cluster0.example.net", "HAR");
        match HttpDocumentStore::new(config) {
            Err(StoreError::Config(message)) => assert!(!message.contains("pw@")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_debug_hides_credentials() {
        let mut config = StoreConfig::new("https://user:pw@data.example.net/v1", "HAR");
        config.api_key = Some("key-123".to_string());
        let text = format!("{config:?}");
        assert!(!text.contains("pw@"));
        assert!(!text.contains("key-123"));
        assert!(text.contains("data.example.net"));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_network_error() {
        let mut config = StoreConfig::new("http://127.0.0.1:9", "db");
        config.timeout = Duration::from_millis(500);
        let store = HttpDocumentStore::new(config).unwrap();
        let doc = Document::Prediction(crate::store::PredictionRecord {
            timestamp: chrono::Utc::now(),
            label: "Idle".to_string(),
            probs: None,
            provenance: crate::store::Provenance::Synthetic,
            devices: Vec::new(),
        });
        let result = store.insert_many("Predictions", &[doc]).await;
        assert!(matches!(result, Err(StoreError::Network(_))));
    }
}
