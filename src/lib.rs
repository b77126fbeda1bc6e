//! HAR central - two-node wearable telemetry hub.
//!
//! Ingests motion telemetry from a wrist and an ankle node, fuses both
//! streams into sliding windows, classifies the wearer's activity and
//! persists telemetry and predictions to a remote document store.
//!
//! # Resilience
//!
//! - **Links**: each node connects, retries and fails on its own; the other
//!   limb keeps streaming
//! - **Classifier**: a missing or corrupt model artifact falls back to a
//!   deterministic threshold rule
//! - **Store**: a failed upload lands in an on-disk backlog that is replayed
//!   once the store is back
//!
//! # Sample sources
//!
//! - `BLE`: the host Bluetooth adapter (`ble` feature)
//! - `EMULATED`: emulated nodes, for bench runs without hardware
//! - `SYNTHETIC`: NDJSON sample frames on stdin
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           HAR central                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   queue   ┌─────────────┐   ┌─────────────┐     │
//! │  │ Link manager│──────────▶│  Consumer   │──▶│  Windowing  │     │
//! │  │ wrist/ankle │           │  (router)   │   │  + Features │     │
//! │  └─────────────┘           └─────────────┘   └─────────────┘     │
//! │                                   │                 │            │
//! │                                   ▼                 ▼            │
//! │                            ┌─────────────┐   ┌─────────────┐     │
//! │                            │  Uploader   │◀──│  Inference  │     │
//! │                            │ + backlog   │   │             │     │
//! │                            └─────────────┘   └─────────────┘     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use har_central::core::{compute_features, ActivityThresholds, InferenceEngine, Window};
//!
//! let engine = InferenceEngine::fallback(ActivityThresholds::default());
//! let window = Window::new(Vec::new(), Vec::new());
//! let result = engine.classify(&compute_features(&window));
//! println!("{}", result.label);
//! ```

pub mod config;
pub mod core;
pub mod health;
pub mod link;
pub mod pipeline;
pub mod router;
pub mod store;
pub mod uploader;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError, Mode};
pub use core::{compute_features, FeatureVector, InferenceEngine, Sample, WindowBuffer};
pub use health::{create_shared_health, PipelineHealth, SharedHealth};
pub use link::{Device, LinkManager, Packet, SimulatedCentral, StreamKind};
pub use pipeline::{Pipeline, PipelineSettings};
pub use store::{
    BacklogSink, Document, DocumentStore, HttpDocumentStore, MemoryStore, MongoDocumentStore,
};
pub use uploader::BatchUploader;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
