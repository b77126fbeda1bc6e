//! Core signal processing for the telemetry hub.
//!
//! This module contains:
//! - Sample types and the synthetic frame parser
//! - Per-device sliding windows
//! - Fixed-order feature extraction
//! - Activity classification with a heuristic fallback

pub mod features;
pub mod inference;
pub mod sample;
pub mod windowing;

// Re-export commonly used types
pub use features::{compute_features, Channel, FeatureVector, Stat, FEATURE_LEN};
pub use inference::{
    Activity, ActivityThresholds, Classification, FallbackClassifier, InferenceEngine,
    ModelError, Predictor, PredictorSource, TrainedModel,
};
pub use sample::{parse_frame, Sample, SampleRecord, Vec3};
pub use windowing::{window_len, Window, WindowBuffer};
