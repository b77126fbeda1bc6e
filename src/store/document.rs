//! Telemetry documents persisted to the remote store.

use crate::core::sample::Sample;
use crate::link::protocol::LabelSummary;
use crate::link::types::Device;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a prediction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Classified from a full window of raw samples
    Model,
    /// Derived from cached summary stats while raw data was stale
    Synthetic,
}

/// One classification result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub timestamp: DateTime<Utc>,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probs: Option<Vec<f64>>,
    pub provenance: Provenance,
    /// Devices whose data contributed
    #[serde(default)]
    pub devices: Vec<Device>,
}

impl PredictionRecord {
    /// Highest class probability, when the model reported any.
    pub fn confidence(&self) -> Option<f64> {
        self.probs
            .as_ref()
            .and_then(|p| p.iter().copied().reduce(f64::max))
    }
}

/// A document in either the sensor or the prediction collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Document {
    Raw {
        timestamp: DateTime<Utc>,
        device: Device,
        accel: [f64; 3],
        gyro: [f64; 3],
    },
    Speed {
        timestamp: DateTime<Utc>,
        device: Device,
        acc_mag_g: f64,
        intensity: f64,
        raw: String,
    },
    Label {
        timestamp: DateTime<Utc>,
        device: Device,
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mean: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        std: Option<f64>,
        raw: String,
    },
    Prediction(PredictionRecord),
}

impl Document {
    /// One raw IMU sample.
    pub fn raw(device: Device, sample: &Sample, timestamp: DateTime<Utc>) -> Self {
        Document::Raw {
            timestamp,
            device,
            accel: sample.accel.to_array(),
            gyro: sample.gyro.to_array(),
        }
    }

    /// A parsed label line, as a speed or label document.
    pub fn summary(device: Device, summary: &LabelSummary, timestamp: DateTime<Utc>) -> Self {
        match summary {
            LabelSummary::Speed {
                accel_magnitude,
                intensity,
                text,
            } => Document::Speed {
                timestamp,
                device,
                acc_mag_g: *accel_magnitude,
                intensity: *intensity,
                raw: text.clone(),
            },
            LabelSummary::Activity {
                label,
                mean,
                std,
                text,
            } => Document::Label {
                timestamp,
                device,
                label: label.clone(),
                mean: *mean,
                std: *std,
                raw: text.clone(),
            },
        }
    }

    /// Creation time of the document.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Document::Raw { timestamp, .. }
            | Document::Speed { timestamp, .. }
            | Document::Label { timestamp, .. } => *timestamp,
            Document::Prediction(p) => p.timestamp,
        }
    }

    /// Value of the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Document::Raw { .. } => "raw",
            Document::Speed { .. } => "speed",
            Document::Label { .. } => "label",
            Document::Prediction(_) => "prediction",
        }
    }
}

impl From<PredictionRecord> for Document {
    fn from(record: PredictionRecord) -> Self {
        Document::Prediction(record)
    }
}
