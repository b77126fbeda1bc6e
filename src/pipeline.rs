//! The orchestrator owning all downstream pipeline state.
//!
//! A single [`Pipeline`] instance is driven by the stream consumer: every
//! decoded packet goes through [`Pipeline::handle_packet`], and every tick
//! (packet or timeout) through [`Pipeline::tick`]. Nothing here is shared,
//! so no locking is needed.

use crate::core::inference::{ActivityThresholds, InferenceEngine};
use crate::core::sample::Sample;
use crate::core::windowing::WindowBuffer;
use crate::health::SharedHealth;
use crate::link::protocol::{self, LabelSummary, PacketError};
use crate::link::types::{Device, Packet, StreamKind};
use crate::store::{Document, PredictionRecord, Provenance};
use crate::uploader::{BatchUploader, FlushOutcome};
use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Samples per window
    pub window_len: usize,
    /// Append a raw document per sample
    pub save_raw: bool,
    /// Raw silence needed before synthetic predictions kick in
    pub stale_raw_after: Duration,
    /// Minimum spacing between predictions (zero = every tick)
    pub prediction_interval: Duration,
    /// Flush predictions as soon as they are queued
    pub eager_predictions: bool,
    pub heartbeat_interval: Duration,
    pub thresholds: ActivityThresholds,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            window_len: 200,
            save_raw: false,
            stale_raw_after: Duration::from_secs(1),
            prediction_interval: Duration::ZERO,
            eager_predictions: false,
            heartbeat_interval: Duration::from_secs(1),
            thresholds: ActivityThresholds::default(),
        }
    }
}

/// Per-device bookkeeping outside the window buffer.
#[derive(Debug, Clone, Copy, Default)]
struct DeviceTrack {
    last_raw: Option<Instant>,
    /// Latest spread statistic from a label summary
    spread: Option<f64>,
}

pub struct Pipeline {
    settings: PipelineSettings,
    buffer: WindowBuffer,
    tracks: [DeviceTrack; 2],
    sensor_batch: Vec<Document>,
    prediction_batch: Vec<Document>,
    engine: InferenceEngine,
    uploader: BatchUploader,
    health: SharedHealth,
    last_prediction: Option<Instant>,
    last_heartbeat: Instant,
}

impl Pipeline {
    /// Create an orchestrator with empty batches and buffers.
    pub fn new(
        settings: PipelineSettings,
        engine: InferenceEngine,
        uploader: BatchUploader,
        health: SharedHealth,
        now: Instant,
    ) -> Self {
        Self {
            buffer: WindowBuffer::new(settings.window_len),
            settings,
            tracks: [DeviceTrack::default(); 2],
            sensor_batch: Vec::new(),
            prediction_batch: Vec::new(),
            engine,
            uploader,
            health,
            last_prediction: None,
            last_heartbeat: now,
        }
    }

    /// Decode and ingest one notification.
    pub fn handle_packet(&mut self, packet: &Packet, now: Instant) -> Result<(), PacketError> {
        match packet.kind {
            StreamKind::Raw => {
                let sample = protocol::decode_raw(&packet.payload)?;
                self.ingest_sample(packet.device, sample, now);
            }
            StreamKind::Label => {
                let summary = protocol::parse_label(&packet.payload)?;
                self.ingest_summary(packet.device, summary);
            }
        }
        Ok(())
    }

    /// Decode a notification, counting and dropping it when malformed.
    pub fn accept_packet(&mut self, packet: &Packet, now: Instant) {
        if let Err(e) = self.handle_packet(packet, now) {
            debug!(device = %packet.device, error = %e, "dropped malformed packet");
            self.health.record_dropped_packet();
        }
    }

    /// Append a decoded sample to its device's history.
    pub fn ingest_sample(&mut self, device: Device, sample: Sample, now: Instant) {
        self.buffer.push(device, sample);
        self.tracks[device.index()].last_raw = Some(now);
        self.health.record_sample();

        if self.settings.save_raw {
            self.sensor_batch
                .push(Document::raw(device, &sample, Utc::now()));
        }
    }

    /// Record a label summary and cache its spread statistic.
    pub fn ingest_summary(&mut self, device: Device, summary: LabelSummary) {
        let track = &mut self.tracks[device.index()];
        match &summary {
            LabelSummary::Speed { intensity, .. } => track.spread = Some(*intensity),
            LabelSummary::Activity { mean, std, .. } => {
                if mean.is_some() || std.is_some() {
                    track.spread = *std;
                }
            }
        }
        self.health.record_summary();
        self.sensor_batch
            .push(Document::summary(device, &summary, Utc::now()));
    }

    /// Classify the current window, or synthesize a prediction from cached
    /// summary stats when raw data has gone stale.
    pub fn maybe_predict(&mut self, now: Instant) -> Option<PredictionRecord> {
        if let Some(last) = self.last_prediction {
            if now.saturating_duration_since(last) < self.settings.prediction_interval {
                return None;
            }
        }

        let record = match self.buffer.window() {
            Some(window) => {
                let (_, result) = self.engine.classify_window(&window);
                match result.confidence() {
                    Some(p) => info!(label = %result.label, p = %format!("{p:.2}"), "predicted"),
                    None => info!(label = %result.label, "predicted"),
                }
                PredictionRecord {
                    timestamp: Utc::now(),
                    label: result.label,
                    probs: result.probabilities,
                    provenance: Provenance::Model,
                    devices: window.devices(),
                }
            }
            None => self.synthetic_prediction(now)?,
        };

        self.last_prediction = Some(now);
        self.health
            .record_prediction(record.provenance == Provenance::Synthetic);
        self.prediction_batch.push(record.clone().into());
        debug!(label = %record.label, batch = self.prediction_batch.len(), "prediction queued");
        Some(record)
    }

    fn synthetic_prediction(&self, now: Instant) -> Option<PredictionRecord> {
        let latest_raw = self.tracks.iter().filter_map(|t| t.last_raw).max();
        let stale = match latest_raw {
            Some(at) => now.saturating_duration_since(at) >= self.settings.stale_raw_after,
            None => true,
        };
        if !stale {
            return None;
        }

        let devices: Vec<Device> = Device::ALL
            .into_iter()
            .filter(|d| self.tracks[d.index()].spread.is_some())
            .collect();
        if devices.is_empty() {
            return None;
        }

        let wrist = self.tracks[Device::Wrist.index()].spread.unwrap_or(0.0);
        let ankle = self.tracks[Device::Ankle.index()].spread.unwrap_or(0.0);
        let activity = self.settings.thresholds.classify(wrist.max(ankle));
        info!(
            label = %activity,
            wrist_spread = %format!("{wrist:.2}"),
            ankle_spread = %format!("{ankle:.2}"),
            "predicted (synthetic)"
        );

        Some(PredictionRecord {
            timestamp: Utc::now(),
            label: activity.label().to_string(),
            probs: None,
            provenance: Provenance::Synthetic,
            devices,
        })
    }

    /// Run the per-tick work: heartbeat, prediction, uploads.
    pub async fn tick(&mut self, now: Instant) -> Option<FlushOutcome> {
        self.maybe_heartbeat(now);

        if self.maybe_predict(now).is_some() && self.settings.eager_predictions {
            let outcome = self
                .uploader
                .flush_predictions(&mut self.prediction_batch)
                .await;
            if !outcome.status.is_durable() {
                warn!("eager prediction upload failed");
            }
        }

        self.uploader
            .maybe_flush(now, &mut self.sensor_batch, &mut self.prediction_batch)
            .await
    }

    /// Final flush, bypassing the interval.
    pub async fn shutdown(&mut self, now: Instant) -> FlushOutcome {
        info!(
            sensor = self.sensor_batch.len(),
            predictions = self.prediction_batch.len(),
            "final flush"
        );
        self.uploader
            .flush_now(now, &mut self.sensor_batch, &mut self.prediction_batch)
            .await
    }

    fn maybe_heartbeat(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_heartbeat) < self.settings.heartbeat_interval {
            return;
        }
        self.last_heartbeat = now;

        let n = self.buffer.window_len();
        let age = |device: Device| {
            self.tracks[device.index()]
                .last_raw
                .map(|t| format!("{:.2}s", now.saturating_duration_since(t).as_secs_f64()))
                .unwrap_or_else(|| "never".to_string())
        };
        info!(
            wrist = %format!("{}/{n}", self.buffer.len(Device::Wrist)),
            ankle = %format!("{}/{n}", self.buffer.len(Device::Ankle)),
            raw_age_wrist = %age(Device::Wrist),
            raw_age_ankle = %age(Device::Ankle),
            wrist_link = %self.health.link_state(Device::Wrist),
            ankle_link = %self.health.link_state(Device::Ankle),
            "heartbeat"
        );
    }

    /// Per-device sample history.
    pub fn buffer(&self) -> &WindowBuffer {
        &self.buffer
    }

    /// Sensor documents awaiting upload.
    pub fn sensor_batch(&self) -> &[Document] {
        &self.sensor_batch
    }

    /// Prediction documents awaiting upload.
    pub fn prediction_batch(&self) -> &[Document] {
        &self.prediction_batch
    }

    /// Shared counters.
    pub fn health(&self) -> &SharedHealth {
        &self.health
    }

    /// The classifier in use.
    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }
}
