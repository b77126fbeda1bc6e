//! Lock-free pipeline health counters.
//!
//! Written from the radio callbacks, the link task and the consumer; read by
//! the heartbeat and the shutdown summary.

use crate::link::types::{Device, LinkState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Health counters for the running session.
#[derive(Debug)]
pub struct PipelineHealth {
    /// Per-device link state, encoded with [`LinkState::to_code`]
    link_states: [AtomicU8; 2],
    /// Notifications enqueued by the radio callbacks
    packets_enqueued: AtomicU64,
    /// Raw samples accepted into the window buffer
    samples_ingested: AtomicU64,
    /// Label summaries accepted
    summaries_ingested: AtomicU64,
    /// Malformed packets dropped
    packets_dropped: AtomicU64,
    /// Predictions derived from a full window
    model_predictions: AtomicU64,
    /// Predictions derived from cached summary stats
    synthetic_predictions: AtomicU64,
    /// Documents confirmed by the remote store
    documents_uploaded: AtomicU64,
    /// Backlog files written after a failed insert
    backlog_writes: AtomicU64,
    /// Documents replayed from backlog files
    documents_replayed: AtomicU64,
    /// Session start time
    session_start: DateTime<Utc>,
}

impl PipelineHealth {
    /// Fresh counters; every link starts `Idle`.
    pub fn new() -> Self {
        Self {
            link_states: [
                AtomicU8::new(LinkState::Idle.to_code()),
                AtomicU8::new(LinkState::Idle.to_code()),
            ],
            packets_enqueued: AtomicU64::new(0),
            samples_ingested: AtomicU64::new(0),
            summaries_ingested: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            model_predictions: AtomicU64::new(0),
            synthetic_predictions: AtomicU64::new(0),
            documents_uploaded: AtomicU64::new(0),
            backlog_writes: AtomicU64::new(0),
            documents_replayed: AtomicU64::new(0),
            session_start: Utc::now(),
        }
    }

    /// Publish the current state of one link.
    pub fn set_link_state(&self, device: Device, state: LinkState) {
        self.link_states[device.index()].store(state.to_code(), Ordering::Relaxed);
    }

    /// Last published state of one link.
    pub fn link_state(&self, device: Device) -> LinkState {
        LinkState::from_code(self.link_states[device.index()].load(Ordering::Relaxed))
    }

    /// A notification reached the queue.
    pub fn record_packet_enqueued(&self) {
        self.packets_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// A raw sample entered the window buffer.
    pub fn record_sample(&self) {
        self.samples_ingested.fetch_add(1, Ordering::Relaxed);
    }

    /// A label summary was ingested.
    pub fn record_summary(&self) {
        self.summaries_ingested.fetch_add(1, Ordering::Relaxed);
    }

    /// A malformed notification was discarded.
    pub fn record_dropped_packet(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// A prediction was queued.
    pub fn record_prediction(&self, synthetic: bool) {
        if synthetic {
            self.synthetic_predictions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.model_predictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Documents accepted by the remote store.
    pub fn record_uploaded(&self, count: u64) {
        self.documents_uploaded.fetch_add(count, Ordering::Relaxed);
    }

    /// A batch went to the backlog instead.
    pub fn record_backlog_write(&self) {
        self.backlog_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Backlogged documents delivered on replay.
    pub fn record_replayed(&self, count: u64) {
        self.documents_replayed.fetch_add(count, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn stats(&self) -> HealthStats {
        HealthStats {
            wrist_link: self.link_state(Device::Wrist),
            ankle_link: self.link_state(Device::Ankle),
            packets_enqueued: self.packets_enqueued.load(Ordering::Relaxed),
            samples_ingested: self.samples_ingested.load(Ordering::Relaxed),
            summaries_ingested: self.summaries_ingested.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            model_predictions: self.model_predictions.load(Ordering::Relaxed),
            synthetic_predictions: self.synthetic_predictions.load(Ordering::Relaxed),
            documents_uploaded: self.documents_uploaded.load(Ordering::Relaxed),
            backlog_writes: self.backlog_writes.load(Ordering::Relaxed),
            documents_replayed: self.documents_replayed.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Session Statistics:\n\
             - Links: wrist={}, ankle={}\n\
             - Packets enqueued: {}\n\
             - Samples ingested: {}\n\
             - Summaries ingested: {}\n\
             - Malformed packets dropped: {}\n\
             - Predictions: {} model, {} synthetic\n\
             - Documents uploaded: {}\n\
             - Backlog files written: {}\n\
             - Documents replayed from backlog: {}\n\
             - Session duration: {} seconds",
            stats.wrist_link,
            stats.ankle_link,
            stats.packets_enqueued,
            stats.samples_ingested,
            stats.summaries_ingested,
            stats.packets_dropped,
            stats.model_predictions,
            stats.synthetic_predictions,
            stats.documents_uploaded,
            stats.backlog_writes,
            stats.documents_replayed,
            stats.session_duration_secs
        )
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of pipeline health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStats {
    pub wrist_link: LinkState,
    pub ankle_link: LinkState,
    pub packets_enqueued: u64,
    pub samples_ingested: u64,
    pub summaries_ingested: u64,
    pub packets_dropped: u64,
    pub model_predictions: u64,
    pub synthetic_predictions: u64,
    pub documents_uploaded: u64,
    pub backlog_writes: u64,
    pub documents_replayed: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

/// Thread-safe shared health handle.
pub type SharedHealth = Arc<PipelineHealth>;

/// Create a new shared health handle.
pub fn create_shared_health() -> SharedHealth {
    Arc::new(PipelineHealth::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting() {
        let health = PipelineHealth::new();

        health.record_sample();
        health.record_sample();
        health.record_dropped_packet();
        health.record_prediction(true);
        health.record_prediction(false);
        health.record_prediction(false);

        let stats = health.stats();
        assert_eq!(stats.samples_ingested, 2);
        assert_eq!(stats.packets_dropped, 1);
        assert_eq!(stats.model_predictions, 2);
        assert_eq!(stats.synthetic_predictions, 1);
    }

    #[test]
    fn test_link_states_are_per_device() {
        let health = PipelineHealth::new();
        health.set_link_state(Device::Wrist, LinkState::Streaming);
        health.set_link_state(Device::Ankle, LinkState::Connecting { attempt: 2 });

        assert_eq!(health.link_state(Device::Wrist), LinkState::Streaming);
        assert_eq!(
            health.link_state(Device::Ankle),
            LinkState::Connecting { attempt: 2 }
        );
    }

    #[test]
    fn test_summary_format() {
        let health = PipelineHealth::new();
        let summary = health.summary();

        assert!(summary.contains("wrist=idle"));
        assert!(summary.contains("Malformed packets dropped: 0"));
        assert!(summary.contains("Backlog files written"));
    }
}
