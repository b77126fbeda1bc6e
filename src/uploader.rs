//! Timer-gated batch upload to the sensor and prediction sinks.
//!
//! Both sinks are flushed concurrently and independently: one failing never
//! delays or blocks the other. The interval timer restarts on every attempt
//! whatever the outcome, so an outage never turns into a tight retry loop.

use crate::health::SharedHealth;
use crate::store::{BacklogReport, BacklogSink, Delivery, Document};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What happened to one sink's batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkStatus {
    /// No sink configured; the batch was discarded
    Disabled { discarded: usize },
    /// Nothing pending
    Empty,
    /// Accepted by the remote store
    Uploaded(usize),
    /// Written to the backlog instead
    Backlogged(usize),
    /// Neither store nor backlog took it; the batch is kept
    Failed(usize),
}

impl SinkStatus {
    /// Whether the in-memory batch was released.
    pub fn is_durable(&self) -> bool {
        !matches!(self, SinkStatus::Failed(_))
    }
}

/// Outcome of one sink during a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkOutcome {
    pub status: SinkStatus,
    /// Backlog sweep, when one ran
    pub replay: Option<BacklogReport>,
}

/// Outcome of a full flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOutcome {
    pub sensor: SinkOutcome,
    pub predictions: SinkOutcome,
}

/// Flushes two document batches to their sinks on an interval.
pub struct BatchUploader {
    sensor: Option<BacklogSink>,
    predictions: Option<BacklogSink>,
    interval: Duration,
    last_flush: Instant,
    health: SharedHealth,
}

impl BatchUploader {
    /// Create an uploader whose first flush is due one interval after `now`.
    pub fn new(
        sensor: Option<BacklogSink>,
        predictions: Option<BacklogSink>,
        interval: Duration,
        now: Instant,
        health: SharedHealth,
    ) -> Self {
        Self {
            sensor,
            predictions,
            interval,
            last_flush: now,
            health,
        }
    }

    /// Whether sensor uploads are enabled.
    pub fn has_sensor_sink(&self) -> bool {
        self.sensor.is_some()
    }

    /// Whether prediction uploads are enabled.
    pub fn has_prediction_sink(&self) -> bool {
        self.predictions.is_some()
    }

    /// Whether the upload interval has elapsed since the last flush.
    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_flush) >= self.interval
    }

    /// Flush both batches if the interval has elapsed.
    pub async fn maybe_flush(
        &mut self,
        now: Instant,
        sensor_batch: &mut Vec<Document>,
        prediction_batch: &mut Vec<Document>,
    ) -> Option<FlushOutcome> {
        if !self.is_due(now) {
            return None;
        }
        Some(self.flush_now(now, sensor_batch, prediction_batch).await)
    }

    /// Flush both batches regardless of the interval.
    pub async fn flush_now(
        &mut self,
        now: Instant,
        sensor_batch: &mut Vec<Document>,
        prediction_batch: &mut Vec<Document>,
    ) -> FlushOutcome {
        let (sensor, predictions) = tokio::join!(
            flush_sink(self.sensor.as_ref(), sensor_batch, &self.health),
            flush_sink(self.predictions.as_ref(), prediction_batch, &self.health),
        );
        self.last_flush = now;
        FlushOutcome {
            sensor,
            predictions,
        }
    }

    /// Push pending predictions right away without touching the timer.
    pub async fn flush_predictions(&self, prediction_batch: &mut Vec<Document>) -> SinkOutcome {
        if self.predictions.is_none() {
            // Keep the batch for the regular flush, which discards it.
            return SinkOutcome {
                status: SinkStatus::Empty,
                replay: None,
            };
        }
        flush_sink(self.predictions.as_ref(), prediction_batch, &self.health).await
    }
}

async fn flush_sink(
    sink: Option<&BacklogSink>,
    batch: &mut Vec<Document>,
    health: &SharedHealth,
) -> SinkOutcome {
    let Some(sink) = sink else {
        let discarded = batch.len();
        if discarded > 0 {
            debug!(docs = discarded, "no sink configured, discarding batch");
        }
        batch.clear();
        return SinkOutcome {
            status: SinkStatus::Disabled { discarded },
            replay: None,
        };
    };

    let collection = sink.collection();
    let count = batch.len();

    let (status, remote_ok) = if count == 0 {
        (SinkStatus::Empty, true)
    } else {
        match sink.insert_batch(batch).await {
            Ok(Delivery::Remote) => {
                info!(collection, docs = count, "uploaded batch");
                health.record_uploaded(count as u64);
                batch.clear();
                (SinkStatus::Uploaded(count), true)
            }
            Ok(Delivery::Backlogged { file, .. }) => {
                warn!(collection, docs = count, file = ?file, "batch backlogged");
                health.record_backlog_write();
                batch.clear();
                (SinkStatus::Backlogged(count), false)
            }
            Err(e) => {
                error!(collection, docs = count, error = %e, "batch kept in memory");
                (SinkStatus::Failed(count), false)
            }
        }
    };

    // The store just refused a write; the sweep waits for the next interval.
    let replay = if remote_ok {
        let report = sink.flush_backlog().await;
        health.record_replayed(report.replayed_documents as u64);
        Some(report)
    } else {
        None
    };

    SinkOutcome { status, replay }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::create_shared_health;
    use crate::store::{BacklogDir, MemoryStore, PredictionRecord, Provenance};
    use std::sync::Arc;

    fn prediction(label: &str) -> Document {
        Document::Prediction(PredictionRecord {
            timestamp: chrono::Utc::now(),
            label: label.to_string(),
            probs: None,
            provenance: Provenance::Synthetic,
            devices: Vec::new(),
        })
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        sensor_store: Arc<MemoryStore>,
        pred_store: Arc<MemoryStore>,
        backlog: BacklogDir,
        uploader: BatchUploader,
        start: Instant,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let backlog = BacklogDir::new(dir.path());
        let sensor_store = Arc::new(MemoryStore::new());
        let pred_store = Arc::new(MemoryStore::new());
        let start = Instant::now();
        let uploader = BatchUploader::new(
            Some(BacklogSink::new(sensor_store.clone(), "SensorData", backlog.clone())),
            Some(BacklogSink::new(pred_store.clone(), "Predictions", backlog.clone())),
            Duration::from_secs(5),
            start,
            create_shared_health(),
        );
        Fixture {
            _dir: dir,
            sensor_store,
            pred_store,
            backlog,
            uploader,
            start,
        }
    }

    #[tokio::test]
    async fn test_interval_gate() {
        let mut f = fixture();
        let mut sensor = vec![prediction("Idle")];
        let mut preds = Vec::new();

        let early = f.start + Duration::from_secs(4);
        assert!(f.uploader.maybe_flush(early, &mut sensor, &mut preds).await.is_none());
        assert_eq!(sensor.len(), 1);

        let due = f.start + Duration::from_secs(5);
        let outcome = f.uploader.maybe_flush(due, &mut sensor, &mut preds).await.unwrap();
        assert_eq!(outcome.sensor.status, SinkStatus::Uploaded(1));
        assert_eq!(outcome.predictions.status, SinkStatus::Empty);
        assert!(sensor.is_empty());

        let soon_after = due + Duration::from_secs(1);
        assert!(!f.uploader.is_due(soon_after));
    }

    #[tokio::test]
    async fn test_timer_advances_on_failure() {
        let mut f = fixture();
        f.sensor_store.set_failing(true);
        let mut sensor = vec![prediction("Idle")];
        let mut preds = Vec::new();

        let due = f.start + Duration::from_secs(5);
        f.uploader.maybe_flush(due, &mut sensor, &mut preds).await.unwrap();
        assert!(!f.uploader.is_due(due + Duration::from_millis(10)));
        assert!(f.uploader.is_due(due + Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_sinks_are_isolated() {
        let mut f = fixture();
        f.sensor_store.set_failing(true);
        let mut sensor = vec![prediction("a"), prediction("b")];
        let mut preds = vec![prediction("Walking")];

        let outcome = f
            .uploader
            .flush_now(f.start, &mut sensor, &mut preds)
            .await;
        assert_eq!(outcome.sensor.status, SinkStatus::Backlogged(2));
        assert_eq!(outcome.predictions.status, SinkStatus::Uploaded(1));
        assert_eq!(f.pred_store.documents("Predictions").len(), 1);
        assert_eq!(f.backlog.pending("SensorData").unwrap().len(), 1);
        assert!(f.backlog.pending("Predictions").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backlog_replayed_on_recovery_without_duplicates() {
        let mut f = fixture();
        f.sensor_store.set_failing(true);
        let mut sensor = vec![prediction("a"), prediction("b")];
        let mut preds = Vec::new();
        f.uploader.flush_now(f.start, &mut sensor, &mut preds).await;
        assert!(sensor.is_empty());

        f.sensor_store.set_failing(false);
        sensor.push(prediction("c"));
        let outcome = f.uploader.flush_now(f.start, &mut sensor, &mut preds).await;
        assert_eq!(outcome.sensor.status, SinkStatus::Uploaded(1));
        assert_eq!(outcome.sensor.replay.unwrap().replayed_documents, 2);

        let stored = f.sensor_store.documents("SensorData");
        assert_eq!(stored.len(), 3);
        assert!(f.backlog.pending("SensorData").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_sink_discards() {
        let mut uploader = BatchUploader::new(
            None,
            None,
            Duration::from_secs(1),
            Instant::now(),
            create_shared_health(),
        );
        let mut sensor = vec![prediction("x")];
        let mut preds = vec![prediction("y")];
        let outcome = uploader
            .flush_now(Instant::now(), &mut sensor, &mut preds)
            .await;
        assert_eq!(outcome.sensor.status, SinkStatus::Disabled { discarded: 1 });
        assert!(sensor.is_empty() && preds.is_empty());
    }
}
