//! End-to-end tests: queue -> pipeline -> uploader -> store/backlog

use har_central::core::{ActivityThresholds, InferenceEngine, Sample, Vec3};
use har_central::health::create_shared_health;
use har_central::link::protocol::encode_raw;
use har_central::link::{
    Device, LabelStyle, LinkManager, LinkSettings, LinkState, LinkTarget, Packet,
    SimulatedCentral, SimulatedNode, StreamKind,
};
use har_central::pipeline::{Pipeline, PipelineSettings};
use har_central::router::{run_consumer, run_producer, Inbound};
use har_central::store::{BacklogDir, BacklogSink, Document, MemoryStore, Provenance};
use har_central::uploader::{BatchUploader, SinkStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<MemoryStore>,
    backlog: BacklogDir,
    pipeline: Pipeline,
}

fn harness(window_len: usize, interval: Duration) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let backlog = BacklogDir::new(dir.path().join("backlog"));
    let store = Arc::new(MemoryStore::new());
    let health = create_shared_health();
    let now = Instant::now();

    let uploader = BatchUploader::new(
        Some(BacklogSink::new(store.clone(), "SensorData", backlog.clone())),
        Some(BacklogSink::new(store.clone(), "Predictions", backlog.clone())),
        interval,
        now,
        health.clone(),
    );
    let pipeline = Pipeline::new(
        PipelineSettings {
            window_len,
            ..PipelineSettings::default()
        },
        InferenceEngine::fallback(ActivityThresholds::default()),
        uploader,
        health,
        now,
    );
    Harness {
        _dir: dir,
        store,
        backlog,
        pipeline,
    }
}

fn raw_packet(device: Device, z: f64) -> Packet {
    let sample = Sample::new(Vec3::new(0.0, 0.0, z), Vec3::default());
    Packet::new(device, StreamKind::Raw, encode_raw(&sample).to_vec())
}

fn label_packet(device: Device, text: &str) -> Packet {
    Packet::new(device, StreamKind::Label, text.as_bytes().to_vec())
}

#[tokio::test]
async fn test_sink_failure_writes_one_backlog_file_without_duplication() {
    let mut h = harness(4, Duration::from_secs(5));
    let start = Instant::now();
    for text in ["WALK,1.00,0.30", "SPD,1.10,0.25", "WALK,1.01,0.31"] {
        let device = if text.starts_with("SPD") {
            Device::Ankle
        } else {
            Device::Wrist
        };
        h.pipeline.accept_packet(&label_packet(device, text), start);
    }
    assert_eq!(h.pipeline.sensor_batch().len(), 3);

    h.store.set_failing(true);
    let outcome = h
        .pipeline
        .tick(start + Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(outcome.sensor.status, SinkStatus::Backlogged(3));
    assert!(h.pipeline.sensor_batch().is_empty());

    let files = h.backlog.pending("SensorData").unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(BacklogDir::read(&files[0]).unwrap().len(), 3);

    h.store.set_failing(false);
    h.pipeline
        .accept_packet(&label_packet(Device::Wrist, "IDLE,1.00,0.02"), start);
    let outcome = h
        .pipeline
        .tick(start + Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(outcome.sensor.status, SinkStatus::Uploaded(1));

    let stored = h.store.documents("SensorData");
    assert_eq!(stored.len(), 4);
    let raws: Vec<String> = stored
        .iter()
        .filter_map(|d| match d {
            Document::Label { raw, .. } | Document::Speed { raw, .. } => Some(raw.clone()),
            _ => None,
        })
        .collect();
    let mut unique = raws.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), raws.len());
    assert!(h.backlog.pending("SensorData").unwrap().is_empty());
}

#[tokio::test]
async fn test_backlog_survives_until_store_returns() {
    let mut h = harness(4, Duration::ZERO);
    let start = Instant::now();

    h.store.set_failing(true);
    h.pipeline
        .accept_packet(&label_packet(Device::Ankle, "SPD,1.00,0.80"), start);
    h.pipeline.tick(start).await;
    assert_eq!(h.backlog.pending("SensorData").unwrap().len(), 1);

    // still down: the file stays
    h.pipeline.tick(start + Duration::from_millis(10)).await;
    h.pipeline.tick(start + Duration::from_millis(20)).await;
    let files = h.backlog.pending("SensorData").unwrap();
    assert!(!files.is_empty());
    assert!(files.iter().all(|f| f.exists()));

    h.store.set_failing(false);
    h.pipeline.tick(start + Duration::from_millis(30)).await;
    assert!(h.backlog.pending("SensorData").unwrap().is_empty());
    assert!(h.backlog.pending("Predictions").unwrap().is_empty());

    let speeds = h
        .store
        .documents("SensorData")
        .into_iter()
        .filter(|d| d.kind() == "speed")
        .count();
    assert_eq!(speeds, 1);
}

#[tokio::test]
async fn test_consumer_drains_queue_and_flushes_on_close() {
    let mut h = harness(4, Duration::from_secs(60));
    let (tx, rx) = mpsc::unbounded_channel::<Packet>();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    for _ in 0..2 {
        tx.send(raw_packet(Device::Wrist, 1.0)).unwrap();
    }
    tx.send(Packet::new(Device::Wrist, StreamKind::Raw, vec![1, 2, 3]))
        .unwrap();
    for _ in 0..2 {
        tx.send(raw_packet(Device::Wrist, 1.0)).unwrap();
    }
    tx.send(label_packet(Device::Wrist, "IDLE,1.00,0.01")).unwrap();
    drop(tx);

    let outcome = run_consumer(
        &mut h.pipeline,
        rx,
        Duration::from_millis(10),
        shutdown_rx,
    )
    .await;

    assert!(outcome.sensor.status.is_durable());
    assert_eq!(h.pipeline.health().stats().packets_dropped, 1);
    assert_eq!(h.pipeline.buffer().len(Device::Wrist), 4);

    let predictions = h.store.documents("Predictions");
    assert!(!predictions.is_empty());
    match &predictions[0] {
        Document::Prediction(p) => {
            assert_eq!(p.label, "Idle");
            assert_eq!(p.provenance, Provenance::Model);
            assert_eq!(p.devices, vec![Device::Wrist]);
        }
        other => panic!("unexpected document {other:?}"),
    }
    assert_eq!(h.store.documents("SensorData").len(), 1);
}

#[tokio::test]
async fn test_synthetic_frames_drive_predictions() {
    let mut h = harness(3, Duration::from_secs(60));
    let (tx, rx) = mpsc::unbounded_channel::<Inbound>();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    for i in 0..3 {
        let z = if i % 2 == 0 { 0.2 } else { 2.0 };
        let frame = vec![
            (Device::Wrist, Sample::new(Vec3::new(0.0, 0.0, z), Vec3::default())),
            (Device::Ankle, Sample::new(Vec3::new(0.0, 0.0, 1.0), Vec3::default())),
        ];
        tx.send(Inbound::Frame(frame)).unwrap();
    }
    drop(tx);

    run_consumer(&mut h.pipeline, rx, Duration::from_millis(10), shutdown_rx).await;

    let predictions = h.store.documents("Predictions");
    let last = predictions.last().unwrap();
    match last {
        Document::Prediction(p) => {
            assert_eq!(p.label, "Running");
            assert_eq!(p.devices, vec![Device::Wrist, Device::Ankle]);
        }
        other => panic!("unexpected document {other:?}"),
    }
}

#[tokio::test]
async fn test_live_session_with_emulated_nodes() {
    let mut h = harness(10, Duration::from_millis(200));
    let health = h.pipeline.health().clone();
    let (tx, rx) = mpsc::unbounded_channel::<Packet>();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let central = SimulatedCentral::ams_pair("AMS-Wrist", "AMS-Ankle");
    let wrist = central.node("AMS-Wrist").unwrap();
    let links = LinkManager::new(
        central,
        vec![
            LinkTarget::new(Device::Wrist, "AMS-Wrist"),
            LinkTarget::new(Device::Ankle, "AMS-Ankle"),
        ],
        LinkSettings {
            discovery_timeout: Duration::from_millis(10),
            settle_delay: Duration::from_millis(1),
            sample_rate_hz: 50,
            ..LinkSettings::default()
        },
        tx,
        health.clone(),
    );

    let producer = tokio::spawn(run_producer(links, shutdown_rx.clone()));
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(800)).await;
        let _ = shutdown_tx.send(true);
    });

    run_consumer(&mut h.pipeline, rx, Duration::from_millis(20), shutdown_rx).await;
    let reports = producer.await.unwrap();
    stopper.await.unwrap();

    assert!(reports.iter().all(|(_, r)| r.is_clean()));
    assert!(!wrist.is_connected());

    let stats = health.stats();
    assert!(stats.samples_ingested > 0);
    assert!(stats.model_predictions > 0);

    let predictions = h.store.documents("Predictions");
    assert!(predictions.iter().any(|d| matches!(
        d,
        Document::Prediction(p) if p.provenance == Provenance::Model && p.devices.len() == 2
    )));
    assert!(h
        .store
        .documents("SensorData")
        .iter()
        .any(|d| d.kind() == "label"));
}

#[tokio::test]
async fn test_ankle_pipeline_runs_while_wrist_link_is_down() {
    let mut h = harness(10, Duration::from_millis(200));
    let health = h.pipeline.health().clone();
    let (tx, rx) = mpsc::unbounded_channel::<Packet>();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let central = SimulatedCentral::new(vec![
        SimulatedNode::new("AMS-Wrist", "w", LabelStyle::Activity).failing_connects(3),
        SimulatedNode::new("AMS-Ankle", "a", LabelStyle::Speed),
    ]);
    let links = LinkManager::new(
        central,
        vec![
            LinkTarget::new(Device::Wrist, "AMS-Wrist"),
            LinkTarget::new(Device::Ankle, "AMS-Ankle"),
        ],
        LinkSettings {
            discovery_timeout: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(10),
            settle_delay: Duration::from_millis(1),
            sample_rate_hz: 50,
            ..LinkSettings::default()
        },
        tx,
        health.clone(),
    );

    let producer = tokio::spawn(run_producer(links, shutdown_rx.clone()));
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(800)).await;
        let _ = shutdown_tx.send(true);
    });

    run_consumer(&mut h.pipeline, rx, Duration::from_millis(20), shutdown_rx).await;
    producer.await.unwrap();
    stopper.await.unwrap();

    assert_eq!(health.link_state(Device::Wrist), LinkState::Failed);
    assert_eq!(h.pipeline.buffer().len(Device::Wrist), 0);

    let model_predictions: Vec<_> = h
        .store
        .documents("Predictions")
        .into_iter()
        .filter_map(|d| match d {
            Document::Prediction(p) if p.provenance == Provenance::Model => Some(p),
            _ => None,
        })
        .collect();
    assert!(!model_predictions.is_empty());
    assert!(model_predictions
        .iter()
        .all(|p| p.devices == vec![Device::Ankle]));

    let sensor = h.store.documents("SensorData");
    assert!(sensor.iter().any(|d| d.kind() == "speed"));
    assert!(h.backlog.pending("Predictions").unwrap().is_empty());
}
