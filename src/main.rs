//! HAR central CLI
//!
//! Two-node wearable telemetry hub.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use har_central::{
    config::{Config, Mode},
    core::{FeatureVector, InferenceEngine, PredictorSource},
    health::{create_shared_health, SharedHealth},
    link::{Central, LinkManager, Packet, SimulatedCentral},
    pipeline::Pipeline,
    router::{run_consumer, run_producer, spawn_frame_reader, Inbound},
    store::{self, BacklogDir, BacklogSink},
    uploader::{BatchUploader, FlushOutcome},
    VERSION,
};

#[cfg(feature = "ble")]
use har_central::link::BtleCentral;

#[derive(Parser)]
#[command(name = "har-central")]
#[command(version = VERSION)]
#[command(about = "Wearable telemetry hub: link management, activity classification, resilient upload", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the telemetry pipeline (default)
    Run {
        /// Sample source: BLE, EMULATED, SYNTHETIC or MOCK
        #[arg(long)]
        mode: Option<Mode>,

        /// Sample rate in Hz
        #[arg(long)]
        rate: Option<u16>,

        /// Trained model artifact
        #[arg(long)]
        model: Option<PathBuf>,
    },

    /// Show configuration and pending backlog
    Status,

    /// Replay the backlog once and exit
    Replay,

    /// Print the effective configuration as JSON
    Config,

    /// Classify a 40-value feature vector read from stdin as a JSON array
    Classify,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "har_central=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env().context("invalid configuration")?;

    match cli.command.unwrap_or(Commands::Run {
        mode: None,
        rate: None,
        model: None,
    }) {
        Commands::Run { mode, rate, model } => {
            if let Some(mode) = mode {
                config.mode = mode;
            }
            if let Some(rate) = rate {
                if rate == 0 {
                    bail!("--rate must be positive");
                }
                config.sample_rate_hz = rate;
            }
            if let Some(model) = model {
                config.model_path = model;
            }
            cmd_run(config).await
        }
        Commands::Status => cmd_status(&config),
        Commands::Replay => cmd_replay(&config).await,
        Commands::Config => cmd_config(&config),
        Commands::Classify => cmd_classify(&config),
    }
}

async fn cmd_run(config: Config) -> anyhow::Result<()> {
    println!("HAR central v{VERSION}");
    println!();
    println!("  Mode: {}", config.mode);
    println!(
        "  Window: {} samples ({}s at {} Hz)",
        config.window_len(),
        config.window_seconds,
        config.sample_rate_hz
    );
    println!("  Upload interval: {}s", config.upload_interval_secs);

    let health = create_shared_health();
    let engine = InferenceEngine::load(Some(&config.model_path), config.thresholds);
    println!("  Classifier: {}", engine.predictor_name());

    let (sensor_sink, prediction_sink) = build_sinks(&config).await?;
    println!(
        "  Uploads: {}",
        if sensor_sink.is_some() {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let now = Instant::now();
    let uploader = BatchUploader::new(
        sensor_sink,
        prediction_sink,
        config.upload_interval(),
        now,
        health.clone(),
    );
    let mut pipeline = Pipeline::new(
        config.pipeline_settings(),
        engine,
        uploader,
        health.clone(),
        now,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(true);
    })
    .context("failed to install Ctrl+C handler")?;

    let outcome = match config.mode {
        Mode::Ble => run_ble(&config, &mut pipeline, &health, shutdown_rx).await?,
        Mode::Emulated => {
            warn!("MODE=EMULATED: all samples are generated by emulated nodes");
            let central = SimulatedCentral::ams_pair(&config.wrist_name, &config.ankle_name);
            run_links(central, &config, &mut pipeline, &health, shutdown_rx).await
        }
        Mode::Synthetic => {
            let (tx, rx) = mpsc::unbounded_channel::<Inbound>();
            // Not joined: the reader may be parked on stdin at shutdown.
            let _reader = spawn_frame_reader(BufReader::new(std::io::stdin()), tx);
            run_consumer(&mut pipeline, rx, config.queue_poll(), shutdown_rx).await
        }
    };

    if !outcome.sensor.status.is_durable() || !outcome.predictions.status.is_durable() {
        warn!("final flush left documents undelivered");
    }

    println!();
    println!("{}", health.summary());
    Ok(())
}

/// Drive the pipeline from the host Bluetooth adapter.
#[cfg(feature = "ble")]
async fn run_ble(
    config: &Config,
    pipeline: &mut Pipeline,
    health: &SharedHealth,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<FlushOutcome> {
    let central = BtleCentral::new()
        .await
        .context("Bluetooth adapter unavailable")?;
    Ok(run_links(central, config, pipeline, health, shutdown).await)
}

#[cfg(not(feature = "ble"))]
async fn run_ble(
    _config: &Config,
    _pipeline: &mut Pipeline,
    _health: &SharedHealth,
    _shutdown: watch::Receiver<bool>,
) -> anyhow::Result<FlushOutcome> {
    bail!("MODE=BLE needs a build with the `ble` feature; MODE=EMULATED runs the node emulator instead")
}

/// Keep both links up through `central` and feed their notifications to
/// the pipeline until shutdown.
async fn run_links<C: Central + 'static>(
    central: C,
    config: &Config,
    pipeline: &mut Pipeline,
    health: &SharedHealth,
    shutdown: watch::Receiver<bool>,
) -> FlushOutcome {
    let (tx, rx) = mpsc::unbounded_channel::<Packet>();
    let links = LinkManager::new(
        central,
        config.link_targets(),
        config.link_settings(),
        tx,
        health.clone(),
    );

    let producer = tokio::spawn(run_producer(links, shutdown.clone()));
    let outcome = run_consumer(pipeline, rx, config.queue_poll(), shutdown).await;
    if let Err(e) = producer.await {
        warn!(error = %e, "link task ended abnormally");
    }
    outcome
}

async fn build_sinks(
    config: &Config,
) -> anyhow::Result<(Option<BacklogSink>, Option<BacklogSink>)> {
    let Some(store_config) = config.store_config() else {
        warn!("MONGO_URI not set, sensor and prediction uploads are off");
        return Ok((None, None));
    };

    let store = store::connect(store_config)
        .await
        .context("could not set up the document store")?;
    let backlog = BacklogDir::new(&config.backlog_dir);
    if let Err(e) = backlog.ensure() {
        warn!(path = ?config.backlog_dir, error = %e, "backlog directory unavailable");
    }

    Ok((
        Some(BacklogSink::new(
            store.clone(),
            &config.sensor_collection,
            backlog.clone(),
        )),
        Some(BacklogSink::new(
            store,
            &config.prediction_collection,
            backlog,
        )),
    ))
}

fn cmd_status(config: &Config) -> anyhow::Result<()> {
    println!("HAR central status");
    println!("==================");
    println!();
    println!("Configuration:");
    println!("  Mode: {}", config.mode);
    println!("  Sample rate: {} Hz", config.sample_rate_hz);
    println!("  Window: {} samples", config.window_len());
    println!(
        "  Store: {}",
        config
            .redacted_store_uri()
            .unwrap_or_else(|| "not configured".to_string())
    );
    println!("  Backlog dir: {:?}", config.backlog_dir);

    let engine = InferenceEngine::load(Some(&config.model_path), config.thresholds);
    println!(
        "  Model: {:?} ({})",
        config.model_path,
        match engine.source() {
            PredictorSource::Trained => engine.predictor_name(),
            PredictorSource::Fallback => "unavailable, using fallback",
        }
    );
    println!();

    let counts = BacklogDir::new(&config.backlog_dir)
        .pending_counts()
        .context("could not read backlog directory")?;
    if counts.is_empty() {
        println!("Backlog: empty");
    } else {
        println!("Backlog:");
        for (collection, files) in counts {
            println!("  {collection}: {files} file(s)");
        }
    }
    Ok(())
}

async fn cmd_replay(config: &Config) -> anyhow::Result<()> {
    let (sensor, predictions) = build_sinks(config).await?;
    if sensor.is_none() && predictions.is_none() {
        bail!("MONGO_URI is required to replay the backlog");
    }

    for sink in sensor.iter().chain(predictions.iter()) {
        let report = sink.flush_backlog().await;
        println!(
            "{}: replayed {} file(s), {} document(s); {} remaining, {} unreadable",
            sink.collection(),
            report.replayed_files,
            report.replayed_documents,
            report.remaining_files,
            report.unreadable.len()
        );
        info!(collection = sink.collection(), clear = report.is_clear(), "replay done");
    }
    Ok(())
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn cmd_classify(config: &Config) -> anyhow::Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("failed to read stdin")?;

    let values: Vec<f64> = serde_json::from_str(&input).context("expected a JSON array")?;
    let features = FeatureVector::try_from(values).map_err(anyhow::Error::msg)?;

    let engine = InferenceEngine::load(Some(&config.model_path), config.thresholds);
    let result = engine.classify(&features);
    let output = serde_json::json!({
        "label": result.label,
        "probabilities": result.probabilities,
        "predictor": engine.predictor_name(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
