//! Configuration for the telemetry hub.
//!
//! Read from environment-style keys (`FS_HZ`, `MONGO_URI`, ...). Lookup is
//! injectable so tests never touch the process environment.

use crate::core::inference::ActivityThresholds;
use crate::core::windowing::window_len;
use crate::link::manager::{LinkSettings, LinkTarget};
use crate::link::types::Device;
use crate::pipeline::PipelineSettings;
use crate::store::{redact_uri, StoreConfig, StoreKind};
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Longest accepted classification window.
const MAX_WINDOW_SECONDS: f64 = 60.0;

/// Longest accepted interval or timeout.
const MAX_INTERVAL_SECONDS: f64 = 86_400.0;

/// Where samples come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    /// Live wireless links through the host Bluetooth adapter
    Ble,
    /// Generated samples from emulated nodes over the full link lifecycle
    Emulated,
    /// NDJSON sample frames on stdin
    Synthetic,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BLE" => Ok(Mode::Ble),
            "EMULATED" | "EMULATOR" => Ok(Mode::Emulated),
            "SYNTHETIC" | "MOCK" => Ok(Mode::Synthetic),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Ble => f.write_str("BLE"),
            Mode::Emulated => f.write_str("EMULATED"),
            Mode::Synthetic => f.write_str("SYNTHETIC"),
        }
    }
}

/// Main configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub mode: Mode,
    pub sample_rate_hz: u16,
    pub window_seconds: f64,
    pub upload_interval_secs: f64,
    /// Persist every raw sample as a document
    pub save_raw: bool,
    /// Ask nodes for the raw characteristic
    pub enable_raw: bool,

    /// Remote store URI (`mongodb://`, `mongodb+srv://` or an HTTPS data
    /// endpoint); `None` turns both sinks off. Credentials are redacted when
    /// serialized.
    #[serde(serialize_with = "serialize_redacted_uri")]
    pub store_uri: Option<String>,
    #[serde(skip_serializing)]
    pub store_api_key: Option<String>,
    pub store_data_source: String,
    pub database: String,
    pub sensor_collection: String,
    pub prediction_collection: String,
    pub require_store: bool,

    pub model_path: PathBuf,
    pub eager_predictions: bool,
    pub prediction_interval_ms: u64,
    pub backlog_dir: PathBuf,

    pub wrist_name: String,
    pub ankle_name: String,
    pub discovery_timeout_secs: f64,

    pub thresholds: ActivityThresholds,
    pub stale_raw_secs: f64,
    pub queue_poll_ms: u64,
    pub heartbeat_secs: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Ble,
            sample_rate_hz: 100,
            window_seconds: 2.0,
            upload_interval_secs: 5.0,
            save_raw: false,
            enable_raw: true,
            store_uri: None,
            store_api_key: None,
            store_data_source: "Cluster0".to_string(),
            database: "HAR_Project".to_string(),
            sensor_collection: "SensorData".to_string(),
            prediction_collection: "Predictions".to_string(),
            require_store: false,
            model_path: PathBuf::from("final_HAR_model.json"),
            eager_predictions: false,
            prediction_interval_ms: 0,
            backlog_dir: Self::default_backlog_dir(),
            wrist_name: "AMS-Wrist".to_string(),
            ankle_name: "AMS-Ankle".to_string(),
            discovery_timeout_secs: 5.0,
            thresholds: ActivityThresholds::default(),
            stale_raw_secs: 1.0,
            queue_poll_ms: 50,
            heartbeat_secs: 1.0,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Unset and blank keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(v) = get("MODE") {
            config.mode = v.parse().map_err(|_| ConfigError::invalid("MODE", &v))?;
        }
        if let Some(v) = get("FS_HZ") {
            config.sample_rate_hz = match v.parse::<u16>() {
                Ok(hz) if hz > 0 => hz,
                _ => return Err(ConfigError::invalid("FS_HZ", &v)),
            };
        }
        if let Some(v) = get("WINDOW_SECONDS") {
            config.window_seconds = parse_seconds("WINDOW_SECONDS", &v, false, MAX_WINDOW_SECONDS)?;
        }
        if let Some(v) = get("BATCH_UPLOAD_SECONDS") {
            config.upload_interval_secs =
                parse_seconds("BATCH_UPLOAD_SECONDS", &v, true, MAX_INTERVAL_SECONDS)?;
        }
        if let Some(v) = get("SAVE_RAW") {
            config.save_raw = parse_bool("SAVE_RAW", &v)?;
        }
        if let Some(v) = get("ENABLE_RAW") {
            config.enable_raw = parse_bool("ENABLE_RAW", &v)?;
        }

        config.store_uri = get("MONGO_URI");
        config.store_api_key = get("MONGO_API_KEY");
        if let Some(v) = get("MONGO_DATA_SOURCE") {
            config.store_data_source = v;
        }
        if let Some(v) = get("MONGO_DB") {
            config.database = v;
        }
        if let Some(v) = get("MONGO_COLLECTION") {
            config.sensor_collection = v;
        }
        if let Some(v) = get("MONGO_PRED_COLLECTION") {
            config.prediction_collection = v;
        }
        if let Some(v) = get("REQUIRE_STORE") {
            config.require_store = parse_bool("REQUIRE_STORE", &v)?;
        }

        if let Some(v) = get("MODEL_PATH") {
            config.model_path = PathBuf::from(v);
        }
        if let Some(v) = get("PRED_UPLOAD_EAGER") {
            config.eager_predictions = parse_bool("PRED_UPLOAD_EAGER", &v)?;
        }
        if let Some(v) = get("PREDICTION_INTERVAL_MS") {
            config.prediction_interval_ms = v
                .parse()
                .map_err(|_| ConfigError::invalid("PREDICTION_INTERVAL_MS", &v))?;
        }
        if let Some(v) = get("BACKLOG_DIR") {
            config.backlog_dir = PathBuf::from(v);
        }

        if let Some(v) = get("WRIST_NAME") {
            config.wrist_name = v;
        }
        if let Some(v) = get("ANKLE_NAME") {
            config.ankle_name = v;
        }
        if let Some(v) = get("DISCOVERY_TIMEOUT_SECONDS") {
            config.discovery_timeout_secs =
                parse_seconds("DISCOVERY_TIMEOUT_SECONDS", &v, false, MAX_INTERVAL_SECONDS)?;
        }

        if let Some(v) = get("IDLE_MAX_STD") {
            config.thresholds.idle_below = parse_non_negative("IDLE_MAX_STD", &v, true)?;
        }
        if let Some(v) = get("WALK_MAX_STD") {
            config.thresholds.walking_below = parse_non_negative("WALK_MAX_STD", &v, true)?;
        }
        if config.thresholds.walking_below < config.thresholds.idle_below {
            return Err(ConfigError::invalid(
                "WALK_MAX_STD",
                &config.thresholds.walking_below.to_string(),
            ));
        }
        if let Some(v) = get("STALE_RAW_SECONDS") {
            config.stale_raw_secs =
                parse_seconds("STALE_RAW_SECONDS", &v, true, MAX_INTERVAL_SECONDS)?;
        }
        if let Some(v) = get("QUEUE_POLL_MS") {
            config.queue_poll_ms = match v.parse::<u64>() {
                Ok(ms) if ms > 0 => ms,
                _ => return Err(ConfigError::invalid("QUEUE_POLL_MS", &v)),
            };
        }
        if let Some(v) = get("HEARTBEAT_SECONDS") {
            config.heartbeat_secs =
                parse_seconds("HEARTBEAT_SECONDS", &v, false, MAX_INTERVAL_SECONDS)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-key requirements.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.require_store && self.store_uri.is_none() {
            return Err(ConfigError::MissingRequired("MONGO_URI"));
        }
        if let Some(uri) = &self.store_uri {
            if StoreKind::detect(uri).is_none() {
                return Err(ConfigError::invalid("MONGO_URI", &redact_uri(uri)));
            }
        }
        Ok(())
    }

    /// Default backlog location under the local data directory.
    pub fn default_backlog_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("har-central")
            .join("backlog")
    }

    /// Samples per classification window.
    pub fn window_len(&self) -> usize {
        window_len(f64::from(self.sample_rate_hz), self.window_seconds)
    }

    /// Spacing between batch uploads.
    pub fn upload_interval(&self) -> Duration {
        seconds(self.upload_interval_secs)
    }

    /// How long the consumer waits on an empty queue before ticking.
    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    /// Link timing for both devices.
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            discovery_timeout: seconds(self.discovery_timeout_secs),
            enable_raw: self.enable_raw,
            sample_rate_hz: self.sample_rate_hz,
            ..LinkSettings::default()
        }
    }

    /// The wrist and ankle nodes, by advertised name.
    pub fn link_targets(&self) -> Vec<LinkTarget> {
        vec![
            LinkTarget::new(Device::Wrist, &self.wrist_name),
            LinkTarget::new(Device::Ankle, &self.ankle_name),
        ]
    }

    /// Orchestrator tunables.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            window_len: self.window_len(),
            save_raw: self.save_raw,
            stale_raw_after: seconds(self.stale_raw_secs),
            prediction_interval: Duration::from_millis(self.prediction_interval_ms),
            eager_predictions: self.eager_predictions,
            heartbeat_interval: seconds(self.heartbeat_secs),
            thresholds: self.thresholds,
        }
    }

    /// Store URI safe to print.
    pub fn redacted_store_uri(&self) -> Option<String> {
        self.store_uri.as_deref().map(redact_uri)
    }

    /// Remote store settings, when a store is configured.
    pub fn store_config(&self) -> Option<StoreConfig> {
        self.store_uri.as_ref().map(|uri| StoreConfig {
            api_key: self.store_api_key.clone(),
            data_source: self.store_data_source.clone(),
            ..StoreConfig::new(uri.clone(), self.database.clone())
        })
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, value)),
    }
}

/// Parse a finite, non-negative number; zero only when `allow_zero`.
fn parse_non_negative(key: &'static str, value: &str, allow_zero: bool) -> Result<f64, ConfigError> {
    match value.parse::<f64>() {
        Ok(n) if n.is_finite() && (n > 0.0 || (allow_zero && n == 0.0)) => Ok(n),
        _ => Err(ConfigError::invalid(key, value)),
    }
}

/// Parse a duration in seconds, no longer than `max`.
fn parse_seconds(
    key: &'static str,
    value: &str,
    allow_zero: bool,
    max: f64,
) -> Result<f64, ConfigError> {
    let secs = parse_non_negative(key, value, allow_zero)?;
    if secs > max || Duration::try_from_secs_f64(secs).is_err() {
        return Err(ConfigError::invalid(key, value));
    }
    Ok(secs)
}

/// Saturating seconds-to-duration conversion.
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

fn serialize_redacted_uri<S: Serializer>(
    uri: &Option<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match uri {
        Some(uri) => serializer.serialize_some(&redact_uri(uri)),
        None => serializer.serialize_none(),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{0} is required")]
    MissingRequired(&'static str),
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str) -> Self {
        ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }
    }
}
