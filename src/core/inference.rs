//! Activity classification.
//!
//! An [`InferenceEngine`] wraps one [`Predictor`], chosen once at startup: a
//! trained model artifact when it loads, the threshold heuristic otherwise.

use crate::core::features::{Channel, FeatureVector, Stat, FEATURE_LEN};
use crate::core::windowing::Window;
use crate::link::types::Device;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Feature read by the heuristic for the wrist.
pub const WRIST_SPREAD_FEATURE: usize =
    FeatureVector::index(Device::Wrist, Channel::AccelMagnitude, Stat::StdDev);

/// Feature read by the heuristic for the ankle.
pub const ANKLE_SPREAD_FEATURE: usize =
    FeatureVector::index(Device::Ankle, Channel::AccelMagnitude, Stat::StdDev);

/// Probability the heuristic assigns to its chosen label.
const FALLBACK_PEAK: f64 = 0.6;

/// Probability the heuristic assigns to every other label.
const FALLBACK_REST: f64 = 0.2;

/// Coarse activity classes, in probability order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activity {
    Idle,
    Walking,
    Running,
}

impl Activity {
    pub const ALL: [Activity; 3] = [Activity::Idle, Activity::Walking, Activity::Running];

    /// Label stored in prediction documents.
    pub fn label(self) -> &'static str {
        match self {
            Activity::Idle => "Idle",
            Activity::Walking => "Walking",
            Activity::Running => "Running",
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Spread thresholds shared by the fallback classifier and synthetic predictions.
///
/// Both bounds are exclusive: a spread equal to `idle_below` is Walking.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivityThresholds {
    pub idle_below: f64,
    pub walking_below: f64,
}

impl Default for ActivityThresholds {
    fn default() -> Self {
        Self {
            idle_below: 0.15,
            walking_below: 0.50,
        }
    }
}

impl ActivityThresholds {
    /// Bucket a spread statistic.
    pub fn classify(&self, spread: f64) -> Activity {
        if spread < self.idle_below {
            Activity::Idle
        } else if spread < self.walking_below {
            Activity::Walking
        } else {
            Activity::Running
        }
    }
}

/// Output of one classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    /// Per-label probabilities, in the predictor's label order
    pub probabilities: Option<Vec<f64>>,
}

impl Classification {
    /// Highest probability, if a distribution is present.
    pub fn confidence(&self) -> Option<f64> {
        self.probabilities
            .as_ref()
            .and_then(|p| p.iter().copied().reduce(f64::max))
    }
}

/// Anything that maps a feature vector to a label.
pub trait Predictor: Send + Sync {
    fn classify(&self, features: &FeatureVector) -> Classification;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Deterministic threshold rule on the accel-magnitude spread of both limbs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackClassifier {
    thresholds: ActivityThresholds,
}

impl FallbackClassifier {
    /// Rule-based predictor over the given thresholds.
    pub fn new(thresholds: ActivityThresholds) -> Self {
        Self { thresholds }
    }
}

impl Predictor for FallbackClassifier {
    fn classify(&self, features: &FeatureVector) -> Classification {
        let values = features.as_slice();
        let spread = values[WRIST_SPREAD_FEATURE].max(values[ANKLE_SPREAD_FEATURE]);
        let activity = self.thresholds.classify(spread);

        let probabilities = Activity::ALL
            .iter()
            .map(|a| {
                if *a == activity {
                    FALLBACK_PEAK
                } else {
                    FALLBACK_REST
                }
            })
            .collect();

        Classification {
            label: activity.label().to_string(),
            probabilities: Some(probabilities),
        }
    }

    fn name(&self) -> &'static str {
        "fallback"
    }
}

/// Reasons a model artifact could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model artifact {0:?} does not exist")]
    Missing(PathBuf),
    #[error("could not read model artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse model artifact: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("model artifact has the wrong shape: {0}")]
    Shape(String),
}

/// Per-feature standardization applied before the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl Scaler {
    fn apply(&self, features: &[f64]) -> Vec<f64> {
        features
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (m, s))| if *s == 0.0 { x - m } else { (x - m) / s })
            .collect()
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.mean.len() != FEATURE_LEN || self.scale.len() != FEATURE_LEN {
            return Err(ModelError::Shape(format!(
                "scaler needs {FEATURE_LEN} means and scales"
            )));
        }
        Ok(())
    }
}

/// Multinomial linear model with softmax output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub labels: Vec<String>,
    /// One row of `FEATURE_LEN` weights per label
    pub weights: Vec<Vec<f64>>,
    pub intercept: Vec<f64>,
    #[serde(default)]
    pub scaler: Option<Scaler>,
}

/// Nearest-centroid model; carries no probabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentroidModel {
    pub labels: Vec<String>,
    /// One centroid of `FEATURE_LEN` values per label
    pub centroids: Vec<Vec<f64>>,
    #[serde(default)]
    pub scaler: Option<Scaler>,
}

/// A trained model artifact (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrainedModel {
    Linear(LinearModel),
    Centroid(CentroidModel),
}

impl TrainedModel {
    /// Load and validate an artifact.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        if !path.exists() {
            return Err(ModelError::Missing(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse a trained model artifact.
    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        let model: TrainedModel = serde_json::from_str(json)?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), ModelError> {
        let (labels, rows, scaler) = match self {
            TrainedModel::Linear(m) => {
                if m.intercept.len() != m.labels.len() {
                    return Err(ModelError::Shape(format!(
                        "{} intercepts for {} labels",
                        m.intercept.len(),
                        m.labels.len()
                    )));
                }
                (&m.labels, &m.weights, &m.scaler)
            }
            TrainedModel::Centroid(m) => (&m.labels, &m.centroids, &m.scaler),
        };

        if labels.is_empty() {
            return Err(ModelError::Shape("no labels".to_string()));
        }
        if rows.len() != labels.len() {
            return Err(ModelError::Shape(format!(
                "{} rows for {} labels",
                rows.len(),
                labels.len()
            )));
        }
        if let Some(row) = rows.iter().find(|r| r.len() != FEATURE_LEN) {
            return Err(ModelError::Shape(format!(
                "row has {} values, expected {FEATURE_LEN}",
                row.len()
            )));
        }
        if let Some(scaler) = scaler {
            scaler.validate()?;
        }
        Ok(())
    }
}

fn scaled(scaler: &Option<Scaler>, features: &FeatureVector) -> Vec<f64> {
    match scaler {
        Some(s) => s.apply(features.as_slice()),
        None => features.as_slice().to_vec(),
    }
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

impl Predictor for TrainedModel {
    fn classify(&self, features: &FeatureVector) -> Classification {
        match self {
            TrainedModel::Linear(m) => {
                let x = scaled(&m.scaler, features);
                let scores: Vec<f64> = m
                    .weights
                    .iter()
                    .zip(&m.intercept)
                    .map(|(row, b)| row.iter().zip(&x).map(|(w, v)| w * v).sum::<f64>() + b)
                    .collect();
                let probabilities = softmax(&scores);
                let best = argmax(&probabilities);
                Classification {
                    label: m.labels[best].clone(),
                    probabilities: Some(probabilities),
                }
            }
            TrainedModel::Centroid(m) => {
                let x = scaled(&m.scaler, features);
                let distances: Vec<f64> = m
                    .centroids
                    .iter()
                    .map(|c| c.iter().zip(&x).map(|(a, b)| (a - b).powi(2)).sum::<f64>())
                    .map(|d| -d)
                    .collect();
                Classification {
                    label: m.labels[argmax(&distances)].clone(),
                    probabilities: None,
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            TrainedModel::Linear(_) => "linear",
            TrainedModel::Centroid(_) => "centroid",
        }
    }
}

fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, v)| {
            if *v > best.1 {
                (i, *v)
            } else {
                best
            }
        })
        .0
}

/// Which predictor an engine ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictorSource {
    Trained,
    Fallback,
}

/// Feature extraction plus one predictor.
pub struct InferenceEngine {
    predictor: Box<dyn Predictor>,
    source: PredictorSource,
}

impl InferenceEngine {
    /// Load the artifact at `model_path`, falling back to the heuristic on any failure.
    pub fn load(model_path: Option<&Path>, thresholds: ActivityThresholds) -> Self {
        let Some(path) = model_path else {
            info!("no model configured, using fallback classifier");
            return Self::fallback(thresholds);
        };

        match TrainedModel::load(path) {
            Ok(model) => {
                info!(path = ?path, kind = model.name(), "loaded trained model");
                Self {
                    predictor: Box::new(model),
                    source: PredictorSource::Trained,
                }
            }
            Err(ModelError::Missing(_)) => {
                info!(path = ?path, "model artifact not found, using fallback classifier");
                Self::fallback(thresholds)
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "model unavailable, using fallback classifier");
                Self::fallback(thresholds)
            }
        }
    }

    /// Engine running only the rule-based predictor.
    pub fn fallback(thresholds: ActivityThresholds) -> Self {
        Self {
            predictor: Box::new(FallbackClassifier::new(thresholds)),
            source: PredictorSource::Fallback,
        }
    }

    /// Engine around a caller-supplied predictor.
    pub fn with_predictor(predictor: Box<dyn Predictor>) -> Self {
        Self {
            predictor,
            source: PredictorSource::Trained,
        }
    }

    /// Whether the trained model loaded.
    pub fn source(&self) -> PredictorSource {
        self.source
    }

    /// Short name for logs and status output.
    pub fn predictor_name(&self) -> &'static str {
        self.predictor.name()
    }

    /// Classify one feature vector.
    pub fn classify(&self, features: &FeatureVector) -> Classification {
        self.predictor.classify(features)
    }

    /// Extract features from `window` and classify them.
    pub fn classify_window(&self, window: &Window) -> (FeatureVector, Classification) {
        let features = crate::core::features::compute_features(window);
        let classification = self.classify(&features);
        (features, classification)
    }
}

impl fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("predictor", &self.predictor.name())
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn spreads(wrist: f64, ankle: f64) -> FeatureVector {
        let mut values = vec![0.0; FEATURE_LEN];
        values[13] = wrist;
        values[33] = ankle;
        FeatureVector::try_from(values).unwrap()
    }

    #[test]
    fn test_spread_feature_indices() {
        assert_eq!(WRIST_SPREAD_FEATURE, 13);
        assert_eq!(ANKLE_SPREAD_FEATURE, 33);
    }

    #[test]
    fn test_fallback_thresholds() {
        let classifier = FallbackClassifier::default();
        assert_eq!(classifier.classify(&spreads(0.10, 0.05)).label, "Idle");
        assert_eq!(classifier.classify(&spreads(0.30, 0.20)).label, "Walking");
        assert_eq!(classifier.classify(&spreads(0.60, 0.10)).label, "Running");
        assert_eq!(classifier.classify(&spreads(0.05, 0.70)).label, "Running");
    }

    #[test]
    fn test_threshold_bounds_are_exclusive_below() {
        let thresholds = ActivityThresholds::default();
        assert_eq!(thresholds.classify(0.1499), Activity::Idle);
        assert_eq!(thresholds.classify(0.15), Activity::Walking);
        assert_eq!(thresholds.classify(0.4999), Activity::Walking);
        assert_eq!(thresholds.classify(0.50), Activity::Running);
    }

    #[test]
    fn test_fallback_distribution_is_peaked() {
        let result = FallbackClassifier::default().classify(&spreads(0.3, 0.0));
        assert_eq!(result.probabilities, Some(vec![0.2, 0.6, 0.2]));
        assert_eq!(result.confidence(), Some(0.6));
        let total: f64 = result.probabilities.unwrap().iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_custom_thresholds() {
        let classifier = FallbackClassifier::new(ActivityThresholds {
            idle_below: 0.05,
            walking_below: 0.1,
        });
        assert_eq!(classifier.classify(&spreads(0.08, 0.0)).label, "Walking");
    }

    fn linear_json() -> String {
        let mut weights = vec![vec![0.0; FEATURE_LEN]; 2];
        weights[1][13] = 10.0;
        serde_json::json!({
            "kind": "linear",
            "labels": ["Still", "Moving"],
            "weights": weights,
            "intercept": [1.0, 0.0],
        })
        .to_string()
    }

    #[test]
    fn test_linear_model() {
        let model = TrainedModel::from_json(&linear_json()).unwrap();
        let still = model.classify(&spreads(0.0, 0.0));
        assert_eq!(still.label, "Still");
        let moving = model.classify(&spreads(1.0, 0.0));
        assert_eq!(moving.label, "Moving");

        let total: f64 = moving.probabilities.unwrap().iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_centroid_model_has_no_distribution() {
        let mut centroids = vec![vec![0.0; FEATURE_LEN]; 2];
        centroids[1][33] = 1.0;
        let json = serde_json::json!({
            "kind": "centroid",
            "labels": ["Idle", "Active"],
            "centroids": centroids,
        })
        .to_string();
        let model = TrainedModel::from_json(&json).unwrap();

        let result = model.classify(&spreads(0.0, 0.9));
        assert_eq!(result.label, "Active");
        assert!(result.probabilities.is_none());
    }

    #[test]
    fn test_shape_errors() {
        let json = serde_json::json!({
            "kind": "linear",
            "labels": ["A"],
            "weights": [[1.0, 2.0]],
            "intercept": [0.0],
        })
        .to_string();
        assert!(matches!(
            TrainedModel::from_json(&json),
            Err(ModelError::Shape(_))
        ));
    }

    #[test]
    fn test_engine_falls_back_on_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();

        let missing = InferenceEngine::load(
            Some(&dir.path().join("absent.json")),
            ActivityThresholds::default(),
        );
        assert_eq!(missing.source(), PredictorSource::Fallback);

        let corrupt_path = dir.path().join("corrupt.json");
        let mut file = std::fs::File::create(&corrupt_path).unwrap();
        file.write_all(b"\x80\x04joblib-pickle").unwrap();
        let corrupt = InferenceEngine::load(Some(&corrupt_path), ActivityThresholds::default());
        assert_eq!(corrupt.source(), PredictorSource::Fallback);
        assert_eq!(corrupt.predictor_name(), "fallback");

        let good_path = dir.path().join("model.json");
        std::fs::write(&good_path, linear_json()).unwrap();
        let good = InferenceEngine::load(Some(&good_path), ActivityThresholds::default());
        assert_eq!(good.source(), PredictorSource::Trained);
        assert_eq!(good.predictor_name(), "linear");
    }

    #[test]
    fn test_classify_window_uses_extracted_features() {
        use crate::core::sample::{Sample, Vec3};

        let calm: Vec<Sample> = (0..20)
            .map(|i| Sample::new(Vec3::new(0.0, 0.0, 1.0 + 0.001 * i as f64), Vec3::default()))
            .collect();
        let engine = InferenceEngine::fallback(ActivityThresholds::default());
        let (features, result) = engine.classify_window(&Window::new(calm, Vec::new()));

        assert!(features.as_slice()[13] < 0.15);
        assert_eq!(result.label, "Idle");
    }
}
