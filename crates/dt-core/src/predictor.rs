//! Optional learned predictor.
//!
//! The engine never depends on a model being present. A predictor answers with
//! the [`Prediction`] sum type: either an output or [`Prediction::Unavailable`],
//! which is an expected degraded state rather than an error. Internal failures
//! (corrupt weights, incompatible feature shape, non-finite output) are converted
//! into `Unavailable` with the cause retained for logging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

use crate::decision::{Method, MethodOutput, Verdict};
use crate::features::{FeatureRecord, FEATURE_NAMES};

/// Minimum number of labeled samples required to fit a model.
pub const MIN_TRAINING_SAMPLES: usize = 20;

/// Errors raised while loading or training a model artifact.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to read model artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse model artifact: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Incompatible feature shape: expected {expected:?}, artifact has {actual:?}")]
    FeatureShape {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Invalid model weights: {0}")]
    InvalidWeights(String),

    #[error("Insufficient training data: {0} samples provided, minimum {1} required")]
    InsufficientData(usize, usize),
}

/// Why a predictor could not produce an output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnavailableReason {
    /// No trained model is loaded.
    NotLoaded,
    /// The model is loaded but failed on this input.
    Failed { cause: String },
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnavailableReason::NotLoaded => write!(f, "no model loaded"),
            UnavailableReason::Failed { cause } => write!(f, "model failed: {}", cause),
        }
    }
}

/// Result of a prediction attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Available(MethodOutput),
    Unavailable(UnavailableReason),
}

/// A learned classifier over feature records.
///
/// Implementations must be safe for concurrent read-only use from many
/// in-flight analyses and must never panic on well-formed input.
pub trait ModelPredictor: Send + Sync {
    /// Returns true if a trained model is loaded.
    fn is_available(&self) -> bool;

    /// Predicts a verdict for the given record.
    fn predict(&self, features: &FeatureRecord) -> Prediction;

    /// Returns the version of the loaded artifact, if any.
    fn version(&self) -> Option<&str> {
        None
    }
}

/// Predictor used when no model artifact exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoModel;

impl ModelPredictor for NoModel {
    fn is_available(&self) -> bool {
        false
    }

    fn predict(&self, _features: &FeatureRecord) -> Prediction {
        Prediction::Unavailable(UnavailableReason::NotLoaded)
    }
}

/// Serialized form of a logistic model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelArtifact {
    pub version: String,
    pub feature_names: Vec<String>,
    pub weights: Vec<f64>,
    pub bias: f64,
    /// Per-feature means used for standardisation (empty = no standardisation).
    #[serde(default)]
    pub feature_means: Vec<f64>,
    /// Per-feature scales used for standardisation (empty = no standardisation).
    #[serde(default)]
    pub feature_scales: Vec<f64>,
    #[serde(default)]
    pub trained_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub training_samples: usize,
}

/// Logistic regression over the extractor's feature vector.
///
/// Predicts the probability of FAIL; the reported confidence is the
/// probability of the chosen class.
#[derive(Debug, Clone)]
pub struct LogisticModel {
    artifact: ModelArtifact,
}

impl LogisticModel {
    /// Builds a model from an artifact, validating its shape and weights.
    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self, ModelError> {
        let expected: Vec<String> = FEATURE_NAMES.iter().map(|s| s.to_string()).collect();
        if artifact.feature_names != expected {
            return Err(ModelError::FeatureShape {
                expected,
                actual: artifact.feature_names,
            });
        }
        if artifact.weights.len() != FEATURE_NAMES.len() {
            return Err(ModelError::InvalidWeights(format!(
                "{} weights for {} features",
                artifact.weights.len(),
                FEATURE_NAMES.len()
            )));
        }
        for (name, values) in [
            ("feature_means", &artifact.feature_means),
            ("feature_scales", &artifact.feature_scales),
        ] {
            if !values.is_empty() && values.len() != FEATURE_NAMES.len() {
                return Err(ModelError::InvalidWeights(format!(
                    "{} has {} entries",
                    name,
                    values.len()
                )));
            }
        }
        if artifact.feature_means.len() != artifact.feature_scales.len() {
            return Err(ModelError::InvalidWeights(
                "feature_means and feature_scales must be given together".to_string(),
            ));
        }
        if artifact.feature_scales.iter().any(|s| *s <= 0.0) {
            return Err(ModelError::InvalidWeights(
                "feature scales must be positive".to_string(),
            ));
        }
        let all_finite = artifact
            .weights
            .iter()
            .chain(artifact.feature_means.iter())
            .chain(artifact.feature_scales.iter())
            .chain(std::iter::once(&artifact.bias))
            .all(|v| v.is_finite());
        if !all_finite {
            return Err(ModelError::InvalidWeights(
                "non-finite parameter".to_string(),
            ));
        }
        Ok(Self { artifact })
    }

    /// Parses and validates a JSON artifact.
    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        let artifact: ModelArtifact = serde_json::from_str(json)?;
        Self::from_artifact(artifact)
    }

    /// Loads and validates an artifact from disk.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Returns the underlying artifact.
    pub fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    fn standardized(&self, features: &FeatureRecord) -> [f64; FEATURE_NAMES.len()] {
        let mut x = features.feature_vector();
        if !self.artifact.feature_means.is_empty() {
            for (i, value) in x.iter_mut().enumerate() {
                *value = (*value - self.artifact.feature_means[i]) / self.artifact.feature_scales[i];
            }
        }
        x
    }

    /// Returns the probability of FAIL and each feature's contribution.
    fn fail_probability(&self, features: &FeatureRecord) -> (f64, [f64; FEATURE_NAMES.len()]) {
        let x = self.standardized(features);
        let mut contributions = [0.0; FEATURE_NAMES.len()];
        let mut z = self.artifact.bias;
        for (i, value) in x.iter().enumerate() {
            contributions[i] = self.artifact.weights[i] * value;
            z += contributions[i];
        }
        (sigmoid(z), contributions)
    }

    /// Fits a model on labeled records with batch gradient descent.
    ///
    /// Every fifth sample is held out for validation.
    pub fn fit(
        samples: &[(FeatureRecord, Verdict)],
        options: &TrainingOptions,
    ) -> Result<(Self, TrainingSummary), ModelError> {
        if samples.len() < MIN_TRAINING_SAMPLES {
            return Err(ModelError::InsufficientData(
                samples.len(),
                MIN_TRAINING_SAMPLES,
            ));
        }

        let (train, validation): (Vec<_>, Vec<_>) = samples
            .iter()
            .enumerate()
            .partition(|(i, _)| i % 5 != 4);
        let train: Vec<&(FeatureRecord, Verdict)> = train.into_iter().map(|(_, s)| s).collect();
        let validation: Vec<&(FeatureRecord, Verdict)> =
            validation.into_iter().map(|(_, s)| s).collect();

        let n_features = FEATURE_NAMES.len();
        let mut means = vec![0.0; n_features];
        for (record, _) in &train {
            for (i, v) in record.feature_vector().iter().enumerate() {
                means[i] += v;
            }
        }
        for m in &mut means {
            *m /= train.len() as f64;
        }
        let mut scales = vec![0.0; n_features];
        for (record, _) in &train {
            for (i, v) in record.feature_vector().iter().enumerate() {
                scales[i] += (v - means[i]).powi(2);
            }
        }
        for s in &mut scales {
            *s = (*s / train.len() as f64).sqrt();
            if *s < 1e-9 {
                *s = 1.0;
            }
        }

        let standardized: Vec<(Vec<f64>, f64)> = train
            .iter()
            .map(|(record, label)| {
                let x = record
                    .feature_vector()
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (v - means[i]) / scales[i])
                    .collect();
                let y = if *label == Verdict::Fail { 1.0 } else { 0.0 };
                (x, y)
            })
            .collect();

        let mut weights = vec![0.0; n_features];
        let mut bias = 0.0;
        let n = standardized.len() as f64;
        for _ in 0..options.epochs {
            let mut grad_w = vec![0.0; n_features];
            let mut grad_b = 0.0;
            for (x, y) in &standardized {
                let z = bias + weights.iter().zip(x).map(|(w, v)| w * v).sum::<f64>();
                let error = sigmoid(z) - y;
                for (g, v) in grad_w.iter_mut().zip(x) {
                    *g += error * v;
                }
                grad_b += error;
            }
            for (w, g) in weights.iter_mut().zip(&grad_w) {
                *w -= options.learning_rate * (g / n + options.l2_penalty * *w);
            }
            bias -= options.learning_rate * grad_b / n;
        }

        let model = Self::from_artifact(ModelArtifact {
            version: options.version.clone(),
            feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            weights,
            bias,
            feature_means: means,
            feature_scales: scales,
            trained_at: Some(Utc::now()),
            training_samples: train.len(),
        })?;

        let summary = TrainingSummary {
            training_samples: train.len(),
            validation_samples: validation.len(),
            training_accuracy: model.accuracy(&train),
            validation_accuracy: model.accuracy(&validation),
        };
        Ok((model, summary))
    }

    fn accuracy(&self, samples: &[&(FeatureRecord, Verdict)]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let correct = samples
            .iter()
            .filter(|(record, label)| match self.predict(record) {
                Prediction::Available(out) => out.verdict == *label,
                Prediction::Unavailable(_) => false,
            })
            .count();
        correct as f64 / samples.len() as f64
    }
}

impl ModelPredictor for LogisticModel {
    fn is_available(&self) -> bool {
        true
    }

    fn predict(&self, features: &FeatureRecord) -> Prediction {
        let (p_fail, contributions) = self.fail_probability(features);
        if !p_fail.is_finite() {
            return Prediction::Unavailable(UnavailableReason::Failed {
                cause: format!("non-finite output for version {}", self.artifact.version),
            });
        }

        let (verdict, confidence) = if p_fail >= 0.5 {
            (Verdict::Fail, p_fail)
        } else {
            (Verdict::Pass, 1.0 - p_fail)
        };

        let top = contributions
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .map(|(i, _)| FEATURE_NAMES[i]);

        let mut output = MethodOutput::new(Method::Model, verdict, confidence);
        if let Some(name) = top {
            output = output.with_tag(format!("top_feature={}", name));
        }
        Prediction::Available(output)
    }

    fn version(&self) -> Option<&str> {
        Some(&self.artifact.version)
    }
}

/// Hyper-parameters for [`LogisticModel::fit`].
#[derive(Debug, Clone)]
pub struct TrainingOptions {
    pub epochs: usize,
    pub learning_rate: f64,
    pub l2_penalty: f64,
    pub version: String,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            epochs: 500,
            learning_rate: 0.5,
            l2_penalty: 1e-3,
            version: "1.0.0".to_string(),
        }
    }
}

/// Outcome of a training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub training_samples: usize,
    pub validation_samples: usize,
    pub training_accuracy: f64,
    pub validation_accuracy: f64,
}

/// Hot-swappable holder for the active predictor.
///
/// Readers clone the inner `Arc` and release the lock immediately, so a swap
/// never waits on an in-flight prediction.
pub struct ModelSlot {
    current: RwLock<Arc<dyn ModelPredictor>>,
}

impl ModelSlot {
    /// Creates a slot holding the given predictor.
    pub fn new(predictor: Arc<dyn ModelPredictor>) -> Self {
        Self {
            current: RwLock::new(predictor),
        }
    }

    /// Creates an empty slot.
    pub fn empty() -> Self {
        Self::new(Arc::new(NoModel))
    }

    /// Returns the active predictor.
    pub fn current(&self) -> Arc<dyn ModelPredictor> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replaces the active predictor.
    pub fn install(&self, predictor: Arc<dyn ModelPredictor>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = predictor;
    }

    /// Unloads the active predictor.
    pub fn clear(&self) {
        self.install(Arc::new(NoModel));
    }
}

impl Default for ModelSlot {
    fn default() -> Self {
        Self::empty()
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(deformation: f64, shatter: bool) -> FeatureRecord {
        FeatureRecord {
            deformation_ratio: deformation,
            shatter,
            spill: false,
            impact_frame: None,
            trajectory_deviation: 0.0,
            spill_area: 0.0,
            contour_ratio: 1.0,
            material: "plastic".to_string(),
            tester: "tester".to_string(),
            timestamp: Utc::now(),
        }
    }

    fn artifact() -> ModelArtifact {
        ModelArtifact {
            version: "test-1".to_string(),
            feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            weights: vec![40.0, 6.0, 6.0, 0.0, 0.0, 0.0],
            bias: -6.0,
            feature_means: Vec::new(),
            feature_scales: Vec::new(),
            trained_at: None,
            training_samples: 0,
        }
    }

    #[test]
    fn test_no_model_is_unavailable() {
        let model = NoModel;
        assert!(!model.is_available());
        assert_eq!(
            model.predict(&record(0.1, false)),
            Prediction::Unavailable(UnavailableReason::NotLoaded)
        );
    }

    #[test]
    fn test_logistic_predictions() {
        let model = LogisticModel::from_artifact(artifact()).unwrap();
        assert!(model.is_available());
        assert_eq!(model.version(), Some("test-1"));

        match model.predict(&record(0.02, false)) {
            Prediction::Available(out) => {
                assert_eq!(out.method, Method::Model);
                assert_eq!(out.verdict, Verdict::Pass);
                assert!(out.raw_confidence > 0.9);
                assert!((0.0..=1.0).contains(&out.raw_confidence));
            }
            other => panic!("expected prediction, got {:?}", other),
        }

        match model.predict(&record(0.4, false)) {
            Prediction::Available(out) => {
                assert_eq!(out.verdict, Verdict::Fail);
                assert!(out.tags.contains(&"top_feature=deformation_ratio".to_string()));
            }
            other => panic!("expected prediction, got {:?}", other),
        }
    }

    #[test]
    fn test_feature_shape_mismatch_rejected() {
        let mut a = artifact();
        a.feature_names.pop();
        assert!(matches!(
            LogisticModel::from_artifact(a),
            Err(ModelError::FeatureShape { .. })
        ));
    }

    #[test]
    fn test_non_finite_weights_rejected() {
        let mut a = artifact();
        a.weights[0] = f64::NAN;
        assert!(matches!(
            LogisticModel::from_artifact(a),
            Err(ModelError::InvalidWeights(_))
        ));
    }

    #[test]
    fn test_corrupt_json_rejected() {
        assert!(matches!(
            LogisticModel::from_json("{not json"),
            Err(ModelError::Parse(_))
        ));
    }

    #[test]
    fn test_non_finite_input_becomes_unavailable() {
        let model = LogisticModel::from_artifact(artifact()).unwrap();
        let mut r = record(0.1, false);
        r.trajectory_deviation = f64::NAN;

        assert!(matches!(
            model.predict(&r),
            Prediction::Unavailable(UnavailableReason::Failed { .. })
        ));
    }

    #[test]
    fn test_fit_separates_classes() {
        let mut samples = Vec::new();
        for i in 0..30 {
            let d = 0.01 + (i as f64) * 0.002;
            samples.push((record(d, false), Verdict::Pass));
            samples.push((record(0.3 + d, false), Verdict::Fail));
        }
        let (model, summary) = LogisticModel::fit(&samples, &TrainingOptions::default()).unwrap();

        assert_eq!(summary.training_samples + summary.validation_samples, 60);
        assert!(summary.training_accuracy > 0.9, "{:?}", summary);
        assert!(summary.validation_accuracy > 0.9, "{:?}", summary);
        assert!(matches!(
            model.predict(&record(0.5, false)),
            Prediction::Available(MethodOutput {
                verdict: Verdict::Fail,
                ..
            })
        ));
    }

    #[test]
    fn test_fit_requires_minimum_samples() {
        let samples = vec![(record(0.1, false), Verdict::Pass); 5];
        assert!(matches!(
            LogisticModel::fit(&samples, &TrainingOptions::default()),
            Err(ModelError::InsufficientData(5, MIN_TRAINING_SAMPLES))
        ));
    }

    #[test]
    fn test_model_slot_swap() {
        let slot = ModelSlot::empty();
        assert!(!slot.current().is_available());

        let held = slot.current();
        slot.install(Arc::new(LogisticModel::from_artifact(artifact()).unwrap()));
        assert!(slot.current().is_available());
        assert!(!held.is_available());

        slot.clear();
        assert!(!slot.current().is_available());
    }
}
