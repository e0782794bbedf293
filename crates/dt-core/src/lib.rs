//! # dt-core
//!
//! Hybrid analysis and confidence calibration engine for bottle drop tests.
//!
//! Turns per-test measurements into a PASS/FAIL [`Decision`] with a calibrated
//! confidence, blending a deterministic rule classifier with an optional
//! learned model, flagging ambiguous results for review, and feeding reviewed
//! outcomes back into thresholds and calibration curves.

pub mod adaptation;
pub mod calibration;
pub mod config;
pub mod decision;
pub mod engine;
pub mod features;
pub mod fusion;
pub mod params;
pub mod predictor;
pub mod rules;
pub mod training;

pub use adaptation::{spawn_adaptation_task, AdaptationError, AdaptationReport, ThresholdAdapter};
pub use calibration::{CalibrationCurve, CalibrationSet, CurveKey};
pub use config::{ConfigError, EngineConfig};
pub use decision::{
    CalibratedOutput, ConfidenceLevel, Decision, DecisionTag, FusionPath, Method, MethodOutput,
    Verdict,
};
pub use engine::{AnalysisEngine, AnalysisError};
pub use features::{extract, FeatureRecord, InvalidInputError, Measurement};
pub use fusion::{fuse, AmbiguousBand, FusionConfig, FusionOutcome};
pub use params::{EngineParameters, ParameterStore};
pub use predictor::{
    LogisticModel, ModelError, ModelPredictor, ModelSlot, NoModel, Prediction, UnavailableReason,
};
pub use rules::{RuleClassifier, RuleThresholds};
pub use training::{
    spawn_archive_consumer, ArchiveQueue, InMemorySampleStore, JsonlSampleStore, LabelProvenance,
    LabeledSample, PerformanceStats, PersistenceError, SampleStore, TrainingCollector,
};
