//! Confidence calibration.
//!
//! Maps each method's raw confidence to a calibrated probability of being
//! correct, using monotone curves keyed by (method, material category).
//!
//! ## Key Components
//!
//! - [`CalibrationSet`]: the immutable curve collection read by live analyses
//! - [`CalibrationCurve`]: one monotone mapping, built only via [`CalibrationCurveBuilder`]
//! - [`CurveFitter`]: isotonic and histogram fitters used by the adaptation loop
//! - [`CalibrationMetrics`]: ECE, MCE and Brier score of a fitted curve

mod fit;
mod metrics;
mod model;

pub use fit::{
    CalibrationError, CalibrationResult, CurveFitter, FitterKind, HistogramFitter, IsotonicFitter,
};
pub use metrics::{
    compute_brier_score, compute_ece, compute_mce, CalibrationMetrics, CalibrationQuality,
    ConfidenceBucket, DEFAULT_NUM_BUCKETS,
};
pub use model::{
    CalibrationCurve, CalibrationCurveBuilder, CalibrationDataPoint, CalibrationSet,
    CalibrationType, CurveKey, GLOBAL_CATEGORY,
};
