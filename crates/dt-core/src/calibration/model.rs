//! Calibration curves and the curve set read by live analyses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::metrics::CalibrationMetrics;
use crate::decision::Method;

/// Category of the method-wide fallback curve.
pub const GLOBAL_CATEGORY: &str = "_global";

/// One historical observation: a raw confidence and whether the verdict it
/// backed turned out to be correct.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationDataPoint {
    pub raw_confidence: f64,
    pub was_correct: bool,
}

impl CalibrationDataPoint {
    pub fn new(raw_confidence: f64, was_correct: bool) -> Self {
        Self {
            raw_confidence,
            was_correct,
        }
    }
}

/// Identifies the curve for one (method, material category) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CurveKey {
    pub method: Method,
    pub category: String,
}

impl CurveKey {
    pub fn new(method: Method, category: impl Into<String>) -> Self {
        Self {
            method,
            category: category.into(),
        }
    }

    /// The method-wide key used when no category-specific curve exists.
    pub fn global(method: Method) -> Self {
        Self::new(method, GLOBAL_CATEGORY)
    }

    pub fn is_global(&self) -> bool {
        self.category == GLOBAL_CATEGORY
    }

    /// Returns the flat `method:category` string used as a map key.
    pub fn to_storage_key(&self) -> String {
        format!("{}:{}", self.method.as_key(), self.category)
    }
}

impl std::fmt::Display for CurveKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_storage_key())
    }
}

/// How a curve was fitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationType {
    Isotonic,
    HistogramBinning,
    Identity,
}

impl std::fmt::Display for CalibrationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalibrationType::Isotonic => write!(f, "isotonic"),
            CalibrationType::HistogramBinning => write!(f, "histogram"),
            CalibrationType::Identity => write!(f, "identity"),
        }
    }
}

/// Piecewise-linear, non-decreasing map from raw to calibrated confidence.
///
/// Only [`CalibrationCurveBuilder`] produces curves, and deserialisation goes
/// through it as well, so every curve in memory is monotone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "CurveRecord")]
pub struct CalibrationCurve {
    calibration_type: CalibrationType,
    key: CurveKey,
    inputs: Vec<f64>,
    outputs: Vec<f64>,
    sample_count: usize,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metrics: Option<CalibrationMetrics>,
}

#[derive(Deserialize)]
struct CurveRecord {
    calibration_type: CalibrationType,
    key: CurveKey,
    inputs: Vec<f64>,
    outputs: Vec<f64>,
    #[serde(default)]
    sample_count: usize,
    created_at: DateTime<Utc>,
    #[serde(default)]
    metrics: Option<CalibrationMetrics>,
}

impl From<CurveRecord> for CalibrationCurve {
    fn from(record: CurveRecord) -> Self {
        let mut curve = CalibrationCurveBuilder::new(record.calibration_type)
            .for_key(record.key)
            .add_points(record.inputs.into_iter().zip(record.outputs))
            .with_sample_count(record.sample_count)
            .build();
        curve.created_at = record.created_at;
        curve.metrics = record.metrics;
        curve
    }
}

impl CalibrationCurve {
    /// Pass-through curve.
    pub fn identity(key: CurveKey) -> Self {
        CalibrationCurveBuilder::new(CalibrationType::Identity)
            .for_key(key)
            .build()
    }

    /// Maps a raw confidence through the curve.
    ///
    /// Input is clamped to [0, 1]; values between knots are linearly
    /// interpolated, values outside the knot range take the nearest end.
    pub fn calibrate(&self, raw_confidence: f64) -> f64 {
        let (Some(&first_x), Some(&last_x)) = (self.inputs.first(), self.inputs.last()) else {
            return raw_confidence.clamp(0.0, 1.0);
        };
        let x = if raw_confidence.is_nan() {
            0.0
        } else {
            raw_confidence.clamp(0.0, 1.0)
        };

        if x <= first_x {
            return self.outputs[0];
        }
        if x >= last_x {
            return self.outputs[self.outputs.len() - 1];
        }

        // First knot strictly above x; exists because x < last_x.
        let upper = self.inputs.partition_point(|knot| *knot <= x);
        let (x0, x1) = (self.inputs[upper - 1], self.inputs[upper]);
        let (y0, y1) = (self.outputs[upper - 1], self.outputs[upper]);
        let t = (x - x0) / (x1 - x0);
        (y0 + t * (y1 - y0)).clamp(y0, y1)
    }

    pub fn key(&self) -> &CurveKey {
        &self.key
    }

    pub fn calibration_type(&self) -> CalibrationType {
        self.calibration_type
    }

    pub fn is_identity(&self) -> bool {
        self.calibration_type == CalibrationType::Identity
    }

    /// Returns the curve's knots as (raw, calibrated) pairs.
    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.inputs.iter().copied().zip(self.outputs.iter().copied())
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn metrics(&self) -> Option<&CalibrationMetrics> {
        self.metrics.as_ref()
    }

    /// Attaches quality metrics measured on the fitting window.
    pub fn with_metrics(mut self, metrics: CalibrationMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Builds monotone curves from arbitrary (raw, calibrated) points.
pub struct CalibrationCurveBuilder {
    calibration_type: CalibrationType,
    key: CurveKey,
    points: Vec<(f64, f64)>,
    sample_count: usize,
}

impl CalibrationCurveBuilder {
    pub fn new(calibration_type: CalibrationType) -> Self {
        Self {
            calibration_type,
            key: CurveKey::global(Method::Rule),
            points: Vec::new(),
            sample_count: 0,
        }
    }

    pub fn for_key(mut self, key: CurveKey) -> Self {
        self.key = key;
        self
    }

    pub fn add_point(mut self, input: f64, output: f64) -> Self {
        self.points.push((input, output));
        self
    }

    pub fn add_points(mut self, points: impl IntoIterator<Item = (f64, f64)>) -> Self {
        self.points.extend(points);
        self
    }

    pub fn with_sample_count(mut self, count: usize) -> Self {
        self.sample_count = count;
        self
    }

    /// Builds the curve, enforcing the monotonicity invariant.
    ///
    /// Non-finite points are dropped, coordinates clamped to [0, 1], knots
    /// sorted and de-duplicated (last output wins), and outputs raised to the
    /// running maximum. With no usable points the result is the identity.
    pub fn build(self) -> CalibrationCurve {
        let mut points: Vec<(f64, f64)> = self
            .points
            .into_iter()
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .map(|(x, y)| (x.clamp(0.0, 1.0), y.clamp(0.0, 1.0)))
            .collect();

        let calibration_type = if points.is_empty() {
            points = vec![(0.0, 0.0), (1.0, 1.0)];
            CalibrationType::Identity
        } else {
            self.calibration_type
        };

        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut inputs: Vec<f64> = Vec::with_capacity(points.len());
        let mut outputs: Vec<f64> = Vec::with_capacity(points.len());
        for (x, y) in points {
            if inputs.last().is_some_and(|last| (x - last).abs() < 1e-12) {
                if let Some(out) = outputs.last_mut() {
                    *out = y;
                }
            } else {
                inputs.push(x);
                outputs.push(y);
            }
        }

        let mut running = 0.0_f64;
        for y in outputs.iter_mut() {
            running = running.max(*y);
            *y = running;
        }

        CalibrationCurve {
            calibration_type,
            key: self.key,
            inputs,
            outputs,
            sample_count: self.sample_count,
            created_at: Utc::now(),
            metrics: None,
        }
    }
}

/// Immutable collection of curves, one per [`CurveKey`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSet {
    #[serde(default)]
    curves: BTreeMap<String, CalibrationCurve>,
}

impl CalibrationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the curve for the curve's own key.
    pub fn insert(&mut self, curve: CalibrationCurve) {
        self.curves.insert(curve.key().to_storage_key(), curve);
    }

    pub fn with_curve(mut self, curve: CalibrationCurve) -> Self {
        self.insert(curve);
        self
    }

    /// Finds the curve for (method, category), falling back to the
    /// method-wide curve.
    pub fn curve(&self, method: Method, category: &str) -> Option<&CalibrationCurve> {
        self.curves
            .get(&CurveKey::new(method, category).to_storage_key())
            .or_else(|| self.curves.get(&CurveKey::global(method).to_storage_key()))
    }

    /// Calibrates a raw confidence; identity when no curve applies.
    pub fn calibrate(&self, method: Method, category: &str, raw_confidence: f64) -> f64 {
        match self.curve(method, category) {
            Some(curve) => curve.calibrate(raw_confidence),
            None => raw_confidence.clamp(0.0, 1.0),
        }
    }

    pub fn len(&self) -> usize {
        self.curves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CalibrationCurve> {
        self.curves.values()
    }
}
