//! Feature extraction for drop tests.
//!
//! The video-analysis collaborators hand over a [`Measurement`] per test. The
//! extractor validates it and produces an immutable [`FeatureRecord`], the only
//! input the classifiers ever see. Missing auxiliary signals fall back to neutral
//! values; missing or out-of-range required fields reject the test.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound accepted for the deformation ratio.
///
/// Ratios above 1.0 are physically possible (aspect ratio more than doubled),
/// anything beyond this is a measurement fault.
pub const MAX_DEFORMATION_RATIO: f64 = 10.0;

/// Names of the numeric features, in the order of [`FeatureRecord::feature_vector`].
pub const FEATURE_NAMES: [&str; 6] = [
    "deformation_ratio",
    "shatter",
    "spill",
    "trajectory_deviation",
    "spill_area",
    "contour_ratio",
];

/// Errors raised when a measurement cannot become a feature record.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvalidInputError {
    /// A required field was absent or empty.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A numeric field was outside its declared range.
    #[error("Field '{field}' out of range: {value} (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: &'static str,
    },

    /// A numeric field was NaN or infinite.
    #[error("Field '{0}' is not a finite number")]
    NotFinite(&'static str),

    /// The timestamp could not be parsed.
    #[error("Invalid timestamp '{value}': {message}")]
    InvalidTimestamp { value: String, message: String },
}

/// Raw per-test measurements as delivered by the video-analysis collaborator.
///
/// Every field is optional at the serde level so that absence is reported as an
/// [`InvalidInputError::MissingField`] rather than a deserialization failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Measurement {
    /// Relative change of the bottle's aspect ratio (0.0 = unchanged).
    #[serde(default)]
    pub deformation_ratio: Option<f64>,
    /// Whether the bottle shattered.
    #[serde(default)]
    pub shatter: Option<bool>,
    /// Whether liquid spilled.
    #[serde(default)]
    pub spill: Option<bool>,
    /// Material or category tag (e.g. "plastic", "glass").
    #[serde(default)]
    pub material: Option<String>,
    /// Identity of the person running the test.
    #[serde(default)]
    pub tester: Option<String>,
    /// RFC 3339 timestamp of the test.
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Frame index at which the impact was detected.
    #[serde(default)]
    pub impact_frame: Option<u32>,
    /// Deviation of the fall trajectory from vertical, in pixels.
    #[serde(default)]
    pub trajectory_deviation: Option<f64>,
    /// Largest detected spill contour area, in square pixels.
    #[serde(default)]
    pub spill_area: Option<f64>,
    /// Ratio of contour counts after/before impact (fragmentation).
    #[serde(default)]
    pub contour_ratio: Option<f64>,
}

impl Measurement {
    /// Creates a measurement carrying only the required fields.
    pub fn new(
        deformation_ratio: f64,
        shatter: bool,
        spill: bool,
        material: impl Into<String>,
        tester: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            deformation_ratio: Some(deformation_ratio),
            shatter: Some(shatter),
            spill: Some(spill),
            material: Some(material.into()),
            tester: Some(tester.into()),
            timestamp: Some(timestamp.to_rfc3339()),
            ..Default::default()
        }
    }

    /// Sets the impact frame index.
    pub fn with_impact_frame(mut self, frame: u32) -> Self {
        self.impact_frame = Some(frame);
        self
    }

    /// Sets the trajectory deviation.
    pub fn with_trajectory_deviation(mut self, deviation: f64) -> Self {
        self.trajectory_deviation = Some(deviation);
        self
    }

    /// Sets the spill area.
    pub fn with_spill_area(mut self, area: f64) -> Self {
        self.spill_area = Some(area);
        self
    }

    /// Sets the contour ratio.
    pub fn with_contour_ratio(mut self, ratio: f64) -> Self {
        self.contour_ratio = Some(ratio);
        self
    }
}

/// Immutable snapshot of one test's measurable signals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureRecord {
    pub deformation_ratio: f64,
    pub shatter: bool,
    pub spill: bool,
    pub impact_frame: Option<u32>,
    pub trajectory_deviation: f64,
    pub spill_area: f64,
    pub contour_ratio: f64,
    /// Normalised material tag, used as the calibration category.
    pub material: String,
    pub tester: String,
    pub timestamp: DateTime<Utc>,
}

impl FeatureRecord {
    /// Returns the numeric feature vector in [`FEATURE_NAMES`] order.
    pub fn feature_vector(&self) -> [f64; FEATURE_NAMES.len()] {
        [
            self.deformation_ratio,
            if self.shatter { 1.0 } else { 0.0 },
            if self.spill { 1.0 } else { 0.0 },
            self.trajectory_deviation,
            self.spill_area,
            self.contour_ratio,
        ]
    }
}

/// Converts a measurement into a feature record.
///
/// Pure function: no clock reads, no I/O.
pub fn extract(measurement: &Measurement) -> Result<FeatureRecord, InvalidInputError> {
    let deformation_ratio = measurement
        .deformation_ratio
        .ok_or(InvalidInputError::MissingField("deformation_ratio"))?;
    check_range(
        "deformation_ratio",
        deformation_ratio,
        0.0,
        MAX_DEFORMATION_RATIO,
        "0.0 to 10.0",
    )?;

    let shatter = measurement
        .shatter
        .ok_or(InvalidInputError::MissingField("shatter"))?;
    let spill = measurement
        .spill
        .ok_or(InvalidInputError::MissingField("spill"))?;

    let material = required_text(measurement.material.as_deref(), "material")?;
    let tester = required_text(measurement.tester.as_deref(), "tester")?;
    let raw_timestamp = required_text(measurement.timestamp.as_deref(), "timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(&raw_timestamp)
        .map_err(|e| InvalidInputError::InvalidTimestamp {
            value: raw_timestamp.clone(),
            message: e.to_string(),
        })?
        .with_timezone(&Utc);

    let trajectory_deviation = measurement.trajectory_deviation.unwrap_or(0.0);
    check_range(
        "trajectory_deviation",
        trajectory_deviation,
        0.0,
        f64::MAX,
        "a non-negative number",
    )?;

    let spill_area = measurement.spill_area.unwrap_or(0.0);
    check_range("spill_area", spill_area, 0.0, f64::MAX, "a non-negative number")?;

    let contour_ratio = measurement.contour_ratio.unwrap_or(1.0);
    check_range(
        "contour_ratio",
        contour_ratio,
        0.0,
        f64::MAX,
        "a non-negative number",
    )?;

    Ok(FeatureRecord {
        deformation_ratio,
        shatter,
        spill,
        impact_frame: measurement.impact_frame,
        trajectory_deviation,
        spill_area,
        contour_ratio,
        material: normalize_material(&material),
        tester,
        timestamp,
    })
}

/// Normalises a material tag so calibration keys are stable across spellings.
pub fn normalize_material(material: &str) -> String {
    material.trim().to_lowercase()
}

fn required_text(value: Option<&str>, field: &'static str) -> Result<String, InvalidInputError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(InvalidInputError::MissingField(field)),
    }
}

fn check_range(
    field: &'static str,
    value: f64,
    min: f64,
    max: f64,
    expected: &'static str,
) -> Result<(), InvalidInputError> {
    if !value.is_finite() {
        return Err(InvalidInputError::NotFinite(field));
    }
    if value < min || value > max {
        return Err(InvalidInputError::OutOfRange {
            field,
            value,
            expected,
        });
    }
    Ok(())
}
