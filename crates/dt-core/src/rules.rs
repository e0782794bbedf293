//! Rule-based classifier.
//!
//! Deterministic evaluation of a [`FeatureRecord`] against [`RuleThresholds`]:
//! hard rules first (shatter, spill), then the deformation limit for the
//! record's material. Confidence grows with the distance from the limit and
//! saturates towards 1.0, so measurements near the boundary are low-confidence.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::decision::{Method, MethodOutput, Verdict};
use crate::features::{FeatureRecord, InvalidInputError};

/// Tag emitted when the shatter hard rule fires.
pub const TAG_SHATTER: &str = "shatter";
/// Tag emitted when the spill hard rule fires.
pub const TAG_SPILL: &str = "spill";
/// Tag emitted when deformation exceeds the limit.
pub const TAG_DEFORMATION_EXCEEDED: &str = "deformation_exceeded";
/// Tag emitted when deformation is within the limit.
pub const TAG_DEFORMATION_WITHIN: &str = "deformation_within";
/// Tag emitted when the measurement lies within the borderline margin.
pub const TAG_BORDERLINE: &str = "borderline";

/// Decision thresholds for the rule classifier.
///
/// Published as part of an immutable parameter snapshot; never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleThresholds {
    /// Deformation ratio above which a test fails.
    #[serde(default = "default_deformation_limit")]
    pub deformation_limit: f64,
    /// Per-material overrides of `deformation_limit`, keyed by normalised material.
    #[serde(default)]
    pub category_limits: BTreeMap<String, f64>,
    /// Shatter always fails the test.
    #[serde(default = "default_true")]
    pub shatter_is_fail: bool,
    /// Spill always fails the test.
    #[serde(default = "default_true")]
    pub spill_is_fail: bool,
    /// Distance from the limit at which confidence reaches ~82%.
    #[serde(default = "default_confidence_scale")]
    pub confidence_scale: f64,
    /// Confidence reported when a hard rule fires.
    #[serde(default = "default_hard_rule_confidence")]
    pub hard_rule_confidence: f64,
    /// Distance from the limit considered borderline.
    #[serde(default = "default_borderline_margin")]
    pub borderline_margin: f64,
}

fn default_deformation_limit() -> f64 {
    0.15
}

fn default_true() -> bool {
    true
}

fn default_confidence_scale() -> f64 {
    0.05
}

fn default_hard_rule_confidence() -> f64 {
    0.95
}

fn default_borderline_margin() -> f64 {
    0.05
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            deformation_limit: default_deformation_limit(),
            category_limits: BTreeMap::new(),
            shatter_is_fail: true,
            spill_is_fail: true,
            confidence_scale: default_confidence_scale(),
            hard_rule_confidence: default_hard_rule_confidence(),
            borderline_margin: default_borderline_margin(),
        }
    }
}

impl RuleThresholds {
    /// Sets the global deformation limit.
    pub fn with_deformation_limit(mut self, limit: f64) -> Self {
        self.deformation_limit = limit;
        self
    }

    /// Adds a per-material deformation limit.
    pub fn with_category_limit(mut self, material: &str, limit: f64) -> Self {
        self.category_limits.insert(material.to_string(), limit);
        self
    }

    /// Returns the deformation limit that applies to `material`.
    pub fn limit_for(&self, material: &str) -> f64 {
        self.category_limits
            .get(material)
            .copied()
            .unwrap_or(self.deformation_limit)
    }

    /// Returns the hard rule that fires for this record, if any.
    pub fn hard_rule(&self, features: &FeatureRecord) -> Option<&'static str> {
        if features.shatter && self.shatter_is_fail {
            Some(TAG_SHATTER)
        } else if features.spill && self.spill_is_fail {
            Some(TAG_SPILL)
        } else {
            None
        }
    }

    /// Returns the verdict these thresholds assign, ignoring confidence.
    pub fn verdict_for(&self, features: &FeatureRecord, limit: f64) -> Verdict {
        if self.hard_rule(features).is_some() || features.deformation_ratio > limit {
            Verdict::Fail
        } else {
            Verdict::Pass
        }
    }
}

/// Deterministic thresholded evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleClassifier;

impl RuleClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Evaluates a feature record.
    ///
    /// Fails only when the record itself is malformed (e.g. built by hand with a
    /// negative or non-finite deformation ratio).
    pub fn evaluate(
        &self,
        features: &FeatureRecord,
        thresholds: &RuleThresholds,
    ) -> Result<MethodOutput, InvalidInputError> {
        let deformation = features.deformation_ratio;
        if !deformation.is_finite() {
            return Err(InvalidInputError::NotFinite("deformation_ratio"));
        }
        if deformation < 0.0 {
            return Err(InvalidInputError::OutOfRange {
                field: "deformation_ratio",
                value: deformation,
                expected: "a non-negative number",
            });
        }

        if let Some(rule) = thresholds.hard_rule(features) {
            return Ok(MethodOutput::new(
                Method::Rule,
                Verdict::Fail,
                thresholds.hard_rule_confidence,
            )
            .with_tag(rule));
        }

        let limit = thresholds.limit_for(&features.material);
        let verdict = thresholds.verdict_for(features, limit);
        let distance = (deformation - limit).abs();
        let confidence = distance_confidence(distance, thresholds.confidence_scale);

        let mut output = MethodOutput::new(Method::Rule, verdict, confidence).with_tag(
            match verdict {
                Verdict::Fail => TAG_DEFORMATION_EXCEEDED,
                Verdict::Pass => TAG_DEFORMATION_WITHIN,
            },
        );
        if distance <= thresholds.borderline_margin {
            output = output.with_tag(TAG_BORDERLINE);
        }
        Ok(output)
    }
}

/// Maps distance from the limit to a confidence in [0.5, 1.0).
///
/// Monotonic non-decreasing in `distance`: 0.5 at the boundary, saturating
/// towards 1.0 far from it.
pub fn distance_confidence(distance: f64, scale: f64) -> f64 {
    if scale <= 0.0 {
        return if distance > 0.0 { 1.0 } else { 0.5 };
    }
    0.5 + 0.5 * (1.0 - (-distance / scale).exp())
}
