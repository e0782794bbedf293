//! Calibration quality metrics.
//!
//! Expected and maximum calibration error over equal-width confidence buckets,
//! plus the Brier score before and after calibration.

use serde::{Deserialize, Serialize};

/// Number of equal-width buckets used for ECE/MCE.
pub const DEFAULT_NUM_BUCKETS: usize = 10;

/// One equal-width confidence bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBucket {
    /// Lower bound (inclusive).
    pub lower: f64,
    /// Upper bound (exclusive, except for the last bucket).
    pub upper: f64,
    pub mean_confidence: f64,
    /// Fraction of correct verdicts in this bucket.
    pub accuracy: f64,
    pub count: usize,
}

impl ConfidenceBucket {
    fn empty(lower: f64, upper: f64) -> Self {
        Self {
            lower,
            upper,
            mean_confidence: 0.0,
            accuracy: 0.0,
            count: 0,
        }
    }

    /// Returns |mean confidence - accuracy|, or 0 for an empty bucket.
    pub fn calibration_error(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.mean_confidence - self.accuracy).abs()
        }
    }
}

/// Quality summary of one fitted curve, measured on its training window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationMetrics {
    pub expected_calibration_error: f64,
    pub max_calibration_error: f64,
    pub brier_score: f64,
    /// Brier score of the raw confidences.
    pub brier_score_before: f64,
    /// ECE of the raw confidences minus ECE after calibration.
    pub ece_improvement: f64,
    pub accuracy: f64,
    pub sample_count: usize,
    /// Non-empty buckets only.
    pub buckets: Vec<ConfidenceBucket>,
}

impl CalibrationMetrics {
    /// Computes metrics for paired calibrated/raw confidences and outcomes.
    ///
    /// Slices of unequal length are truncated to the shortest.
    pub fn compute(calibrated: &[f64], raw: &[f64], outcomes: &[bool]) -> Self {
        let n = calibrated.len().min(raw.len()).min(outcomes.len());
        if n == 0 {
            return Self::empty();
        }
        let (calibrated, raw, outcomes) = (&calibrated[..n], &raw[..n], &outcomes[..n]);

        let buckets = bucketize(calibrated, outcomes, DEFAULT_NUM_BUCKETS);
        let ece = weighted_error(&buckets, n);
        let mce = buckets
            .iter()
            .map(ConfidenceBucket::calibration_error)
            .fold(0.0, f64::max);
        let ece_before = weighted_error(&bucketize(raw, outcomes, DEFAULT_NUM_BUCKETS), n);

        Self {
            expected_calibration_error: ece,
            max_calibration_error: mce,
            brier_score: compute_brier_score(calibrated, outcomes),
            brier_score_before: compute_brier_score(raw, outcomes),
            ece_improvement: ece_before - ece,
            accuracy: outcomes.iter().filter(|o| **o).count() as f64 / n as f64,
            sample_count: n,
            buckets: buckets.into_iter().filter(|b| b.count > 0).collect(),
        }
    }

    pub fn empty() -> Self {
        Self {
            expected_calibration_error: 0.0,
            max_calibration_error: 0.0,
            brier_score: 0.0,
            brier_score_before: 0.0,
            ece_improvement: 0.0,
            accuracy: 0.0,
            sample_count: 0,
            buckets: Vec::new(),
        }
    }

    /// Returns a qualitative grade based on ECE.
    pub fn quality(&self) -> CalibrationQuality {
        match self.expected_calibration_error {
            e if e < 0.05 => CalibrationQuality::Excellent,
            e if e < 0.10 => CalibrationQuality::Good,
            e if e < 0.15 => CalibrationQuality::Fair,
            _ => CalibrationQuality::Poor,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "ECE: {:.4}, MCE: {:.4}, Brier: {:.4} (was {:.4}), Samples: {}",
            self.expected_calibration_error,
            self.max_calibration_error,
            self.brier_score,
            self.brier_score_before,
            self.sample_count
        )
    }
}

/// Qualitative assessment of calibration quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl std::fmt::Display for CalibrationQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalibrationQuality::Excellent => write!(f, "Excellent"),
            CalibrationQuality::Good => write!(f, "Good"),
            CalibrationQuality::Fair => write!(f, "Fair"),
            CalibrationQuality::Poor => write!(f, "Poor"),
        }
    }
}

/// Mean squared error between confidences and 0/1 outcomes.
pub fn compute_brier_score(confidences: &[f64], outcomes: &[bool]) -> f64 {
    let n = confidences.len().min(outcomes.len());
    if n == 0 {
        return 0.0;
    }
    confidences
        .iter()
        .zip(outcomes)
        .map(|(c, o)| (c - if *o { 1.0 } else { 0.0 }).powi(2))
        .sum::<f64>()
        / n as f64
}

/// Expected calibration error over `num_buckets` equal-width buckets.
pub fn compute_ece(confidences: &[f64], outcomes: &[bool], num_buckets: usize) -> f64 {
    let n = confidences.len().min(outcomes.len());
    if n == 0 {
        return 0.0;
    }
    weighted_error(&bucketize(confidences, outcomes, num_buckets), n)
}

/// Largest per-bucket calibration error.
pub fn compute_mce(confidences: &[f64], outcomes: &[bool], num_buckets: usize) -> f64 {
    bucketize(confidences, outcomes, num_buckets)
        .iter()
        .map(ConfidenceBucket::calibration_error)
        .fold(0.0, f64::max)
}

fn weighted_error(buckets: &[ConfidenceBucket], n: usize) -> f64 {
    buckets
        .iter()
        .map(|b| b.count as f64 / n as f64 * b.calibration_error())
        .sum()
}

fn bucketize(confidences: &[f64], outcomes: &[bool], num_buckets: usize) -> Vec<ConfidenceBucket> {
    if num_buckets == 0 {
        return Vec::new();
    }
    let width = 1.0 / num_buckets as f64;
    let mut buckets: Vec<ConfidenceBucket> = (0..num_buckets)
        .map(|i| ConfidenceBucket::empty(i as f64 * width, (i + 1) as f64 * width))
        .collect();
    let mut correct = vec![0usize; num_buckets];

    for (&conf, &outcome) in confidences.iter().zip(outcomes) {
        let conf = conf.clamp(0.0, 1.0);
        let idx = ((conf / width).floor() as usize).min(num_buckets - 1);
        buckets[idx].mean_confidence += conf;
        buckets[idx].count += 1;
        if outcome {
            correct[idx] += 1;
        }
    }

    for (bucket, correct) in buckets.iter_mut().zip(correct) {
        if bucket.count > 0 {
            bucket.mean_confidence /= bucket.count as f64;
            bucket.accuracy = correct as f64 / bucket.count as f64;
        }
    }
    buckets
}
