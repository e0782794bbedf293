//! Curve fitters.
//!
//! Fitting only ever happens inside the adaptation loop; live analyses read
//! the resulting curves and never fit.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::metrics::CalibrationMetrics;
use super::model::{
    CalibrationCurve, CalibrationCurveBuilder, CalibrationDataPoint, CalibrationType, CurveKey,
};

pub type CalibrationResult<T> = Result<T, CalibrationError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CalibrationError {
    /// Not enough observations for a trustworthy curve.
    #[error("Insufficient data: {0} points provided, minimum {1} required")]
    InsufficientData(usize, usize),

    /// A raw confidence outside [0, 1] or non-finite.
    #[error("Invalid confidence value: {0} (must be between 0.0 and 1.0)")]
    InvalidConfidence(f64),
}

/// Fitting algorithm selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitterKind {
    #[default]
    Isotonic,
    Histogram,
}

impl FitterKind {
    /// Instantiates the fitter.
    pub fn fitter(self, num_bins: usize, min_samples: usize) -> Box<dyn CurveFitter> {
        match self {
            FitterKind::Isotonic => Box::new(IsotonicFitter::new().with_min_samples(min_samples)),
            FitterKind::Histogram => {
                Box::new(HistogramFitter::new(num_bins).with_min_samples(min_samples))
            }
        }
    }
}

/// Fits a monotone calibration curve to historical observations.
pub trait CurveFitter: Send + Sync {
    /// Fits a curve for `key`. The returned curve carries in-sample metrics.
    fn fit(&self, key: CurveKey, data: &[CalibrationDataPoint])
        -> CalibrationResult<CalibrationCurve>;

    fn calibration_type(&self) -> CalibrationType;
}

/// Isotonic regression via pool-adjacent-violators.
#[derive(Debug, Clone)]
pub struct IsotonicFitter {
    min_samples: usize,
}

impl Default for IsotonicFitter {
    fn default() -> Self {
        Self::new()
    }
}

impl IsotonicFitter {
    pub fn new() -> Self {
        Self { min_samples: 30 }
    }

    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples.max(1);
        self
    }
}

impl CurveFitter for IsotonicFitter {
    fn fit(
        &self,
        key: CurveKey,
        data: &[CalibrationDataPoint],
    ) -> CalibrationResult<CalibrationCurve> {
        check_data(data, self.min_samples)?;

        let observations: Vec<(f64, f64, f64)> = data
            .iter()
            .map(|dp| (dp.raw_confidence, outcome(dp), 1.0))
            .collect();

        let curve = CalibrationCurveBuilder::new(CalibrationType::Isotonic)
            .for_key(key)
            .add_points(pool_adjacent_violators(observations))
            .with_sample_count(data.len())
            .build();
        Ok(attach_metrics(curve, data))
    }

    fn calibration_type(&self) -> CalibrationType {
        CalibrationType::Isotonic
    }
}

/// Equal-width histogram binning; bin accuracies are made monotone by PAV
/// over the bins, weighted by bin population.
#[derive(Debug, Clone)]
pub struct HistogramFitter {
    num_bins: usize,
    min_samples: usize,
}

impl Default for HistogramFitter {
    fn default() -> Self {
        Self::new(10)
    }
}

impl HistogramFitter {
    pub fn new(num_bins: usize) -> Self {
        Self {
            num_bins: num_bins.max(2),
            min_samples: 20,
        }
    }

    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples.max(1);
        self
    }
}

impl CurveFitter for HistogramFitter {
    fn fit(
        &self,
        key: CurveKey,
        data: &[CalibrationDataPoint],
    ) -> CalibrationResult<CalibrationCurve> {
        check_data(data, self.min_samples)?;

        let width = 1.0 / self.num_bins as f64;
        let mut conf_sums = vec![0.0; self.num_bins];
        let mut correct_sums = vec![0.0; self.num_bins];
        let mut counts = vec![0usize; self.num_bins];

        for dp in data {
            let idx = ((dp.raw_confidence / width).floor() as usize).min(self.num_bins - 1);
            conf_sums[idx] += dp.raw_confidence;
            correct_sums[idx] += outcome(dp);
            counts[idx] += 1;
        }

        let bins: Vec<(f64, f64, f64)> = (0..self.num_bins)
            .filter(|i| counts[*i] > 0)
            .map(|i| {
                let n = counts[i] as f64;
                (conf_sums[i] / n, correct_sums[i] / n, n)
            })
            .collect();

        let curve = CalibrationCurveBuilder::new(CalibrationType::HistogramBinning)
            .for_key(key)
            .add_points(pool_adjacent_violators(bins))
            .with_sample_count(data.len())
            .build();
        Ok(attach_metrics(curve, data))
    }

    fn calibration_type(&self) -> CalibrationType {
        CalibrationType::HistogramBinning
    }
}

fn outcome(dp: &CalibrationDataPoint) -> f64 {
    if dp.was_correct {
        1.0
    } else {
        0.0
    }
}

fn check_data(data: &[CalibrationDataPoint], min_samples: usize) -> CalibrationResult<()> {
    if data.len() < min_samples {
        return Err(CalibrationError::InsufficientData(data.len(), min_samples));
    }
    if let Some(bad) = data
        .iter()
        .find(|dp| !(0.0..=1.0).contains(&dp.raw_confidence))
    {
        return Err(CalibrationError::InvalidConfidence(bad.raw_confidence));
    }
    Ok(())
}

fn attach_metrics(curve: CalibrationCurve, data: &[CalibrationDataPoint]) -> CalibrationCurve {
    let raw: Vec<f64> = data.iter().map(|dp| dp.raw_confidence).collect();
    let calibrated: Vec<f64> = raw.iter().map(|r| curve.calibrate(*r)).collect();
    let outcomes: Vec<bool> = data.iter().map(|dp| dp.was_correct).collect();
    let metrics = CalibrationMetrics::compute(&calibrated, &raw, &outcomes);
    curve.with_metrics(metrics)
}

/// Weighted pool-adjacent-violators over (x, y, weight) observations.
///
/// Observations sharing an x are pooled first so the result is a function.
/// Returns knots at the first and last x of every block, plus flat extensions
/// to 0 and 1.
pub(crate) fn pool_adjacent_violators(mut data: Vec<(f64, f64, f64)>) -> Vec<(f64, f64)> {
    struct Block {
        sum: f64,
        weight: f64,
        start_x: f64,
        end_x: f64,
    }

    impl Block {
        fn mean(&self) -> f64 {
            self.sum / self.weight
        }
    }

    data.retain(|(x, y, w)| x.is_finite() && y.is_finite() && *w > 0.0);
    data.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut blocks: Vec<Block> = Vec::new();
    for (x, y, w) in data {
        match blocks.last_mut() {
            Some(last) if last.end_x == x => {
                last.sum += y * w;
                last.weight += w;
            }
            _ => blocks.push(Block {
                sum: y * w,
                weight: w,
                start_x: x,
                end_x: x,
            }),
        }

        while blocks.len() >= 2 {
            let n = blocks.len();
            if blocks[n - 2].mean() <= blocks[n - 1].mean() {
                break;
            }
            if let Some(last) = blocks.pop() {
                if let Some(prev) = blocks.last_mut() {
                    prev.sum += last.sum;
                    prev.weight += last.weight;
                    prev.end_x = last.end_x;
                }
            }
        }
    }

    let mut points: Vec<(f64, f64)> = Vec::with_capacity(blocks.len() * 2 + 2);
    for block in &blocks {
        let mean = block.mean();
        points.push((block.start_x, mean));
        if block.end_x > block.start_x {
            points.push((block.end_x, mean));
        }
    }

    if let Some(&(first_x, first_y)) = points.first() {
        if first_x > 0.0 {
            points.insert(0, (0.0, first_y));
        }
    }
    if let Some(&(last_x, last_y)) = points.last() {
        if last_x < 1.0 {
            points.push((1.0, last_y));
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Method;

    fn data(pairs: &[(f64, bool)], repeat: usize) -> Vec<CalibrationDataPoint> {
        (0..repeat)
            .flat_map(|_| pairs.iter().map(|(c, ok)| CalibrationDataPoint::new(*c, *ok)))
            .collect()
    }

    #[test]
    fn test_pav_merges_violators() {
        let points = pool_adjacent_violators(vec![
            (0.1, 0.0, 1.0),
            (0.2, 1.0, 1.0),
            (0.3, 0.0, 1.0),
            (0.4, 1.0, 1.0),
        ]);
        // 0.2 and 0.3 pool to 0.5.
        assert_eq!(
            points,
            vec![(0.0, 0.0), (0.1, 0.0), (0.2, 0.5), (0.3, 0.5), (0.4, 1.0), (1.0, 1.0)]
        );
    }

    #[test]
    fn test_pav_pools_equal_inputs() {
        let points = pool_adjacent_violators(vec![(0.6, 1.0, 1.0), (0.6, 0.0, 1.0)]);
        assert_eq!(points, vec![(0.0, 0.5), (0.6, 0.5), (1.0, 0.5)]);
    }

    #[test]
    fn test_isotonic_fitter_corrects_overconfidence() {
        // Rule claims 0.95 but is right 3 times in 5.
        let samples = data(
            &[(0.95, true), (0.95, true), (0.95, true), (0.95, false), (0.95, false)],
            10,
        );
        let curve = IsotonicFitter::new()
            .fit(CurveKey::global(Method::Rule), &samples)
            .unwrap();

        assert!((curve.calibrate(0.95) - 0.6).abs() < 1e-9);
        assert_eq!(curve.sample_count(), 50);
        let metrics = curve.metrics().unwrap();
        assert!(metrics.expected_calibration_error < 1e-9);
        assert!(metrics.ece_improvement > 0.3);
    }

    #[test]
    fn test_isotonic_fitter_requires_samples() {
        let samples = data(&[(0.7, true)], 5);
        let err = IsotonicFitter::new()
            .fit(CurveKey::global(Method::Model), &samples)
            .unwrap_err();
        assert_eq!(err, CalibrationError::InsufficientData(5, 30));
    }

    #[test]
    fn test_invalid_confidence_rejected() {
        let mut samples = data(&[(0.7, true)], 30);
        samples.push(CalibrationDataPoint::new(1.5, true));
        let err = IsotonicFitter::new()
            .fit(CurveKey::global(Method::Model), &samples)
            .unwrap_err();
        assert_eq!(err, CalibrationError::InvalidConfidence(1.5));
    }

    #[test]
    fn test_histogram_fitter_is_monotone() {
        let samples = data(
            &[
                (0.55, true),
                (0.55, false),
                (0.65, false),
                (0.65, false),
                (0.85, true),
                (0.85, true),
                (0.95, true),
                (0.95, false),
            ],
            5,
        );
        let curve = HistogramFitter::new(10)
            .fit(CurveKey::new(Method::Rule, "glass"), &samples)
            .unwrap();

        assert_eq!(curve.calibration_type(), CalibrationType::HistogramBinning);
        let mut previous = 0.0;
        for step in 0..=20 {
            let c = curve.calibrate(step as f64 / 20.0);
            assert!(c >= previous - 1e-12);
            previous = c;
        }
    }

    #[test]
    fn test_fitter_kind_from_config() {
        assert_eq!(
            FitterKind::Histogram.fitter(5, 1).calibration_type(),
            CalibrationType::HistogramBinning
        );
        assert_eq!(FitterKind::default(), FitterKind::Isotonic);
    }
}
