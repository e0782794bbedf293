//! Threshold adaptation loop.
//!
//! Runs out of band: reads the archive, refits the deformation limits on
//! strong labels, refits calibration curves on all samples and publishes the
//! result as one new parameter snapshot. Nothing is published when data is
//! insufficient or the run is cancelled.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::calibration::{
    CalibrationDataPoint, CalibrationMetrics, CalibrationSet, CalibrationType, CurveKey,
};
use crate::config::{AdaptationSettings, CalibrationSettings, EngineConfig};
use crate::decision::{Method, Verdict};
use crate::params::{EngineParameters, ParameterStore};
use crate::rules::RuleThresholds;
use crate::training::{LabeledSample, PerformanceStats, PersistenceError, SampleStore};

#[derive(Debug, Error)]
pub enum AdaptationError {
    /// Too few strong labels to move thresholds safely.
    #[error("Insufficient strong-labeled data: {available} samples, {required} required")]
    InsufficientData { available: usize, required: usize },

    #[error("Adaptation cancelled")]
    Cancelled,

    #[error("Failed to read training archive: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Result of fitting one deformation limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitFit {
    pub previous: f64,
    pub limit: f64,
    pub cost_before: f64,
    pub cost_after: f64,
    pub samples: usize,
}

/// Summary of one refitted curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveReport {
    pub key: String,
    pub calibration_type: CalibrationType,
    pub sample_count: usize,
    pub metrics: Option<CalibrationMetrics>,
}

/// What one successful run changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationReport {
    pub samples_considered: usize,
    pub strong_samples: usize,
    pub global_limit: LimitFit,
    pub category_limits: BTreeMap<String, LimitFit>,
    pub curves: Vec<CurveReport>,
    /// (rule, model) weights when fusion weights were re-derived.
    pub fusion_weights: Option<(f64, f64)>,
    pub published_version: u64,
}

/// Recomputes thresholds and curves from the archive.
pub struct ThresholdAdapter {
    store: Arc<dyn SampleStore>,
    params: Arc<ParameterStore>,
    settings: AdaptationSettings,
    calibration: CalibrationSettings,
}

impl ThresholdAdapter {
    pub fn new(
        store: Arc<dyn SampleStore>,
        params: Arc<ParameterStore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            params,
            settings: config.adaptation.clone(),
            calibration: config.calibration.clone(),
        }
    }

    /// Runs once without a cancellation signal.
    pub async fn run_now(&self) -> Result<AdaptationReport, AdaptationError> {
        let (_cancel_tx, mut cancel_rx) = watch::channel(false);
        self.run_once(&mut cancel_rx).await
    }

    /// Runs one adaptation pass.
    ///
    /// `cancel` is checked between phases; once it reads `true` the run stops
    /// with [`AdaptationError::Cancelled`] and publishes nothing.
    #[instrument(skip(self, cancel))]
    pub async fn run_once(
        &self,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<AdaptationReport, AdaptationError> {
        let result = self.run_inner(cancel).await;
        match &result {
            Ok(report) => {
                metrics::counter!("droptest_adaptation_runs_total").increment(1);
                info!(
                    version = report.published_version,
                    strong_samples = report.strong_samples,
                    previous_limit = report.global_limit.previous,
                    new_limit = report.global_limit.limit,
                    curves = report.curves.len(),
                    "Adaptation published new parameters"
                );
            }
            Err(AdaptationError::InsufficientData {
                available,
                required,
            }) => {
                metrics::counter!("droptest_adaptation_insufficient_total").increment(1);
                info!(
                    available,
                    required, "Not enough strong labels, parameters unchanged"
                );
            }
            Err(AdaptationError::Cancelled) => info!("Adaptation cancelled, nothing published"),
            Err(e) => warn!(error = %e, "Adaptation failed, parameters unchanged"),
        }
        result
    }

    async fn run_inner(
        &self,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<AdaptationReport, AdaptationError> {
        check_cancel(cancel)?;
        let samples = self.load_samples(cancel).await?;
        let base = self.params.snapshot();

        let strong: Vec<&LabeledSample> = samples.iter().filter(|s| s.is_strong()).collect();
        if strong.len() < self.settings.min_strong_samples.max(1) {
            return Err(AdaptationError::InsufficientData {
                available: strong.len(),
                required: self.settings.min_strong_samples.max(1),
            });
        }
        debug!(
            samples = samples.len(),
            strong = strong.len(),
            "Fitting thresholds"
        );

        check_cancel(cancel)?;
        let (thresholds, global_limit, category_limits) =
            self.fit_thresholds(&base.thresholds, &strong);

        tokio::task::yield_now().await;
        check_cancel(cancel)?;
        let (calibration, curves) = self.fit_curves(&base.calibration, &samples);

        let fusion_weights = if self.settings.adapt_fusion_weights {
            accuracy_weights(&samples)
        } else {
            None
        };

        check_cancel(cancel)?;
        let published = self.params.publish_with(|current| {
            let mut next: EngineParameters = current.clone();
            next.thresholds.deformation_limit = thresholds.deformation_limit;
            next.thresholds.category_limits = thresholds.category_limits;
            next.calibration = calibration;
            if let Some((rule_weight, model_weight)) = fusion_weights {
                next.fusion.rule_weight = rule_weight;
                next.fusion.model_weight = model_weight;
            }
            next
        });

        Ok(AdaptationReport {
            samples_considered: samples.len(),
            strong_samples: strong.len(),
            global_limit,
            category_limits,
            curves,
            fusion_weights,
            published_version: published.version,
        })
    }

    async fn load_samples(
        &self,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Vec<LabeledSample>, AdaptationError> {
        let mut read = self.store.snapshot(self.settings.window);
        loop {
            tokio::select! {
                result = &mut read => return Ok(result?),
                changed = cancel.changed() => {
                    if changed.is_err() {
                        // Sender gone: nobody can cancel any more.
                        return Ok(read.await?);
                    }
                    check_cancel(cancel)?;
                }
            }
        }
    }

    fn fit_thresholds(
        &self,
        current: &RuleThresholds,
        strong: &[&LabeledSample],
    ) -> (RuleThresholds, LimitFit, BTreeMap<String, LimitFit>) {
        // Hard-rule samples fail regardless of the limit and carry no signal for it.
        let usable: Vec<&LabeledSample> = strong
            .iter()
            .copied()
            .filter(|s| current.hard_rule(&s.features).is_none())
            .collect();

        let all: Vec<(f64, Verdict)> = usable
            .iter()
            .map(|s| (s.features.deformation_ratio, s.label))
            .collect();
        let global = optimize_limit(&all, current.deformation_limit, &self.settings);

        let mut by_material: BTreeMap<&str, Vec<(f64, Verdict)>> = BTreeMap::new();
        for s in &usable {
            by_material
                .entry(s.features.material.as_str())
                .or_default()
                .push((s.features.deformation_ratio, s.label));
        }

        let mut thresholds = current.clone();
        thresholds.deformation_limit = global.limit;
        let mut category_fits = BTreeMap::new();
        for (material, points) in by_material {
            if points.len() < self.settings.min_category_samples.max(1) {
                continue;
            }
            let fit = optimize_limit(&points, current.limit_for(material), &self.settings);
            thresholds
                .category_limits
                .insert(material.to_string(), fit.limit);
            category_fits.insert(material.to_string(), fit);
        }
        (thresholds, global, category_fits)
    }

    fn fit_curves(
        &self,
        current: &CalibrationSet,
        samples: &[LabeledSample],
    ) -> (CalibrationSet, Vec<CurveReport>) {
        let mut groups: BTreeMap<CurveKey, Vec<CalibrationDataPoint>> = BTreeMap::new();
        for sample in samples {
            for output in &sample.decision.outputs {
                let point =
                    CalibrationDataPoint::new(output.raw_confidence, output.verdict == sample.label);
                groups
                    .entry(CurveKey::global(output.method))
                    .or_default()
                    .push(point);
                groups
                    .entry(CurveKey::new(output.method, sample.features.material.as_str()))
                    .or_default()
                    .push(point);
            }
        }

        let fitter = self
            .calibration
            .fitter
            .fitter(self.calibration.num_bins, self.calibration.min_samples);
        let mut set = current.clone();
        let mut reports = Vec::new();
        for (key, points) in groups {
            match fitter.fit(key.clone(), &points) {
                Ok(curve) => {
                    reports.push(CurveReport {
                        key: key.to_storage_key(),
                        calibration_type: curve.calibration_type(),
                        sample_count: curve.sample_count(),
                        metrics: curve.metrics().cloned(),
                    });
                    set.insert(curve);
                }
                Err(e) => debug!(key = %key, error = %e, "Curve not refitted"),
            }
        }
        (set, reports)
    }
}

fn check_cancel(cancel: &watch::Receiver<bool>) -> Result<(), AdaptationError> {
    if *cancel.borrow() {
        Err(AdaptationError::Cancelled)
    } else {
        Ok(())
    }
}

/// Weighted misclassification cost of `limit` over (deformation, label) pairs.
pub fn misclassification_cost(
    samples: &[(f64, Verdict)],
    limit: f64,
    settings: &AdaptationSettings,
) -> f64 {
    samples
        .iter()
        .map(|(deformation, label)| {
            let predicted = if *deformation > limit {
                Verdict::Fail
            } else {
                Verdict::Pass
            };
            match (predicted, label) {
                (Verdict::Pass, Verdict::Fail) => settings.false_pass_cost,
                (Verdict::Fail, Verdict::Pass) => settings.false_fail_cost,
                _ => 0.0,
            }
        })
        .sum()
}

/// Finds the limit with the lowest cost.
///
/// Candidates are the midpoints between consecutive distinct deformation
/// values plus the current limit. Ties keep the candidate nearest the current
/// limit, so the current limit survives whenever nothing beats it.
pub fn optimize_limit(
    samples: &[(f64, Verdict)],
    current: f64,
    settings: &AdaptationSettings,
) -> LimitFit {
    let mut values: Vec<f64> = samples
        .iter()
        .map(|(d, _)| *d)
        .filter(|d| d.is_finite())
        .collect();
    values.sort_by(f64::total_cmp);
    values.dedup();

    let mut candidates: Vec<f64> = values.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect();
    candidates.push(current);
    candidates.retain(|c| *c > 0.0 && c.is_finite());

    let cost_before = misclassification_cost(samples, current, settings);
    let mut best = (current, cost_before);
    for candidate in candidates {
        let cost = misclassification_cost(samples, candidate, settings);
        let closer = (candidate - current).abs() < (best.0 - current).abs();
        if cost < best.1 || (cost == best.1 && closer) {
            best = (candidate, cost);
        }
    }

    LimitFit {
        previous: current,
        limit: best.0,
        cost_before,
        cost_after: best.1,
        samples: samples.len(),
    }
}

/// Fusion weights proportional to each method's accuracy on strong labels.
fn accuracy_weights(samples: &[LabeledSample]) -> Option<(f64, f64)> {
    let stats = PerformanceStats::from_samples(samples);
    let rule = stats.rule_accuracy.accuracy()?;
    let model = stats.model_accuracy.accuracy()?;
    let total = rule + model;
    (total > 0.0).then(|| (rule / total, model / total))
}

/// Runs adaptation every `interval` until `shutdown` turns true.
///
/// The first run happens one interval after start. Failed runs are logged
/// and the schedule continues.
pub fn spawn_adaptation_task(
    adapter: Arc<ThresholdAdapter>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        info!(interval_secs = interval.as_secs(), "Starting adaptation loop");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match adapter.run_once(&mut shutdown).await {
                        Ok(_) | Err(AdaptationError::InsufficientData { .. }) => {}
                        Err(AdaptationError::Cancelled) => break,
                        Err(e) => error!(error = %e, "Scheduled adaptation failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Adaptation loop shutting down");
                        break;
                    }
                }
            }
        }
    })
}
