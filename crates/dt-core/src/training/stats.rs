//! Aggregate performance statistics over an archive snapshot.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::LabeledSample;
use crate::decision::{Method, Verdict};

/// Accuracy of one method on strong-labeled samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodAccuracy {
    pub evaluated: usize,
    pub correct: usize,
}

impl MethodAccuracy {
    /// Fraction correct, or `None` before any strong label.
    pub fn accuracy(&self) -> Option<f64> {
        (self.evaluated > 0).then(|| self.correct as f64 / self.evaluated as f64)
    }
}

/// Pass/fail counts for one material.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MaterialStats {
    pub pass: usize,
    pub fail: usize,
}

/// Engine performance summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub total: usize,
    pub strong_labeled: usize,
    pub uncertain: usize,
    /// Decisions per fusion path.
    pub fusion_paths: BTreeMap<String, usize>,
    /// Mean fused confidence per fusion path.
    pub average_confidence: BTreeMap<String, f64>,
    /// Fraction of decisions where the model contributed.
    pub hybrid_rate: f64,
    pub rule_accuracy: MethodAccuracy,
    pub model_accuracy: MethodAccuracy,
    /// Accuracy of the fused verdict on strong labels.
    pub fused_accuracy: MethodAccuracy,
    /// Fraction of strong labels that contradict the engine's verdict.
    pub override_rate: f64,
    /// Counts by material, using each sample's current label.
    pub materials: BTreeMap<String, MaterialStats>,
}

impl PerformanceStats {
    pub fn from_samples(samples: &[LabeledSample]) -> Self {
        let mut stats = PerformanceStats {
            total: samples.len(),
            ..Default::default()
        };
        let mut confidence_sums: BTreeMap<String, f64> = BTreeMap::new();
        let mut hybrid = 0usize;
        let mut overridden = 0usize;

        for sample in samples {
            let path = sample.decision.fusion_path.as_str().to_string();
            *stats.fusion_paths.entry(path.clone()).or_default() += 1;
            *confidence_sums.entry(path).or_default() += sample.decision.confidence;
            if sample.decision.fusion_path.is_hybrid() {
                hybrid += 1;
            }
            if sample.decision.uncertain {
                stats.uncertain += 1;
            }

            let material = stats.materials.entry(sample.features.material.clone()).or_default();
            match sample.label {
                Verdict::Pass => material.pass += 1,
                Verdict::Fail => material.fail += 1,
            }

            if !sample.is_strong() {
                continue;
            }
            stats.strong_labeled += 1;
            if sample.was_overridden() {
                overridden += 1;
            }
            tally(&mut stats.fused_accuracy, sample.decision.verdict, sample.label);
            if let Some(rule) = sample.decision.output(Method::Rule) {
                tally(&mut stats.rule_accuracy, rule.verdict, sample.label);
            }
            if let Some(model) = sample.decision.output(Method::Model) {
                tally(&mut stats.model_accuracy, model.verdict, sample.label);
            }
        }

        for (path, sum) in confidence_sums {
            let count = stats.fusion_paths.get(&path).copied().unwrap_or(1).max(1);
            stats.average_confidence.insert(path, sum / count as f64);
        }
        if stats.total > 0 {
            stats.hybrid_rate = hybrid as f64 / stats.total as f64;
        }
        if stats.strong_labeled > 0 {
            stats.override_rate = overridden as f64 / stats.strong_labeled as f64;
        }
        stats
    }
}

fn tally(accuracy: &mut MethodAccuracy, predicted: Verdict, actual: Verdict) {
    accuracy.evaluated += 1;
    if predicted == actual {
        accuracy.correct += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::weak_sample;
    use super::super::Confirmation;
    use super::*;

    #[test]
    fn test_empty_archive() {
        let stats = PerformanceStats::from_samples(&[]);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.rule_accuracy.accuracy(), None);
        assert_eq!(stats.hybrid_rate, 0.0);
    }

    #[test]
    fn test_counts_and_override_rate() {
        let mut confirmed_wrong = weak_sample(0.09, Verdict::Pass);
        confirmed_wrong.apply_confirmation(&Confirmation::new(
            confirmed_wrong.id,
            Verdict::Fail,
            None,
        ));
        let mut confirmed_right = weak_sample(0.02, Verdict::Pass);
        confirmed_right.apply_confirmation(&Confirmation::new(
            confirmed_right.id,
            Verdict::Pass,
            None,
        ));
        let samples = vec![confirmed_wrong, confirmed_right, weak_sample(0.3, Verdict::Fail)];

        let stats = PerformanceStats::from_samples(&samples);

        assert_eq!(stats.total, 3);
        assert_eq!(stats.strong_labeled, 2);
        assert_eq!(stats.override_rate, 0.5);
        assert_eq!(stats.rule_accuracy.accuracy(), Some(0.5));
        assert_eq!(stats.model_accuracy.evaluated, 0);
        assert_eq!(stats.fusion_paths.get("rule_only"), Some(&3));
        assert!((stats.average_confidence["rule_only"] - 0.8).abs() < 1e-12);
        assert_eq!(stats.materials["plastic"], MaterialStats { pass: 1, fail: 2 });
    }
}
