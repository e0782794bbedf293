//! Training data collection.
//!
//! Every decision is archived as a weakly labeled sample; human review later
//! upgrades it to a strong label. The archive is an append-only log of
//! [`ArchiveEntry`] events, folded into [`LabeledSample`]s on read, so no
//! existing record is ever rewritten in place.
//!
//! ## Key Components
//!
//! - [`SampleStore`]: archive abstraction with in-memory and JSONL implementations
//! - [`TrainingCollector`]: `record` and `confirm` on top of a store
//! - [`ArchiveQueue`]: bounded fire-and-forget hand-off from the analysis path
//! - [`PerformanceStats`]: aggregate view over an archive snapshot

mod collector;
mod jsonl;
mod stats;
mod store;

pub use collector::{spawn_archive_consumer, ArchiveJob, ArchiveQueue, TrainingCollector};
pub use jsonl::JsonlSampleStore;
pub use stats::{MaterialStats, MethodAccuracy, PerformanceStats};
pub use store::{InMemorySampleStore, PersistenceError, SampleStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::decision::{Decision, FusionPath, Method, MethodOutput, Verdict};
use crate::features::FeatureRecord;

/// Who assigned a sample's label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelProvenance {
    /// The engine's own verdict.
    Weak,
    /// Confirmed by a human reviewer; treated as ground truth.
    Strong,
}

/// The parts of a decision the adaptation loop needs later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSummary {
    pub verdict: Verdict,
    pub confidence: f64,
    pub uncertain: bool,
    pub fusion_path: FusionPath,
    /// Raw (uncalibrated) outputs, rule first.
    pub outputs: Vec<MethodOutput>,
    pub parameters_version: u64,
}

impl From<&Decision> for DecisionSummary {
    fn from(decision: &Decision) -> Self {
        Self {
            verdict: decision.verdict,
            confidence: decision.confidence,
            uncertain: decision.uncertain,
            fusion_path: decision.fusion_path,
            outputs: decision.outputs.iter().map(|o| o.output.clone()).collect(),
            parameters_version: decision.parameters_version,
        }
    }
}

impl DecisionSummary {
    pub fn output(&self, method: Method) -> Option<&MethodOutput> {
        self.outputs.iter().find(|o| o.method == method)
    }
}

/// A feature record plus its label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledSample {
    /// Same as the originating decision id.
    pub id: Uuid,
    pub features: FeatureRecord,
    pub label: Verdict,
    pub provenance: LabelProvenance,
    pub decision: DecisionSummary,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reviewer: Option<String>,
}

impl LabeledSample {
    /// Weak sample labeled with the decision's own verdict.
    pub fn weak(features: FeatureRecord, decision: &Decision) -> Self {
        Self {
            id: decision.id,
            features,
            label: decision.verdict,
            provenance: LabelProvenance::Weak,
            decision: DecisionSummary::from(decision),
            recorded_at: Utc::now(),
            confirmed_at: None,
            reviewer: None,
        }
    }

    pub fn is_strong(&self) -> bool {
        self.provenance == LabelProvenance::Strong
    }

    /// True when a reviewer overrode the engine's verdict.
    pub fn was_overridden(&self) -> bool {
        self.is_strong() && self.label != self.decision.verdict
    }

    fn apply_confirmation(&mut self, confirmation: &Confirmation) {
        self.label = confirmation.label;
        self.provenance = LabelProvenance::Strong;
        self.reviewer = confirmation.reviewer.clone();
        self.confirmed_at = Some(confirmation.confirmed_at);
    }
}

/// A human verdict for an archived sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub id: Uuid,
    pub label: Verdict,
    #[serde(default)]
    pub reviewer: Option<String>,
    pub confirmed_at: DateTime<Utc>,
}

impl Confirmation {
    pub fn new(id: Uuid, label: Verdict, reviewer: Option<String>) -> Self {
        Self {
            id,
            label,
            reviewer,
            confirmed_at: Utc::now(),
        }
    }
}

/// One event in the append-only archive log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ArchiveEntry {
    Recorded(LabeledSample),
    Confirmed(Confirmation),
}

/// Folds an event log into samples, ordered by first recording.
///
/// Repeated `Recorded` events for an id are ignored, so at-least-once
/// delivery never reverts a strong label. The latest confirmation wins.
/// Confirmations for ids not yet recorded are held and applied on arrival.
pub fn fold_entries<I>(entries: I) -> Vec<LabeledSample>
where
    I: IntoIterator<Item = ArchiveEntry>,
{
    let mut samples: Vec<LabeledSample> = Vec::new();
    let mut index: HashMap<Uuid, usize> = HashMap::new();
    let mut pending: HashMap<Uuid, Confirmation> = HashMap::new();

    for entry in entries {
        match entry {
            ArchiveEntry::Recorded(mut sample) => {
                if index.contains_key(&sample.id) {
                    continue;
                }
                if let Some(confirmation) = pending.remove(&sample.id) {
                    sample.apply_confirmation(&confirmation);
                }
                index.insert(sample.id, samples.len());
                samples.push(sample);
            }
            ArchiveEntry::Confirmed(confirmation) => match index.get(&confirmation.id) {
                Some(&i) => samples[i].apply_confirmation(&confirmation),
                None => {
                    pending.insert(confirmation.id, confirmation);
                }
            },
        }
    }
    samples
}

/// Keeps only the most recent `window` samples.
pub(crate) fn apply_window(
    mut samples: Vec<LabeledSample>,
    window: Option<usize>,
) -> Vec<LabeledSample> {
    if let Some(window) = window {
        if samples.len() > window {
            samples.drain(..samples.len() - window);
        }
    }
    samples
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::decision::{CalibratedOutput, ConfidenceLevel};
    use std::sync::Arc;

    pub fn features(deformation: f64, material: &str) -> FeatureRecord {
        FeatureRecord {
            deformation_ratio: deformation,
            shatter: false,
            spill: false,
            impact_frame: None,
            trajectory_deviation: 0.0,
            spill_area: 0.0,
            contour_ratio: 1.0,
            material: material.to_string(),
            tester: "qa".to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn decision(features: &FeatureRecord, verdict: Verdict, confidence: f64) -> Decision {
        Decision {
            id: Uuid::new_v4(),
            verdict,
            confidence,
            uncertain: false,
            confidence_level: ConfidenceLevel::from_confidence(confidence),
            fusion_path: FusionPath::RuleOnly,
            outputs: vec![CalibratedOutput {
                output: MethodOutput::new(Method::Rule, verdict, confidence),
                calibrated_confidence: confidence,
            }],
            tags: Vec::new(),
            review_reasons: Vec::new(),
            features: Arc::new(features.clone()),
            parameters_version: 1,
            decided_at: Utc::now(),
        }
    }

    pub fn weak_sample(deformation: f64, verdict: Verdict) -> LabeledSample {
        let f = features(deformation, "plastic");
        let d = decision(&f, verdict, 0.8);
        LabeledSample::weak(f, &d)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::weak_sample;
    use super::*;

    #[test]
    fn test_weak_sample_mirrors_decision() {
        let sample = weak_sample(0.05, Verdict::Pass);
        assert_eq!(sample.label, Verdict::Pass);
        assert_eq!(sample.provenance, LabelProvenance::Weak);
        assert!(!sample.was_overridden());
        assert!(sample.decision.output(Method::Rule).is_some());
    }

    #[test]
    fn test_fold_applies_confirmation() {
        let sample = weak_sample(0.05, Verdict::Pass);
        let id = sample.id;
        let samples = fold_entries(vec![
            ArchiveEntry::Recorded(sample),
            ArchiveEntry::Confirmed(Confirmation::new(id, Verdict::Fail, Some("ana".into()))),
        ]);

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].label, Verdict::Fail);
        assert!(samples[0].is_strong());
        assert!(samples[0].was_overridden());
        assert_eq!(samples[0].reviewer.as_deref(), Some("ana"));
    }

    #[test]
    fn test_duplicate_record_never_reverts_strong_label() {
        let sample = weak_sample(0.05, Verdict::Pass);
        let id = sample.id;
        let samples = fold_entries(vec![
            ArchiveEntry::Recorded(sample.clone()),
            ArchiveEntry::Confirmed(Confirmation::new(id, Verdict::Fail, None)),
            ArchiveEntry::Recorded(sample),
        ]);

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].label, Verdict::Fail);
        assert!(samples[0].is_strong());
    }

    #[test]
    fn test_confirmation_before_record_is_applied() {
        let sample = weak_sample(0.2, Verdict::Fail);
        let id = sample.id;
        let samples = fold_entries(vec![
            ArchiveEntry::Confirmed(Confirmation::new(id, Verdict::Pass, None)),
            ArchiveEntry::Recorded(sample),
        ]);
        assert_eq!(samples[0].label, Verdict::Pass);
        assert!(samples[0].is_strong());
    }

    #[test]
    fn test_window_keeps_most_recent() {
        let samples: Vec<_> = (0..5)
            .map(|i| weak_sample(i as f64 * 0.01, Verdict::Pass))
            .collect();
        let last_id = samples[4].id;
        let windowed = apply_window(samples, Some(2));
        assert_eq!(windowed.len(), 2);
        assert_eq!(windowed[1].id, last_id);
    }

    #[test]
    fn test_entry_serde_tagged() {
        let sample = weak_sample(0.05, Verdict::Pass);
        let json = serde_json::to_string(&ArchiveEntry::Recorded(sample.clone())).unwrap();
        assert!(json.contains(r#""event":"recorded""#));
        match serde_json::from_str::<ArchiveEntry>(&json).unwrap() {
            ArchiveEntry::Recorded(back) => {
                assert_eq!(back.id, sample.id);
                assert_eq!(back.features.material, "plastic");
                assert_eq!(back.decision.fusion_path, FusionPath::RuleOnly);
            }
            other => panic!("unexpected entry {:?}", other),
        }
    }
}
