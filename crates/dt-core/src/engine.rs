//! Analysis orchestrator.
//!
//! One call to [`AnalysisEngine::analyze`] runs feature extraction, the rule
//! classifier, the optional model, calibration and fusion against a single
//! parameter snapshot, then hands the decision to the archive queue without
//! waiting for it.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::decision::{
    CalibratedOutput, ConfidenceLevel, Decision, DecisionTag, FusionPath, Method, MethodOutput,
};
use crate::features::{extract, FeatureRecord, InvalidInputError, Measurement};
use crate::fusion::{fuse, FusionOutcome};
use crate::params::{EngineParameters, ParameterStore};
use crate::predictor::{ModelSlot, Prediction, UnavailableReason};
use crate::rules::{RuleClassifier, TAG_BORDERLINE};
use crate::training::ArchiveQueue;

/// Fatal errors for a single analysis. No decision is produced.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AnalysisError {
    #[error("Invalid measurement: {0}")]
    InvalidInput(#[from] InvalidInputError),
}

/// The hybrid analysis engine.
///
/// Cheap to share behind an `Arc`; every analysis reads its own snapshot of
/// the published parameters and the loaded model.
pub struct AnalysisEngine {
    params: Arc<ParameterStore>,
    model: Arc<ModelSlot>,
    rules: RuleClassifier,
    archive: Option<ArchiveQueue>,
}

impl AnalysisEngine {
    /// Creates a rule-only engine without archival.
    pub fn new(params: Arc<ParameterStore>) -> Self {
        Self {
            params,
            model: Arc::new(ModelSlot::empty()),
            rules: RuleClassifier::new(),
            archive: None,
        }
    }

    pub fn with_model_slot(mut self, model: Arc<ModelSlot>) -> Self {
        self.model = model;
        self
    }

    pub fn with_archive(mut self, archive: ArchiveQueue) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn parameters(&self) -> &Arc<ParameterStore> {
        &self.params
    }

    pub fn model_slot(&self) -> &Arc<ModelSlot> {
        &self.model
    }

    /// Analyses one drop test.
    #[instrument(skip(self, measurement))]
    pub fn analyze(&self, measurement: &Measurement) -> Result<Decision, AnalysisError> {
        let features = extract(measurement).map_err(|e| {
            metrics::counter!("droptest_analysis_rejected_total").increment(1);
            warn!(error = %e, "Rejected measurement");
            e
        })?;
        self.analyze_features(features)
    }

    /// Analyses an already extracted feature record.
    #[instrument(skip(self, features), fields(material = %features.material))]
    pub fn analyze_features(&self, features: FeatureRecord) -> Result<Decision, AnalysisError> {
        let params = self.params.snapshot();
        let decision = self.decide(features, &params).map_err(|e| {
            metrics::counter!("droptest_analysis_rejected_total").increment(1);
            warn!(error = %e, "Rule evaluation rejected feature record");
            e
        })?;

        metrics::counter!("droptest_analyses_total").increment(1);
        if decision.uncertain {
            metrics::counter!("droptest_uncertain_decisions_total").increment(1);
        }
        if decision.has_disagreement() {
            metrics::counter!("droptest_fusion_disagreements_total").increment(1);
        }
        info!(
            decision_id = %decision.id,
            verdict = %decision.verdict,
            confidence = decision.confidence,
            uncertain = decision.uncertain,
            fusion_path = %decision.fusion_path,
            parameters_version = decision.parameters_version,
            "Analysis complete"
        );

        if let Some(archive) = &self.archive {
            archive.submit(decision.clone());
        }
        Ok(decision)
    }

    fn decide(
        &self,
        features: FeatureRecord,
        params: &EngineParameters,
    ) -> Result<Decision, InvalidInputError> {
        let rule_output = self.rules.evaluate(&features, &params.thresholds)?;
        let hard_rule = params.thresholds.hard_rule(&features);

        let mut tags = Vec::new();
        let mut review_reasons = Vec::new();

        let model_output = match self.predict(&features) {
            Prediction::Available(output) => Some(output),
            Prediction::Unavailable(reason) => {
                metrics::counter!("droptest_model_unavailable_total").increment(1);
                if let UnavailableReason::Failed { cause } = &reason {
                    warn!(cause = %cause, "Model prediction failed, falling back to rule-only");
                    review_reasons.push(format!("model error: {}", cause));
                } else {
                    debug!("No model loaded, rule-only analysis");
                }
                tags.push(DecisionTag::ModelUnavailable {
                    reason: reason.to_string(),
                });
                None
            }
        };

        let rule = calibrated(params, &features, rule_output);
        let model = model_output.map(|output| calibrated(params, &features, output));

        let mut outcome = fuse(&rule, model.as_ref(), &params.fusion);
        if let Some(fired) = hard_rule {
            tags.push(DecisionTag::HardRule {
                rule: fired.to_string(),
            });
            // A physical shatter or spill is never outvoted by the model.
            if outcome.verdict != rule.output.verdict {
                outcome = FusionOutcome {
                    verdict: rule.output.verdict,
                    confidence: (rule.calibrated_confidence * params.fusion.disagreement_penalty)
                        .clamp(0.0, 1.0),
                    path: FusionPath::RuleDominant,
                    disagreement: outcome.disagreement,
                };
            }
        }

        if let Some((rule_verdict, model_verdict)) = outcome.disagreement {
            tags.push(DecisionTag::Disagreement {
                rule: rule_verdict,
                model: model_verdict,
            });
            review_reasons.push(format!(
                "rule says {} but model says {}",
                rule_verdict, model_verdict
            ));
        }
        if rule.output.tags.iter().any(|t| t == TAG_BORDERLINE) {
            tags.push(DecisionTag::BorderlineMeasurement);
            review_reasons.push(format!(
                "deformation {:.3} is within {:.3} of the limit {:.3}",
                features.deformation_ratio,
                params.thresholds.borderline_margin,
                params.thresholds.limit_for(&features.material)
            ));
        }

        let uncertain = params.fusion.ambiguous_band.contains(outcome.confidence);
        if uncertain {
            review_reasons.insert(
                0,
                format!(
                    "confidence {:.2} is within the review band",
                    outcome.confidence
                ),
            );
        }

        let mut outputs = vec![rule];
        outputs.extend(model);

        Ok(Decision {
            id: Uuid::new_v4(),
            verdict: outcome.verdict,
            confidence: outcome.confidence,
            uncertain,
            confidence_level: ConfidenceLevel::from_confidence(outcome.confidence),
            fusion_path: outcome.path,
            outputs,
            tags,
            review_reasons,
            features: Arc::new(features),
            parameters_version: params.version,
            decided_at: Utc::now(),
        })
    }

    fn predict(&self, features: &FeatureRecord) -> Prediction {
        let predictor = self.model.current();
        if !predictor.is_available() {
            return Prediction::Unavailable(UnavailableReason::NotLoaded);
        }
        match predictor.predict(features) {
            Prediction::Available(output) if output.method != Method::Model => {
                Prediction::Unavailable(UnavailableReason::Failed {
                    cause: format!("predictor reported method {}", output.method),
                })
            }
            other => other,
        }
    }
}

fn calibrated(
    params: &EngineParameters,
    features: &FeatureRecord,
    output: MethodOutput,
) -> CalibratedOutput {
    let calibrated_confidence =
        params
            .calibration
            .calibrate(output.method, &features.material, output.raw_confidence);
    CalibratedOutput {
        output,
        calibrated_confidence,
    }
}
