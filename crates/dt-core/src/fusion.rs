//! Fusion of calibrated rule and model outputs into one verdict.

use serde::{Deserialize, Serialize};

use crate::decision::{CalibratedOutput, FusionPath, Verdict};

/// Confidence band in which a decision is routed to human review.
///
/// The default `[0.0, 0.75)` routes every decision below the high bound to review.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AmbiguousBand {
    pub low: f64,
    pub high: f64,
    #[serde(default = "default_true")]
    pub low_inclusive: bool,
    #[serde(default)]
    pub high_inclusive: bool,
}

fn default_true() -> bool {
    true
}

impl Default for AmbiguousBand {
    fn default() -> Self {
        Self {
            low: 0.0,
            high: 0.75,
            low_inclusive: true,
            high_inclusive: false,
        }
    }
}

impl AmbiguousBand {
    pub fn new(low: f64, high: f64) -> Self {
        Self {
            low,
            high,
            ..Default::default()
        }
    }

    /// Sets which ends of the band are inclusive.
    pub fn with_inclusivity(mut self, low_inclusive: bool, high_inclusive: bool) -> Self {
        self.low_inclusive = low_inclusive;
        self.high_inclusive = high_inclusive;
        self
    }

    /// Returns true if `confidence` lies inside the band.
    pub fn contains(&self, confidence: f64) -> bool {
        let above_low = if self.low_inclusive {
            confidence >= self.low
        } else {
            confidence > self.low
        };
        let below_high = if self.high_inclusive {
            confidence <= self.high
        } else {
            confidence < self.high
        };
        above_low && below_high
    }
}

/// Fusion weights and penalties. Part of the published parameter snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    #[serde(default = "default_rule_weight")]
    pub rule_weight: f64,
    #[serde(default = "default_model_weight")]
    pub model_weight: f64,
    /// Bonus added when both methods agree; also bounds the agreement cap.
    #[serde(default = "default_agreement_bonus")]
    pub agreement_bonus: f64,
    /// Factor in (0, 1) applied to the winning confidence on disagreement.
    #[serde(default = "default_disagreement_penalty")]
    pub disagreement_penalty: f64,
    #[serde(default)]
    pub ambiguous_band: AmbiguousBand,
}

fn default_rule_weight() -> f64 {
    0.6
}

fn default_model_weight() -> f64 {
    0.4
}

fn default_agreement_bonus() -> f64 {
    0.05
}

fn default_disagreement_penalty() -> f64 {
    0.8
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            rule_weight: default_rule_weight(),
            model_weight: default_model_weight(),
            agreement_bonus: default_agreement_bonus(),
            disagreement_penalty: default_disagreement_penalty(),
            ambiguous_band: AmbiguousBand::default(),
        }
    }
}

impl FusionConfig {
    pub fn with_weights(mut self, rule_weight: f64, model_weight: f64) -> Self {
        self.rule_weight = rule_weight;
        self.model_weight = model_weight;
        self
    }

    pub fn with_band(mut self, band: AmbiguousBand) -> Self {
        self.ambiguous_band = band;
        self
    }

    /// Upper bound on fused confidence when both methods agree.
    pub fn agreement_cap(&self, rule_confidence: f64, model_confidence: f64) -> f64 {
        (rule_confidence.max(model_confidence) + self.agreement_bonus).min(1.0)
    }
}

/// Result of fusing one analysis' outputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionOutcome {
    pub verdict: Verdict,
    pub confidence: f64,
    pub path: FusionPath,
    /// (rule verdict, model verdict) when the methods disagreed.
    pub disagreement: Option<(Verdict, Verdict)>,
}

/// Combines the calibrated rule output with the optional calibrated model output.
///
/// Pure: the same inputs always give the same outcome.
pub fn fuse(
    rule: &CalibratedOutput,
    model: Option<&CalibratedOutput>,
    config: &FusionConfig,
) -> FusionOutcome {
    let c_r = rule.calibrated_confidence.clamp(0.0, 1.0);
    let Some(model) = model else {
        return FusionOutcome {
            verdict: rule.output.verdict,
            confidence: c_r,
            path: FusionPath::RuleOnly,
            disagreement: None,
        };
    };
    let c_m = model.calibrated_confidence.clamp(0.0, 1.0);
    let (v_r, v_m) = (rule.output.verdict, model.output.verdict);

    if v_r == v_m {
        let (w_r, w_m) = normalized_weights(config);
        let weighted = w_r * c_r + w_m * c_m;
        let cap = config.agreement_cap(c_r, c_m);
        let confidence = (weighted + config.agreement_bonus).min(cap).clamp(0.0, 1.0);
        return FusionOutcome {
            verdict: v_r,
            confidence,
            path: FusionPath::HybridAgreement,
            disagreement: None,
        };
    }

    // Exact ties go to the method that says FAIL.
    let rule_wins = c_r > c_m || (c_r == c_m && v_r == Verdict::Fail);
    let (verdict, winner, path) = if rule_wins {
        (v_r, c_r, FusionPath::RuleDominant)
    } else {
        (v_m, c_m, FusionPath::ModelDominant)
    };

    FusionOutcome {
        verdict,
        confidence: (winner * config.disagreement_penalty).clamp(0.0, 1.0),
        path,
        disagreement: Some((v_r, v_m)),
    }
}

fn normalized_weights(config: &FusionConfig) -> (f64, f64) {
    let w_r = config.rule_weight.max(0.0);
    let w_m = config.model_weight.max(0.0);
    let total = w_r + w_m;
    if total > 0.0 && total.is_finite() {
        (w_r / total, w_m / total)
    } else {
        (0.5, 0.5)
    }
}
