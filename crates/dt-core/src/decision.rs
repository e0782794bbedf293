//! Verdicts, per-method outputs and the final decision record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::features::FeatureRecord;

/// PASS/FAIL classification for one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    /// Parses a verdict from user input (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "PASS" => Some(Verdict::Pass),
            "FAIL" => Some(Verdict::Fail),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Fail => write!(f, "FAIL"),
        }
    }
}

/// Identifies the classifier that produced an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Rule,
    Model,
}

impl Method {
    /// Returns the lowercase key used in calibration curve keys.
    pub fn as_key(&self) -> &'static str {
        match self {
            Method::Rule => "rule",
            Method::Model => "model",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Rule => write!(f, "RULE"),
            Method::Model => write!(f, "MODEL"),
        }
    }
}

/// Result of one classifier invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodOutput {
    pub method: Method,
    pub verdict: Verdict,
    /// Self-reported certainty in `verdict`, in [0, 1].
    pub raw_confidence: f64,
    /// Which rule fired or which feature contributed most.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl MethodOutput {
    /// Creates an output, clipping the confidence into [0, 1].
    pub fn new(method: Method, verdict: Verdict, raw_confidence: f64) -> Self {
        let raw_confidence = if raw_confidence.is_nan() {
            0.0
        } else {
            raw_confidence.clamp(0.0, 1.0)
        };
        Self {
            method,
            verdict,
            raw_confidence,
            tags: Vec::new(),
        }
    }

    /// Adds an explanatory tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// A method output together with its calibrated confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedOutput {
    pub output: MethodOutput,
    pub calibrated_confidence: f64,
}

/// How the final verdict was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionPath {
    /// Model unavailable; the rule output is the decision.
    RuleOnly,
    /// Both methods agreed.
    HybridAgreement,
    /// Methods disagreed and the rule was more confident.
    RuleDominant,
    /// Methods disagreed and the model was more confident.
    ModelDominant,
}

impl FusionPath {
    /// Returns true if both methods contributed.
    pub fn is_hybrid(&self) -> bool {
        !matches!(self, FusionPath::RuleOnly)
    }

    /// Returns a stable string for storage and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            FusionPath::RuleOnly => "rule_only",
            FusionPath::HybridAgreement => "hybrid_agreement",
            FusionPath::RuleDominant => "rule_dominant",
            FusionPath::ModelDominant => "model_dominant",
        }
    }
}

impl std::fmt::Display for FusionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Markers attached to a decision explaining its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionTag {
    /// The model was not consulted.
    ModelUnavailable { reason: String },
    /// Rule and model produced different verdicts.
    Disagreement { rule: Verdict, model: Verdict },
    /// The deformation measurement sat within the borderline margin of its limit.
    BorderlineMeasurement,
    /// A hard rule forced the rule verdict.
    HardRule { rule: String },
}

/// Categorical view of a confidence value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    VeryLow,
}

impl ConfidenceLevel {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.85 {
            ConfidenceLevel::High
        } else if confidence >= 0.65 {
            ConfidenceLevel::Medium
        } else if confidence >= 0.45 {
            ConfidenceLevel::Low
        } else {
            ConfidenceLevel::VeryLow
        }
    }
}

impl std::fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfidenceLevel::High => write!(f, "High"),
            ConfidenceLevel::Medium => write!(f, "Medium"),
            ConfidenceLevel::Low => write!(f, "Low"),
            ConfidenceLevel::VeryLow => write!(f, "Very Low"),
        }
    }
}

/// Final output of one analysis. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Decision id; also the id of the archived training sample.
    pub id: Uuid,
    pub verdict: Verdict,
    /// Fused confidence in `verdict`, in [0, 1].
    pub confidence: f64,
    /// True when `confidence` lies in the ambiguous band; routes to human review.
    pub uncertain: bool,
    pub confidence_level: ConfidenceLevel,
    pub fusion_path: FusionPath,
    /// Contributing outputs; the rule output is always first.
    pub outputs: Vec<CalibratedOutput>,
    pub tags: Vec<DecisionTag>,
    /// Human-readable reasons a reviewer should look at this decision.
    pub review_reasons: Vec<String>,
    pub features: Arc<FeatureRecord>,
    /// Version of the parameter snapshot the analysis read.
    pub parameters_version: u64,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    /// Returns the output of the given method, if it contributed.
    pub fn output(&self, method: Method) -> Option<&CalibratedOutput> {
        self.outputs.iter().find(|o| o.output.method == method)
    }

    /// Returns true if rule and model disagreed.
    pub fn has_disagreement(&self) -> bool {
        self.tags
            .iter()
            .any(|t| matches!(t, DecisionTag::Disagreement { .. }))
    }
}
