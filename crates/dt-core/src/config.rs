//! Engine configuration loading.
//!
//! YAML with `${VAR}` environment substitution. Every section has defaults so
//! an empty document is a valid configuration.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

use crate::calibration::FitterKind;
use crate::fusion::FusionConfig;
use crate::rules::RuleThresholds;

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub thresholds: RuleThresholds,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub calibration: CalibrationSettings,
    #[serde(default)]
    pub adaptation: AdaptationSettings,
    #[serde(default)]
    pub archive: ArchiveSettings,
}

/// How the adaptation loop fits calibration curves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    #[serde(default)]
    pub fitter: FitterKind,
    #[serde(default = "default_num_bins")]
    pub num_bins: usize,
    /// Minimum samples before a curve is fitted for a key.
    #[serde(default = "default_min_curve_samples")]
    pub min_samples: usize,
}

fn default_num_bins() -> usize {
    10
}

fn default_min_curve_samples() -> usize {
    30
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            fitter: FitterKind::default(),
            num_bins: default_num_bins(),
            min_samples: default_min_curve_samples(),
        }
    }
}

/// Cost function and data requirements for threshold adaptation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationSettings {
    /// Cost of passing a bottle that should have failed.
    #[serde(default = "default_false_pass_cost")]
    pub false_pass_cost: f64,
    /// Cost of failing a bottle that should have passed.
    #[serde(default = "default_false_fail_cost")]
    pub false_fail_cost: f64,
    /// Strong-labeled samples required before the global limit moves.
    #[serde(default = "default_min_strong_samples")]
    pub min_strong_samples: usize,
    /// Strong-labeled samples required for a per-material limit.
    #[serde(default = "default_min_category_samples")]
    pub min_category_samples: usize,
    /// Only the most recent N samples are considered; all when unset.
    #[serde(default)]
    pub window: Option<usize>,
    /// Re-derive fusion weights from per-method accuracy.
    #[serde(default)]
    pub adapt_fusion_weights: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_false_pass_cost() -> f64 {
    5.0
}

fn default_false_fail_cost() -> f64 {
    1.0
}

fn default_min_strong_samples() -> usize {
    20
}

fn default_min_category_samples() -> usize {
    15
}

fn default_interval_secs() -> u64 {
    3600
}

impl Default for AdaptationSettings {
    fn default() -> Self {
        Self {
            false_pass_cost: default_false_pass_cost(),
            false_fail_cost: default_false_fail_cost(),
            min_strong_samples: default_min_strong_samples(),
            min_category_samples: default_min_category_samples(),
            window: None,
            adapt_fusion_weights: false,
            interval_secs: default_interval_secs(),
        }
    }
}

/// Archive hand-off settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSettings {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// JSONL archive file; in-memory when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            path: None,
        }
    }
}

impl EngineConfig {
    /// Loads, substitutes and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parses and validates a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content)?;
        let config: EngineConfig = if substituted.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(&substituted)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Checks value ranges across all sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.thresholds;
        positive("thresholds.deformation_limit", t.deformation_limit)?;
        for limit in t.category_limits.values() {
            positive("thresholds.category_limits", *limit)?;
        }
        positive("thresholds.confidence_scale", t.confidence_scale)?;
        unit_interval("thresholds.hard_rule_confidence", t.hard_rule_confidence)?;
        if !(t.borderline_margin >= 0.0 && t.borderline_margin.is_finite()) {
            return invalid("thresholds.borderline_margin", "must be non-negative");
        }

        let f = &self.fusion;
        if !(f.rule_weight >= 0.0 && f.model_weight >= 0.0) {
            return invalid("fusion weights", "must be non-negative");
        }
        if !(f.rule_weight + f.model_weight > 0.0) || !(f.rule_weight + f.model_weight).is_finite() {
            return invalid("fusion weights", "at least one weight must be positive");
        }
        unit_interval("fusion.agreement_bonus", f.agreement_bonus)?;
        if !(f.disagreement_penalty > 0.0 && f.disagreement_penalty < 1.0) {
            return invalid(
                "fusion.disagreement_penalty",
                &format!("{} is not strictly between 0 and 1", f.disagreement_penalty),
            );
        }
        let band = &f.ambiguous_band;
        unit_interval("fusion.ambiguous_band.low", band.low)?;
        unit_interval("fusion.ambiguous_band.high", band.high)?;
        if band.low > band.high {
            return invalid("fusion.ambiguous_band", "low must not exceed high");
        }

        if self.calibration.num_bins == 0 {
            return invalid("calibration.num_bins", "must be at least 1");
        }

        let a = &self.adaptation;
        if !(a.false_pass_cost >= 0.0 && a.false_fail_cost >= 0.0) {
            return invalid("adaptation costs", "must be non-negative");
        }
        if a.window == Some(0) {
            return invalid("adaptation.window", "must be at least 1 when set");
        }

        if self.archive.queue_capacity == 0 {
            return invalid("archive.queue_capacity", "must be at least 1");
        }
        Ok(())
    }
}

fn invalid(field: &'static str, message: &str) -> Result<(), ConfigError> {
    Err(ConfigError::InvalidValue {
        field,
        message: message.to_string(),
    })
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        invalid(field, &format!("{} must be a positive number", value))
    }
}

fn unit_interval(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        invalid(field, &format!("{} is outside [0, 1]", value))
    }
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("Invalid regex for env vars")
    })
}

/// Replaces `${VAR}` with environment values; reports every missing variable.
fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing = Vec::new();
    let result = env_var_pattern().replace_all(input, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match env::var(name) {
            Ok(value) => value,
            Err(_) => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::EnvVarNotFound(missing.join(", ")));
    }
    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_yaml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.thresholds.deformation_limit, 0.15);
        assert_eq!(config.fusion.rule_weight, 0.6);
        assert_eq!(config.fusion.ambiguous_band.low, 0.0);
        assert!(!config.fusion.ambiguous_band.high_inclusive);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"
thresholds:
  deformation_limit: 0.10
  category_limits:
    glass: 0.05
fusion:
  disagreement_penalty: 0.7
  ambiguous_band:
    low: 0.4
    high: 0.7
    high_inclusive: true
calibration:
  fitter: histogram
archive:
  queue_capacity: 16
"#,
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.thresholds.deformation_limit, 0.10);
        assert_eq!(config.thresholds.limit_for("glass"), 0.05);
        assert!(config.thresholds.shatter_is_fail);
        assert_eq!(config.fusion.disagreement_penalty, 0.7);
        assert!(config.fusion.ambiguous_band.low_inclusive);
        assert!(config.fusion.ambiguous_band.high_inclusive);
        assert_eq!(config.calibration.fitter, FitterKind::Histogram);
        assert_eq!(config.archive.queue_capacity, 16);
    }

    #[test]
    fn test_missing_file() {
        let result = EngineConfig::load(Path::new("/nonexistent/droptest.yaml"));
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_invalid_yaml() {
        let result = EngineConfig::from_yaml_str("thresholds: [not, a, map");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("DT_TEST_DEFORMATION_LIMIT", "0.12");
        let config =
            EngineConfig::from_yaml_str("thresholds:\n  deformation_limit: ${DT_TEST_DEFORMATION_LIMIT}\n")
                .unwrap();
        assert_eq!(config.thresholds.deformation_limit, 0.12);
        env::remove_var("DT_TEST_DEFORMATION_LIMIT");
    }

    #[test]
    fn test_missing_env_var() {
        let result = EngineConfig::from_yaml_str(
            "archive:\n  path: ${DT_TEST_SURELY_UNSET_VAR}\n",
        );
        match result {
            Err(ConfigError::EnvVarNotFound(names)) => {
                assert_eq!(names, "DT_TEST_SURELY_UNSET_VAR")
            }
            other => panic!("expected EnvVarNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.fusion.disagreement_penalty = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "fusion.disagreement_penalty",
                ..
            })
        ));

        let mut config = EngineConfig::default();
        config.fusion.ambiguous_band.low = 0.8;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.fusion = config.fusion.with_weights(0.0, 0.0);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.thresholds.deformation_limit = 0.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.archive.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = EngineConfig::default();
        let yaml = config.to_yaml().unwrap();
        assert_eq!(EngineConfig::from_yaml_str(&yaml).unwrap(), config);
    }
}
