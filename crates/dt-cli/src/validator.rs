//! Configuration validation for the droptest CLI.
//!
//! Hard range checks come from [`EngineConfig::validate`]; this module adds
//! warnings for settings that are legal but likely unintended.

use colored::Colorize;
use serde::Serialize;

use dt_core::EngineConfig;

/// Result of configuration validation.
#[derive(Debug, Default, Serialize)]
pub struct ValidationResult {
    /// Errors that make the configuration unusable.
    pub errors: Vec<String>,
    /// Warnings that should be reviewed.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Prints the validation result to the console.
    pub fn print(&self) {
        if !self.warnings.is_empty() {
            println!();
            println!("{}", "Configuration Warnings:".yellow().bold());
            for warning in &self.warnings {
                println!("  {} {}", "⚠".yellow(), warning);
            }
        }

        if !self.errors.is_empty() {
            println!();
            println!("{}", "Configuration Errors:".red().bold());
            for error in &self.errors {
                println!("  {} {}", "✗".red(), error);
            }
        }

        if self.errors.is_empty() && self.warnings.is_empty() {
            println!("  {} Configuration OK", "✓".green());
        }
    }
}

/// Validates engine configuration.
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &EngineConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        if let Err(e) = config.validate() {
            result.add_error(e.to_string());
        }

        Self::check_thresholds(config, &mut result);
        Self::check_fusion(config, &mut result);
        Self::check_adaptation(config, &mut result);
        result
    }

    fn check_thresholds(config: &EngineConfig, result: &mut ValidationResult) {
        let t = &config.thresholds;
        if !t.shatter_is_fail {
            result.add_warning("thresholds.shatter_is_fail is disabled; shattered bottles can pass");
        }
        if !t.spill_is_fail {
            result.add_warning("thresholds.spill_is_fail is disabled; spilling bottles can pass");
        }
        for (material, limit) in &t.category_limits {
            if *limit > 1.0 {
                result.add_warning(format!(
                    "thresholds.category_limits.{} = {} allows the aspect ratio to double",
                    material, limit
                ));
            }
        }
    }

    fn check_fusion(config: &EngineConfig, result: &mut ValidationResult) {
        let f = &config.fusion;
        if f.model_weight == 0.0 {
            result.add_warning("fusion.model_weight is 0; a loaded model only matters on disagreement");
        }
        let band = &f.ambiguous_band;
        if band.low <= 0.0 && band.high >= 1.0 {
            result.add_warning("fusion.ambiguous_band covers [0, 1]; every decision goes to review");
        }
        if band.low == band.high && !(band.low_inclusive && band.high_inclusive) {
            result.add_warning("fusion.ambiguous_band is empty; no decision goes to review");
        }
    }

    fn check_adaptation(config: &EngineConfig, result: &mut ValidationResult) {
        let a = &config.adaptation;
        if a.false_pass_cost < a.false_fail_cost {
            result.add_warning(format!(
                "adaptation.false_pass_cost ({}) is below false_fail_cost ({}); \
                 adaptation will favour passing defective bottles",
                a.false_pass_cost, a.false_fail_cost
            ));
        }
        if a.min_strong_samples < 10 {
            result.add_warning(format!(
                "adaptation.min_strong_samples = {} is very low; limits may swing on noise",
                a.min_strong_samples
            ));
        }
        if let Some(window) = a.window {
            if window < a.min_strong_samples {
                result.add_warning(format!(
                    "adaptation.window ({}) is smaller than min_strong_samples ({}); \
                     adaptation can never run",
                    window, a.min_strong_samples
                ));
            }
        }
        if config.archive.path.is_none() {
            result.add_warning("archive.path is not set; the CLI falls back to its default file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dt_core::AmbiguousBand;

    fn configured() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.archive.path = Some("archive.jsonl".into());
        config
    }

    #[test]
    fn test_default_config_is_clean() {
        let result = ConfigValidator::validate(&configured());
        assert!(!result.has_errors());
        assert!(!result.has_warnings(), "{:?}", result.warnings);
    }

    #[test]
    fn test_range_errors_are_reported() {
        let mut config = configured();
        config.fusion.disagreement_penalty = 1.0;
        let result = ConfigValidator::validate(&config);
        assert!(result.has_errors());
        assert!(result.errors[0].contains("disagreement_penalty"));
    }

    #[test]
    fn test_cost_inversion_warns() {
        let mut config = configured();
        config.adaptation.false_pass_cost = 0.5;
        let result = ConfigValidator::validate(&config);
        assert!(!result.has_errors());
        assert!(result.warnings.iter().any(|w| w.contains("false_pass_cost")));
    }

    #[test]
    fn test_unreachable_window_warns() {
        let mut config = configured();
        config.adaptation.window = Some(5);
        let result = ConfigValidator::validate(&config);
        assert!(result.warnings.iter().any(|w| w.contains("never run")));
    }

    #[test]
    fn test_degenerate_band_warns() {
        let mut config = configured();
        config.fusion.ambiguous_band = AmbiguousBand::new(0.5, 0.5);
        let result = ConfigValidator::validate(&config);
        assert!(result.warnings.iter().any(|w| w.contains("empty")));
    }
}
