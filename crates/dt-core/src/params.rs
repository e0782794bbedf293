//! Published engine parameters.
//!
//! Thresholds, fusion settings and calibration curves travel together as one
//! immutable [`EngineParameters`] snapshot. Analyses clone the current `Arc`
//! once and read only that snapshot; updates build a complete new snapshot and
//! swap the pointer under a short write lock, so a reader sees either the old
//! or the new set and never a mixture.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::info;

use crate::calibration::CalibrationSet;
use crate::config::{ConfigError, EngineConfig};
use crate::fusion::FusionConfig;
use crate::rules::RuleThresholds;

/// Errors reading or writing a persisted parameter snapshot.
#[derive(Debug, Error)]
pub enum ParameterFileError {
    #[error("Failed to access parameter file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed parameter file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One immutable, versioned parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineParameters {
    /// Strictly increasing across publishes of one store.
    pub version: u64,
    pub thresholds: RuleThresholds,
    pub fusion: FusionConfig,
    #[serde(default)]
    pub calibration: CalibrationSet,
    pub published_at: DateTime<Utc>,
}

impl Default for EngineParameters {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl EngineParameters {
    /// Initial snapshot for a configuration, without calibration curves.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            version: 1,
            thresholds: config.thresholds.clone(),
            fusion: config.fusion.clone(),
            calibration: CalibrationSet::new(),
            published_at: Utc::now(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: RuleThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_fusion(mut self, fusion: FusionConfig) -> Self {
        self.fusion = fusion;
        self
    }

    pub fn with_calibration(mut self, calibration: CalibrationSet) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn load(path: &Path) -> Result<Self, ParameterFileError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ParameterFileError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Holder of the currently published snapshot.
#[derive(Debug)]
pub struct ParameterStore {
    current: RwLock<Arc<EngineParameters>>,
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new(EngineParameters::default())
    }
}

impl ParameterStore {
    pub fn new(initial: EngineParameters) -> Self {
        metrics::gauge!("droptest_parameters_version").set(initial.version as f64);
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(EngineParameters::from_config(config))
    }

    /// Returns the current snapshot. Cheap; holds the lock only to clone the `Arc`.
    pub fn snapshot(&self) -> Arc<EngineParameters> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    /// Publishes a snapshot derived from the current one.
    ///
    /// `derive` receives the current snapshot and returns the next one; its
    /// version and publish time are overwritten. The write lock is held only
    /// for `derive` and the swap, so the caller should compute anything
    /// expensive beforehand.
    pub fn publish_with<F>(&self, derive: F) -> Arc<EngineParameters>
    where
        F: FnOnce(&EngineParameters) -> EngineParameters,
    {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = derive(&guard);
        next.version = guard.version + 1;
        next.published_at = Utc::now();
        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        drop(guard);

        metrics::gauge!("droptest_parameters_version").set(next.version as f64);
        info!(version = next.version, "Published engine parameters");
        next
    }

    /// Hot-reloads thresholds and fusion settings from a configuration,
    /// keeping the current calibration curves.
    pub fn apply_config(&self, config: &EngineConfig) -> Result<u64, ConfigError> {
        config.validate()?;
        let published = self.publish_with(|current| {
            current
                .clone()
                .with_thresholds(config.thresholds.clone())
                .with_fusion(config.fusion.clone())
        });
        Ok(published.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationCurve, CurveKey};
    use crate::decision::Method;
    use tempfile::tempdir;

    #[test]
    fn test_snapshot_is_stable_across_publish() {
        let store = ParameterStore::default();
        let before = store.snapshot();

        store.publish_with(|p| {
            p.clone()
                .with_thresholds(RuleThresholds::default().with_deformation_limit(0.3))
        });

        assert_eq!(before.thresholds.deformation_limit, 0.15);
        assert_eq!(store.snapshot().thresholds.deformation_limit, 0.3);
        assert_eq!(store.version(), before.version + 1);
    }

    #[test]
    fn test_apply_config_keeps_curves() {
        let store = ParameterStore::default();
        store.publish_with(|p| {
            p.clone().with_calibration(
                CalibrationSet::new().with_curve(CalibrationCurve::identity(CurveKey::global(
                    Method::Rule,
                ))),
            )
        });

        let mut config = EngineConfig::default();
        config.thresholds.deformation_limit = 0.2;
        config.fusion.disagreement_penalty = 0.5;
        let version = store.apply_config(&config).unwrap();

        let snapshot = store.snapshot();
        assert_eq!(version, 3);
        assert_eq!(snapshot.thresholds.deformation_limit, 0.2);
        assert_eq!(snapshot.fusion.disagreement_penalty, 0.5);
        assert_eq!(snapshot.calibration.len(), 1);
    }

    #[test]
    fn test_apply_invalid_config_publishes_nothing() {
        let store = ParameterStore::default();
        let mut config = EngineConfig::default();
        config.fusion.disagreement_penalty = 1.5;

        assert!(store.apply_config(&config).is_err());
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.json");
        let params = EngineParameters::default();

        params.save(&path).unwrap();
        let loaded = EngineParameters::load(&path).unwrap();
        assert_eq!(loaded.thresholds, params.thresholds);
        assert_eq!(loaded.version, 1);
    }
}
