//! File locations and loading for the droptest CLI.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dt_core::{EngineConfig, EngineParameters, JsonlSampleStore, Measurement};

/// Archive file used when neither the flag nor the config names one.
pub const DEFAULT_ARCHIVE: &str = "droptest-archive.jsonl";

/// Parameter snapshot file used when `--params` is not given.
pub const DEFAULT_PARAMS: &str = "droptest-params.json";

/// Resolved configuration and the files the CLI reads and writes.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub config: EngineConfig,
    pub config_path: Option<PathBuf>,
    pub archive_path: PathBuf,
    pub params_path: PathBuf,
}

impl Workspace {
    /// Loads the configuration file (defaults when none is given) and resolves
    /// archive and parameter paths. Flags win over the config file.
    pub fn load(
        config_path: Option<PathBuf>,
        archive: Option<PathBuf>,
        params: Option<PathBuf>,
    ) -> Result<Self> {
        let config = match &config_path {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?,
            None => EngineConfig::default(),
        };

        let archive_path = archive
            .or_else(|| config.archive.path.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ARCHIVE));
        let params_path = params.unwrap_or_else(|| PathBuf::from(DEFAULT_PARAMS));

        Ok(Self {
            config,
            config_path,
            archive_path,
            params_path,
        })
    }

    /// Returns the persisted parameter snapshot, or a fresh one seeded from
    /// the configuration when no snapshot has been saved yet.
    pub fn parameters(&self) -> Result<EngineParameters> {
        if self.params_path.exists() {
            EngineParameters::load(&self.params_path).with_context(|| {
                format!(
                    "Failed to load parameter snapshot: {}",
                    self.params_path.display()
                )
            })
        } else {
            Ok(EngineParameters::from_config(&self.config))
        }
    }

    pub fn save_parameters(&self, params: &EngineParameters) -> Result<()> {
        params.save(&self.params_path).with_context(|| {
            format!(
                "Failed to write parameter snapshot: {}",
                self.params_path.display()
            )
        })
    }

    pub fn archive(&self) -> Arc<JsonlSampleStore> {
        Arc::new(JsonlSampleStore::new(&self.archive_path))
    }
}

/// Input file accepted by `analyze`: one measurement or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MeasurementInput {
    Many(Vec<Measurement>),
    One(Measurement),
}

/// Reads measurements from a JSON file.
pub fn read_measurements(path: &Path) -> Result<Vec<Measurement>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;
    let input: MeasurementInput = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse measurements: {}", path.display()))?;
    Ok(match input {
        MeasurementInput::Many(list) => list,
        MeasurementInput::One(one) => vec![one],
    })
}
