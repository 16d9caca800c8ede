//! Run configuration, loadable from TOML. Every field has a default, so an
//! empty file (or no file at all) is a valid configuration.

use crate::basis::AggregateMethod;
use crate::classify::{CalibratedThreshold, OperatingCondition, ThresholdTable};
use crate::correct::TumorFractionCorrector;
use crate::solver::SimplexSolver;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasisSettings {
    pub aggregate: AggregateMethod,
    /// Min/max standardize features on the reference cohorts.
    pub standardize: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationSettings {
    /// Phenotype whose weight is thresholded. No calls are made when unset.
    pub phenotype: Option<String>,
    pub condition: OperatingCondition,
    pub thresholds: ThresholdTable,
    /// Report `indeterminate` instead of a binary call for low-confidence samples.
    pub low_confidence_indeterminate: bool,
}

impl Default for ClassificationSettings {
    fn default() -> Self {
        Self {
            phenotype: None,
            condition: OperatingCondition::default(),
            thresholds: ThresholdTable::default(),
            low_confidence_indeterminate: true,
        }
    }
}

impl ClassificationSettings {
    pub fn threshold(&self) -> CalibratedThreshold {
        self.thresholds.for_condition(self.condition)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Label of the healthy reference phenotype used for tumor-fraction correction.
    pub normal_phenotype: String,
    pub basis: BasisSettings,
    pub tumor_fraction: TumorFractionCorrector,
    pub solver: SimplexSolver,
    pub classification: ClassificationSettings,
    /// Also report softmax likelihood weights of the tumor phenotypes.
    pub likelihood_weights: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            normal_phenotype: "Healthy".to_string(),
            basis: BasisSettings::default(),
            tumor_fraction: TumorFractionCorrector::default(),
            solver: SimplexSolver::default(),
            classification: ClassificationSettings::default(),
            likelihood_weights: true,
        }
    }
}

impl RunConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path.as_ref())?;
        let config: RunConfig = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.normal_phenotype.is_empty() {
            return Err(ConfigError::Invalid("normal_phenotype must not be empty".into()));
        }
        self.basis
            .aggregate
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let tf = &self.tumor_fraction;
        if !(tf.floor >= 0.0 && tf.floor < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "tumor_fraction.floor must lie in [0, 1), got {}",
                tf.floor
            )));
        }
        if !(tf.grid_step > 0.0 && tf.grid_step <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "tumor_fraction.grid_step must lie in (0, 1], got {}",
                tf.grid_step
            )));
        }
        if self.solver.max_iterations == 0 || !(self.solver.tolerance > 0.0) {
            return Err(ConfigError::Invalid(
                "solver.max_iterations and solver.tolerance must be positive".into(),
            ));
        }
        let t = &self.classification.thresholds;
        for (name, value) in [("whole_genome", t.whole_genome), ("ultra_low_pass", t.ultra_low_pass)] {
            if !value.is_finite() {
                return Err(ConfigError::Invalid(format!(
                    "classification.thresholds.{name} must be finite"
                )));
            }
        }
        Ok(())
    }
}
