//! Thresholding of a phenotype's mixture weight into a call.

use crate::solver::MixtureResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifyError {
    #[error("Phenotype '{0}' is not present in the mixture result.")]
    UnknownPhenotype(String),
}

/// Assay depth or type; each has its own calibrated threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingCondition {
    #[default]
    WholeGenome,
    UltraLowPass,
}

impl OperatingCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WholeGenome => "whole_genome",
            Self::UltraLowPass => "ultra_low_pass",
        }
    }
}

impl fmt::Display for OperatingCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decision threshold on a mixture weight, tied to the condition it was calibrated for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibratedThreshold {
    pub value: f64,
    pub condition: OperatingCondition,
}

/// One calibrated threshold per operating condition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdTable {
    pub whole_genome: f64,
    pub ultra_low_pass: f64,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            whole_genome: 0.5,
            ultra_low_pass: 0.5,
        }
    }
}

impl ThresholdTable {
    pub fn for_condition(&self, condition: OperatingCondition) -> CalibratedThreshold {
        let value = match condition {
            OperatingCondition::WholeGenome => self.whole_genome,
            OperatingCondition::UltraLowPass => self.ultra_low_pass,
        };
        CalibratedThreshold { value, condition }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Positive,
    Negative,
    /// The call could not be trusted, e.g. because the tumor fraction was too low.
    Indeterminate,
}

impl Call {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Indeterminate => "indeterminate",
        }
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationCall {
    pub phenotype: String,
    pub weight: f64,
    pub threshold: CalibratedThreshold,
    pub call: Call,
}

impl ClassificationCall {
    /// Downgrades a binary call to `Indeterminate`.
    pub fn into_indeterminate(self) -> Self {
        Self {
            call: Call::Indeterminate,
            ..self
        }
    }
}

/// Calls `phenotype` positive when its weight is at least the threshold value.
pub fn classify(
    result: &MixtureResult,
    phenotype: &str,
    threshold: CalibratedThreshold,
) -> Result<ClassificationCall, ClassifyError> {
    let weight = result
        .weight(phenotype)
        .ok_or_else(|| ClassifyError::UnknownPhenotype(phenotype.to_string()))?;
    let call = if weight >= threshold.value {
        Call::Positive
    } else {
        Call::Negative
    };
    Ok(ClassificationCall {
        phenotype: phenotype.to_string(),
        weight,
        threshold,
        call,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixture(tumor: f64) -> MixtureResult {
        MixtureResult {
            weights: vec![("Healthy".into(), 1.0 - tumor), ("Tumor".into(), tumor)],
            residual: 0.0,
            iterations: 1,
        }
    }

    fn at(value: f64) -> CalibratedThreshold {
        CalibratedThreshold {
            value,
            condition: OperatingCondition::WholeGenome,
        }
    }

    #[test]
    fn weight_above_threshold_is_positive() {
        let call = classify(&mixture(0.6), "Tumor", at(0.5)).unwrap();
        assert_eq!(call.call, Call::Positive);
        assert_eq!(call.weight, 0.6);
    }

    #[test]
    fn weight_below_threshold_is_negative() {
        let call = classify(&mixture(0.6), "Tumor", at(0.65)).unwrap();
        assert_eq!(call.call, Call::Negative);
    }

    #[test]
    fn weight_equal_to_threshold_is_positive() {
        assert_eq!(
            classify(&mixture(0.5), "Tumor", at(0.5)).unwrap().call,
            Call::Positive
        );
    }

    #[test]
    fn unknown_phenotype_is_an_error() {
        assert_eq!(
            classify(&mixture(0.6), "NEPC", at(0.5)).unwrap_err(),
            ClassifyError::UnknownPhenotype("NEPC".into())
        );
    }

    #[test]
    fn table_selects_condition_specific_threshold() {
        let table = ThresholdTable {
            whole_genome: 0.3,
            ultra_low_pass: 0.7,
        };
        let ulp = table.for_condition(OperatingCondition::UltraLowPass);
        assert_eq!(ulp.value, 0.7);
        let call = classify(&mixture(0.6), "Tumor", ulp).unwrap();
        assert_eq!(call.call, Call::Negative);
        assert_eq!(call.threshold.condition, OperatingCondition::UltraLowPass);
    }
}
