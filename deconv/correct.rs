//! # Tumor-fraction correction
//!
//! A cfDNA sample is modeled as `observed = t·tumor + (1 − t)·normal`, where
//! `t` is the tumor fraction and `normal` is the vertex of the healthy
//! reference cohort. Solving for the tumor component gives
//!
//! `corrected = normal + (observed − normal) / t`
//!
//! which is only defined for `t ∈ (0, 1]` and grows unstable as `t → 0`.
//! The policies below decide what happens at both ends of that range.

use crate::basis::{ReferenceSimplex, SimplexVertex};
use crate::features::FeatureVector;
use crate::pipeline::{QuerySample, SampleFailure};
use crate::tfx::{self, DEFAULT_GRID_STEP};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What to do when a sample's tumor fraction is absent or outside `(0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingTumorFractionPolicy {
    /// Fail the sample with `UndefinedTumorFraction`.
    #[default]
    Fail,
    /// Project the uncorrected vector and flag it as low confidence.
    PassThrough,
    /// Estimate the fraction from the reference simplex.
    Estimate,
}

/// What to do when a tumor fraction is at or below the confidence floor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LowTumorFractionPolicy {
    /// Correct with the given fraction and flag the sample.
    #[default]
    Flag,
    /// Correct with the floor instead of the given fraction and flag the sample.
    Clamp,
    /// Fail samples strictly below the floor.
    Reject,
}

/// Where the tumor fraction used for correction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TumorFractionSource {
    Provided,
    Clamped,
    Estimated,
    Uncorrected,
}

impl TumorFractionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provided => "provided",
            Self::Clamped => "clamped",
            Self::Estimated => "estimated",
            Self::Uncorrected => "uncorrected",
        }
    }
}

impl fmt::Display for TumorFractionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tumor-fraction-corrected feature vector.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectedVector {
    pub vector: FeatureVector,
    /// Fraction actually used; `None` when no correction was applied.
    pub tumor_fraction: Option<f64>,
    pub source: TumorFractionSource,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TumorFractionCorrector {
    /// Fractions at or below this value are low confidence.
    pub floor: f64,
    pub low_policy: LowTumorFractionPolicy,
    pub missing_policy: MissingTumorFractionPolicy,
    /// Grid step of the estimator used by `MissingTumorFractionPolicy::Estimate`.
    pub grid_step: f64,
}

impl Default for TumorFractionCorrector {
    fn default() -> Self {
        Self {
            floor: 0.01,
            low_policy: LowTumorFractionPolicy::default(),
            missing_policy: MissingTumorFractionPolicy::default(),
            grid_step: DEFAULT_GRID_STEP,
        }
    }
}

impl TumorFractionCorrector {
    /// Removes the normal contribution from `sample` using its own tumor fraction.
    pub fn correct(
        &self,
        sample: &QuerySample,
        normal: &SimplexVertex,
    ) -> Result<CorrectedVector, SampleFailure> {
        self.correct_inner(sample, normal, None)
    }

    /// Like [`correct`](Self::correct), but may estimate missing fractions from `simplex`.
    pub fn correct_or_estimate(
        &self,
        sample: &QuerySample,
        normal: &SimplexVertex,
        simplex: &ReferenceSimplex,
    ) -> Result<CorrectedVector, SampleFailure> {
        self.correct_inner(sample, normal, Some(simplex))
    }

    fn correct_inner(
        &self,
        sample: &QuerySample,
        normal: &SimplexVertex,
        simplex: Option<&ReferenceSimplex>,
    ) -> Result<CorrectedVector, SampleFailure> {
        let observed = sample
            .vector
            .restrict(&sample.id, normal.vector.shared_names())?;

        let (given, mut source) = match sample.tumor_fraction.filter(|t| is_defined(*t)) {
            Some(t) => (t, TumorFractionSource::Provided),
            None => {
                let reason = match sample.tumor_fraction {
                    Some(t) if !t.is_finite() => "tumor fraction is not a finite number".to_string(),
                    Some(t) => format!("{t} is outside (0, 1]"),
                    None => "no tumor fraction was provided".to_string(),
                };
                match self.missing_policy {
                    MissingTumorFractionPolicy::Fail => {
                        return Err(SampleFailure::UndefinedTumorFraction { reason });
                    }
                    MissingTumorFractionPolicy::PassThrough => {
                        log::debug!("Sample '{}': {reason}; projecting uncorrected.", sample.id);
                        return Ok(CorrectedVector {
                            vector: observed,
                            tumor_fraction: None,
                            source: TumorFractionSource::Uncorrected,
                            low_confidence: true,
                        });
                    }
                    MissingTumorFractionPolicy::Estimate => {
                        let simplex = simplex.ok_or_else(|| {
                            SampleFailure::UndefinedTumorFraction {
                                reason: format!("{reason} and no reference is available to estimate it"),
                            }
                        })?;
                        let estimate = tfx::estimate_tumor_fraction(
                            &observed,
                            simplex,
                            &normal.phenotype,
                            self.grid_step,
                        )
                        .map_err(|err| SampleFailure::UndefinedTumorFraction {
                            reason: format!("{reason}; estimation failed: {err}"),
                        })?;
                        if !is_defined(estimate.tumor_fraction) {
                            return Err(SampleFailure::UndefinedTumorFraction {
                                reason: format!("{reason}; estimated tumor fraction is zero"),
                            });
                        }
                        (estimate.tumor_fraction, TumorFractionSource::Estimated)
                    }
                }
            }
        };

        let mut low_confidence = false;
        let mut used = given;
        if given <= self.floor {
            match self.low_policy {
                LowTumorFractionPolicy::Reject if given < self.floor => {
                    return Err(SampleFailure::TumorFractionBelowFloor {
                        tumor_fraction: given,
                        floor: self.floor,
                    });
                }
                LowTumorFractionPolicy::Clamp if given < self.floor => {
                    used = self.floor;
                    source = TumorFractionSource::Clamped;
                }
                _ => {}
            }
            low_confidence = true;
            log::warn!(
                "Sample '{}' has tumor fraction {given} at or below the floor {}; flagged as low confidence.",
                sample.id,
                self.floor
            );
        }

        let vector = if used == 1.0 {
            observed
        } else {
            let normal_values = normal.vector.values();
            let corrected = &normal_values + &((&observed.values() - &normal_values) / used);
            observed.with_values(corrected)?
        };

        Ok(CorrectedVector {
            vector,
            tumor_fraction: Some(used),
            source,
            low_confidence,
        })
    }
}

fn is_defined(t: f64) -> bool {
    t.is_finite() && t > 0.0 && t <= 1.0
}
