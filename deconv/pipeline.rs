//! # Per-sample deconvolution pipeline
//!
//! A [`Deconvolver`] borrows one [`ReferenceSimplex`] and one [`RunConfig`] and
//! runs every query sample through alignment, tumor-fraction correction,
//! projection and classification. Samples are independent: a batch is
//! processed in parallel and a failing sample is recorded in the report
//! without affecting the others.

use crate::basis::{ReferenceSimplex, SimplexVertex};
use crate::classify::{self, ClassificationCall, ClassifyError};
use crate::config::RunConfig;
use crate::correct::TumorFractionSource;
use crate::features::{FeatureError, FeatureMatrix, FeatureVector};
use crate::linalg::LinalgError;
use crate::progress::{BatchProgressObserver, BatchProgressStage};
use crate::solver::MixtureResult;
use crate::tfx::{self, LikelihoodWeights};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// One sample to deconvolve. Never mutated by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySample {
    pub id: String,
    pub vector: FeatureVector,
    pub tumor_fraction: Option<f64>,
}

impl QuerySample {
    /// Builds one query per matrix row, attaching tumor fractions by sample id.
    pub fn from_matrix(matrix: &FeatureMatrix, tumor_fractions: &HashMap<String, f64>) -> Vec<Self> {
        matrix
            .rows()
            .map(|(id, vector)| QuerySample {
                id: id.to_string(),
                tumor_fraction: tumor_fractions.get(id).copied(),
                vector,
            })
            .collect()
    }
}

/// Coarse failure category reported for every failed sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SchemaMismatch,
    UndefinedTumorFraction,
    TumorFractionBelowFloor,
    SolverDidNotConverge,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SchemaMismatch => "SchemaMismatch",
            Self::UndefinedTumorFraction => "UndefinedTumorFraction",
            Self::TumorFractionBelowFloor => "TumorFractionBelowFloor",
            Self::SolverDidNotConverge => "SolverDidNotConverge",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single sample could not be processed.
#[derive(Error, Debug)]
pub enum SampleFailure {
    #[error("Missing feature '{feature}'.")]
    SchemaMismatch { feature: String },
    #[error("Feature '{feature}' is not a finite number.")]
    NonFiniteFeature { feature: String },
    #[error("Feature vector does not match the reference: {0}")]
    Features(FeatureError),
    #[error("Tumor fraction is undefined: {reason}")]
    UndefinedTumorFraction { reason: String },
    #[error("Tumor fraction {tumor_fraction} is below the floor {floor}.")]
    TumorFractionBelowFloor { tumor_fraction: f64, floor: f64 },
    #[error(
        "Projection did not converge after {iterations} iteration(s); last residual {last_residual:.6e}."
    )]
    SolverDidNotConverge {
        iterations: usize,
        last_residual: f64,
    },
    #[error("Numerical failure during projection: {0}")]
    Numerical(#[from] LinalgError),
    #[error(transparent)]
    Classification(#[from] ClassifyError),
}

impl SampleFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SchemaMismatch { .. }
            | Self::NonFiniteFeature { .. }
            | Self::Features(_)
            | Self::Classification(_) => ErrorKind::SchemaMismatch,
            Self::UndefinedTumorFraction { .. } => ErrorKind::UndefinedTumorFraction,
            Self::TumorFractionBelowFloor { .. } => ErrorKind::TumorFractionBelowFloor,
            Self::SolverDidNotConverge { .. } | Self::Numerical(_) => {
                ErrorKind::SolverDidNotConverge
            }
        }
    }
}

impl From<FeatureError> for SampleFailure {
    fn from(err: FeatureError) -> Self {
        match err {
            FeatureError::SchemaMismatch { feature, .. } => Self::SchemaMismatch { feature },
            other => Self::Features(other),
        }
    }
}

/// Errors that prevent a batch from starting at all.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Normal phenotype '{0}' is not a vertex of the reference simplex.")]
    UnknownNormalPhenotype(String),
    #[error("Phenotype of interest '{0}' is not a vertex of the reference simplex.")]
    UnknownTargetPhenotype(String),
}

/// Everything computed for one successful sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleOutcome {
    pub sample_id: String,
    pub tumor_fraction: Option<f64>,
    pub tumor_fraction_source: TumorFractionSource,
    pub low_confidence: bool,
    pub mixture: MixtureResult,
    pub call: Option<ClassificationCall>,
    /// Likelihood read-out; `None` when disabled or the simplex has no tumor phenotype.
    pub likelihood: Option<LikelihoodWeights>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedSample {
    pub sample_id: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Results of a batch, in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub successes: Vec<SampleOutcome>,
    pub failures: Vec<FailedSample>,
}

impl BatchReport {
    pub fn len(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failure(&self, sample_id: &str) -> Option<&FailedSample> {
        self.failures.iter().find(|f| f.sample_id == sample_id)
    }

    pub fn outcome(&self, sample_id: &str) -> Option<&SampleOutcome> {
        self.successes.iter().find(|s| s.sample_id == sample_id)
    }

    /// Adds samples rejected before the batch ran, e.g. while reading input.
    pub fn add_failures(&mut self, failures: impl IntoIterator<Item = FailedSample>) {
        self.failures.extend(failures);
    }
}

pub struct Deconvolver<'a> {
    simplex: &'a ReferenceSimplex,
    config: &'a RunConfig,
    normal: SimplexVertex,
}

impl<'a> Deconvolver<'a> {
    pub fn new(simplex: &'a ReferenceSimplex, config: &'a RunConfig) -> Result<Self, PipelineError> {
        let normal = simplex
            .vertex(&config.normal_phenotype)
            .map_err(|_| PipelineError::UnknownNormalPhenotype(config.normal_phenotype.clone()))?;
        if let Some(target) = &config.classification.phenotype {
            if simplex.vertex_index(target).is_none() {
                return Err(PipelineError::UnknownTargetPhenotype(target.clone()));
            }
        }
        Ok(Self {
            simplex,
            config,
            normal,
        })
    }

    pub fn simplex(&self) -> &ReferenceSimplex {
        self.simplex
    }

    /// Aligns, corrects, projects and classifies one sample.
    pub fn run_sample(&self, sample: &QuerySample) -> Result<SampleOutcome, SampleFailure> {
        let aligned = QuerySample {
            id: sample.id.clone(),
            vector: self.simplex.prepare_query(&sample.id, &sample.vector)?,
            tumor_fraction: sample.tumor_fraction,
        };
        let corrected =
            self.config
                .tumor_fraction
                .correct_or_estimate(&aligned, &self.normal, self.simplex)?;
        let mixture = self.config.solver.project(&corrected.vector, self.simplex)?;

        let settings = &self.config.classification;
        let call = match &settings.phenotype {
            Some(target) => {
                let call = classify::classify(&mixture, target, settings.threshold())?;
                if corrected.low_confidence && settings.low_confidence_indeterminate {
                    Some(call.into_indeterminate())
                } else {
                    Some(call)
                }
            }
            None => None,
        };
        let likelihood = if self.config.likelihood_weights {
            self.likelihood_weights(&aligned, corrected.tumor_fraction)
        } else {
            None
        };

        log::debug!(
            "Sample '{}': dominant {} (residual {:.4e})",
            sample.id,
            mixture.dominant(),
            mixture.residual
        );
        Ok(SampleOutcome {
            sample_id: sample.id.clone(),
            tumor_fraction: corrected.tumor_fraction,
            tumor_fraction_source: corrected.source,
            low_confidence: corrected.low_confidence,
            mixture,
            call,
            likelihood,
        })
    }

    /// Scores the uncorrected sample against each tumor phenotype at the fraction
    /// used for correction, estimating one when the sample went uncorrected.
    fn likelihood_weights(
        &self,
        aligned: &QuerySample,
        tumor_fraction: Option<f64>,
    ) -> Option<LikelihoodWeights> {
        if self.simplex.k() < 2 {
            return None;
        }
        let normal = &self.config.normal_phenotype;
        let result = match tumor_fraction {
            Some(t) => Ok(t),
            None => tfx::estimate_tumor_fraction(
                &aligned.vector,
                self.simplex,
                normal,
                self.config.tumor_fraction.grid_step,
            )
            .map(|estimate| estimate.tumor_fraction),
        }
        .and_then(|t| tfx::likelihood_weights(&aligned.vector, self.simplex, normal, t));
        match result {
            Ok(weights) => Some(weights),
            Err(err) => {
                log::debug!("Sample '{}': no likelihood weights: {err}", aligned.id);
                None
            }
        }
    }

    /// Runs every sample in parallel; failures are collected, never propagated.
    pub fn run_batch(
        &self,
        samples: &[QuerySample],
        progress: &dyn BatchProgressObserver,
    ) -> BatchReport {
        let stage = BatchProgressStage::Deconvolution;
        progress.on_stage_start(stage, samples.len());
        log::info!(
            "Deconvolving {} sample(s) against {} phenotype(s)",
            samples.len(),
            self.simplex.k()
        );

        let results: Vec<Result<SampleOutcome, FailedSample>> = samples
            .par_iter()
            .map(|sample| {
                let result = self.run_sample(sample).map_err(|err| FailedSample {
                    sample_id: sample.id.clone(),
                    kind: err.kind(),
                    message: err.to_string(),
                });
                progress.on_sample_done(stage, &sample.id, result.is_ok());
                result
            })
            .collect();

        let mut report = BatchReport::default();
        for result in results {
            match result {
                Ok(outcome) => report.successes.push(outcome),
                Err(failure) => {
                    log::warn!(
                        "Sample '{}' failed ({}): {}",
                        failure.sample_id,
                        failure.kind,
                        failure.message
                    );
                    report.failures.push(failure);
                }
            }
        }
        progress.on_stage_finish(stage);
        log::info!(
            "Deconvolution finished: {} succeeded, {} failed",
            report.successes.len(),
            report.failures.len()
        );
        report
    }
}
