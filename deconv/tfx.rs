//! Tumor-fraction estimation from the reference simplex alone.
//!
//! For each candidate fraction `t` on a uniform grid, the observed vector is
//! scored against the mixtures `t·μ_p + (1 − t)·μ_normal` of every non-normal
//! phenotype `p` under an isotropic unit-variance Gaussian. The fraction with
//! the largest combined likelihood (log-sum-exp over phenotypes) wins.
//!
//! The same per-phenotype likelihoods, evaluated at one fixed fraction and
//! passed through a softmax, give [`LikelihoodWeights`]: a second, purely
//! probabilistic read-out next to the geometric simplex projection.

use crate::basis::ReferenceSimplex;
use crate::features::{FeatureError, FeatureVector};
use ndarray::{ArrayView1, ArrayView2};
use std::f64::consts::PI;
use thiserror::Error;

pub const DEFAULT_GRID_STEP: f64 = 0.001;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EstimateError {
    #[error("Normal phenotype '{0}' is not part of the reference simplex.")]
    UnknownPhenotype(String),
    #[error("The reference simplex has no phenotype besides '{0}'.")]
    NoTumorPhenotypes(String),
    #[error("Grid step must lie in (0, 1], got {0}.")]
    InvalidStep(f64),
    #[error("Tumor fraction must lie in [0, 1], got {0}.")]
    InvalidTumorFraction(f64),
    #[error(transparent)]
    Schema(#[from] FeatureError),
}

/// Result of the grid search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TumorFractionEstimate {
    pub tumor_fraction: f64,
    pub log_likelihood: f64,
}

/// Grid-searches `t ∈ [0, 1]` for the fraction best explaining `observed`.
///
/// `observed` must already be aligned to the simplex features. Ties keep the
/// smaller fraction.
pub fn estimate_tumor_fraction(
    observed: &FeatureVector,
    simplex: &ReferenceSimplex,
    normal_label: &str,
    step: f64,
) -> Result<TumorFractionEstimate, EstimateError> {
    if !(step > 0.0 && step <= 1.0) {
        return Err(EstimateError::InvalidStep(step));
    }
    let normal_index = check_inputs(observed, simplex, normal_label)?;
    let vertices = simplex.vertices();
    let x = observed.values();
    let steps = (1.0 / step).round() as usize;

    let mut best = TumorFractionEstimate {
        tumor_fraction: 0.0,
        log_likelihood: f64::NEG_INFINITY,
    };
    let mut scores = Vec::with_capacity(simplex.k() - 1);
    for s in 0..=steps {
        let t = (s as f64 * step).min(1.0);
        scores.clear();
        mixture_log_likelihoods(x, vertices.view(), normal_index, t, |_, ll| scores.push(ll));
        let ll = log_sum_exp(&scores);
        if ll > best.log_likelihood {
            best = TumorFractionEstimate {
                tumor_fraction: t,
                log_likelihood: ll,
            };
        }
    }

    log::debug!(
        "Estimated tumor fraction {:.3} (log-likelihood {:.4e})",
        best.tumor_fraction,
        best.log_likelihood
    );
    Ok(best)
}

/// Softmax weights of the non-normal phenotypes at one tumor fraction.
#[derive(Debug, Clone, PartialEq)]
pub struct LikelihoodWeights {
    pub tumor_fraction: f64,
    /// `(phenotype, log-likelihood)` in simplex order, normal phenotype excluded.
    pub log_likelihoods: Vec<(String, f64)>,
    /// Softmax of `log_likelihoods`; all zero when no likelihood is finite.
    pub weights: Vec<(String, f64)>,
    /// Phenotype with the largest weight, `None` when there is no solution.
    pub prediction: Option<String>,
}

impl LikelihoodWeights {
    pub fn weight(&self, phenotype: &str) -> Option<f64> {
        self.weights
            .iter()
            .find(|(name, _)| name == phenotype)
            .map(|(_, w)| *w)
    }
}

/// Gaussian log-likelihood of `observed` under each `t·μ_p + (1 − t)·μ_normal`.
pub fn phenotype_log_likelihoods(
    observed: &FeatureVector,
    simplex: &ReferenceSimplex,
    normal_label: &str,
    tumor_fraction: f64,
) -> Result<Vec<(String, f64)>, EstimateError> {
    if !(0.0..=1.0).contains(&tumor_fraction) {
        return Err(EstimateError::InvalidTumorFraction(tumor_fraction));
    }
    let normal_index = check_inputs(observed, simplex, normal_label)?;
    let mut out = Vec::with_capacity(simplex.k() - 1);
    mixture_log_likelihoods(
        observed.values(),
        simplex.vertices().view(),
        normal_index,
        tumor_fraction,
        |p, ll| out.push((simplex.phenotypes()[p].clone(), ll)),
    );
    Ok(out)
}

/// Turns the phenotype likelihoods at `tumor_fraction` into softmax weights.
pub fn likelihood_weights(
    observed: &FeatureVector,
    simplex: &ReferenceSimplex,
    normal_label: &str,
    tumor_fraction: f64,
) -> Result<LikelihoodWeights, EstimateError> {
    let log_likelihoods =
        phenotype_log_likelihoods(observed, simplex, normal_label, tumor_fraction)?;
    let values: Vec<f64> = log_likelihoods.iter().map(|(_, ll)| *ll).collect();
    let probabilities = softmax(&values);

    let mut prediction: Option<(usize, f64)> = None;
    for (i, &w) in probabilities.iter().enumerate() {
        if w > prediction.map_or(0.0, |(_, best)| best) {
            prediction = Some((i, w));
        }
    }
    let weights = log_likelihoods
        .iter()
        .zip(&probabilities)
        .map(|((name, _), &w)| (name.clone(), w))
        .collect();
    Ok(LikelihoodWeights {
        tumor_fraction,
        prediction: prediction.map(|(i, _)| log_likelihoods[i].0.clone()),
        log_likelihoods,
        weights,
    })
}

fn check_inputs(
    observed: &FeatureVector,
    simplex: &ReferenceSimplex,
    normal_label: &str,
) -> Result<usize, EstimateError> {
    observed.ensure_same_features("query", simplex.features())?;
    let normal_index = simplex
        .vertex_index(normal_label)
        .ok_or_else(|| EstimateError::UnknownPhenotype(normal_label.to_string()))?;
    if simplex.k() < 2 {
        return Err(EstimateError::NoTumorPhenotypes(normal_label.to_string()));
    }
    Ok(normal_index)
}

/// Calls `emit(p, log_likelihood)` for every non-normal vertex `p`.
fn mixture_log_likelihoods(
    x: ArrayView1<f64>,
    vertices: ArrayView2<f64>,
    normal_index: usize,
    t: f64,
    mut emit: impl FnMut(usize, f64),
) {
    let normal = vertices.row(normal_index);
    let log_norm = -0.5 * x.len() as f64 * (2.0 * PI).ln();
    for (p, vertex) in vertices.rows().into_iter().enumerate() {
        if p == normal_index {
            continue;
        }
        let mut sq = 0.0;
        for ((&xi, &mi), &ni) in x.iter().zip(vertex.iter()).zip(normal.iter()) {
            let diff = xi - (t * mi + (1.0 - t) * ni);
            sq += diff * diff;
        }
        emit(p, log_norm - 0.5 * sq);
    }
}

fn softmax(values: &[f64]) -> Vec<f64> {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return vec![0.0; values.len()];
    }
    let exps: Vec<f64> = values.iter().map(|v| (v - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::AggregateMethod;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};

    fn two_vertex() -> ReferenceSimplex {
        ReferenceSimplex::from_parts(
            vec!["f0".into(), "f1".into()],
            vec!["Healthy".into(), "Tumor".into()],
            array![[0.0, 0.0], [10.0, 0.0]],
            vec![3, 3],
            AggregateMethod::Median,
            None,
        )
        .unwrap()
    }

    fn observed(simplex: &ReferenceSimplex, values: [f64; 2]) -> FeatureVector {
        FeatureVector::new(simplex.features().clone(), Array1::from_vec(values.to_vec())).unwrap()
    }

    #[test]
    fn recovers_the_mixing_fraction() {
        let s = two_vertex();
        let est = estimate_tumor_fraction(&observed(&s, [2.5, 0.0]), &s, "Healthy", 0.001).unwrap();
        assert_abs_diff_eq!(est.tumor_fraction, 0.25, epsilon = 1e-9);
    }

    #[test]
    fn normal_sample_estimates_zero() {
        let s = two_vertex();
        let est = estimate_tumor_fraction(&observed(&s, [-3.0, 1.0]), &s, "Healthy", 0.01).unwrap();
        assert_eq!(est.tumor_fraction, 0.0);
    }

    #[test]
    fn rejects_unknown_normal_and_bad_step() {
        let s = two_vertex();
        let v = observed(&s, [1.0, 0.0]);
        assert_eq!(
            estimate_tumor_fraction(&v, &s, "Normal", 0.01).unwrap_err(),
            EstimateError::UnknownPhenotype("Normal".into())
        );
        assert_eq!(
            estimate_tumor_fraction(&v, &s, "Healthy", 0.0).unwrap_err(),
            EstimateError::InvalidStep(0.0)
        );
    }

    fn three_vertex() -> ReferenceSimplex {
        ReferenceSimplex::from_parts(
            vec!["f0".into(), "f1".into()],
            vec!["Healthy".into(), "Tumor".into(), "Other".into()],
            array![[0.0, 0.0], [10.0, 0.0], [0.0, 10.0]],
            vec![3, 3, 3],
            AggregateMethod::Median,
            None,
        )
        .unwrap()
    }

    #[test]
    fn mixing_line_sample_weighs_toward_its_phenotype() {
        let s = three_vertex();
        let v = observed(&s, [3.0, 0.2]);
        let est = estimate_tumor_fraction(&v, &s, "Healthy", 0.001).unwrap();
        assert_abs_diff_eq!(est.tumor_fraction, 0.3, epsilon = 0.01);

        let lw = likelihood_weights(&v, &s, "Healthy", est.tumor_fraction).unwrap();
        assert_eq!(
            lw.weights.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec!["Tumor", "Other"]
        );
        assert!(lw.weight("Tumor").unwrap() > 0.99);
        assert_abs_diff_eq!(
            lw.weights.iter().map(|(_, w)| w).sum::<f64>(),
            1.0,
            epsilon = 1e-12
        );
        assert_eq!(lw.prediction.as_deref(), Some("Tumor"));
        assert!(lw.weight("Healthy").is_none());
    }

    #[test]
    fn log_likelihoods_are_gaussian_log_densities() {
        let s = two_vertex();
        let lls = phenotype_log_likelihoods(&observed(&s, [5.0, 1.0]), &s, "Healthy", 0.5).unwrap();
        // Mixture mean (5, 0); squared distance 1 in two dimensions.
        assert_abs_diff_eq!(lls[0].1, -(2.0 * PI).ln() - 0.5, epsilon = 1e-12);
        assert_eq!(
            phenotype_log_likelihoods(&observed(&s, [5.0, 1.0]), &s, "Healthy", 1.5).unwrap_err(),
            EstimateError::InvalidTumorFraction(1.5)
        );
    }

    #[test]
    fn softmax_without_finite_values_has_no_solution() {
        assert_eq!(softmax(&[f64::NEG_INFINITY, f64::NEG_INFINITY]), vec![0.0, 0.0]);
        let w = softmax(&[0.0, 0.0]);
        assert_eq!(w, vec![0.5, 0.5]);
    }

    #[test]
    fn log_sum_exp_is_stable_for_large_magnitudes() {
        let v = log_sum_exp(&[-1000.0, -1000.0]);
        assert_abs_diff_eq!(v, -1000.0 + 2.0_f64.ln(), epsilon = 1e-9);
    }
}
