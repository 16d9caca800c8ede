//! Simplex geometry: affine rank, volume, and maximal-volume feature selection.

use crate::basis::{AggregateMethod, BasisError, cohort_matrix};
use crate::cohort::ReferenceCohort;
use crate::linalg::{FaerEigh, LinalgError};
use faer::Side;
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use std::sync::Arc;

/// Relative eigenvalue cutoff used when counting the affine rank.
const RANK_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq)]
pub struct SimplexGeometry {
    /// Dimension of the affine hull spanned by the vertices.
    pub affine_rank: usize,
    /// `(k-1)`-dimensional volume of the simplex; zero when degenerate.
    pub volume: f64,
    /// Smallest over largest eigenvalue of the edge Gram matrix (1 for k <= 2 non-degenerate).
    pub condition: f64,
}

/// Computes the geometry of the simplex whose vertices are the rows of `vertices`.
pub fn simplex_geometry(vertices: ArrayView2<f64>) -> Result<SimplexGeometry, LinalgError> {
    let k = vertices.nrows();
    if k <= 1 {
        return Ok(SimplexGeometry {
            affine_rank: 0,
            volume: 0.0,
            condition: 1.0,
        });
    }

    let edges = edge_matrix(vertices);
    let gram = edges.dot(&edges.t());
    let (eigenvalues, _) = gram.eigh(Side::Lower)?;
    let max_eig = eigenvalues.iter().fold(0.0_f64, |acc, &v| acc.max(v));
    let min_eig = eigenvalues
        .iter()
        .fold(f64::INFINITY, |acc, &v| acc.min(v))
        .max(0.0);

    let affine_rank = if max_eig > 0.0 {
        eigenvalues
            .iter()
            .filter(|&&v| v > max_eig * RANK_TOLERANCE)
            .count()
    } else {
        0
    };
    let condition = if max_eig > 0.0 { min_eig / max_eig } else { 0.0 };

    let volume = if affine_rank < k - 1 {
        0.0
    } else {
        let log_det: f64 = eigenvalues.iter().map(|&v| v.max(0.0).ln()).sum();
        let log_factorial: f64 = (1..k).map(|i| (i as f64).ln()).sum();
        (0.5 * log_det - log_factorial).exp()
    };

    Ok(SimplexGeometry {
        affine_rank,
        volume,
        condition,
    })
}

/// Rows `v_i - v_0` for `i = 1..k`.
fn edge_matrix(vertices: ArrayView2<f64>) -> Array2<f64> {
    let origin = vertices.row(0);
    let mut edges = vertices.slice(ndarray::s![1.., ..]).to_owned();
    for mut row in edges.axis_iter_mut(Axis(0)) {
        row -= &origin;
    }
    edges
}

/// Scores a feature subset by simplex volume relative to within-cohort spread.
///
/// The volume of the aggregated vertices is divided by the summed, per-vertex
/// product of edge spreads, then by the ratio of the longest to the shortest
/// vertex distance so that irregular simplices score lower. An edge's spread is
/// the cohort-averaged variance of the members projected onto the unnormalized
/// edge vector, so it scales with the squared edge length.
fn subset_objective(
    member_matrices: &[Array2<f64>],
    columns: &[usize],
    aggregate: AggregateMethod,
) -> f64 {
    let k = member_matrices.len();
    let restricted: Vec<Array2<f64>> = member_matrices
        .iter()
        .map(|m| m.select(Axis(1), columns))
        .collect();
    let mut vertices = Array2::zeros((k, columns.len()));
    for (i, m) in restricted.iter().enumerate() {
        vertices.row_mut(i).assign(&aggregate.aggregate(m.view()));
    }

    let volume = match simplex_geometry(vertices.view()) {
        Ok(geom) => geom.volume,
        Err(_) => return 0.0,
    };
    if !(volume > 0.0) {
        return 0.0;
    }

    let mut edge_spread = Array2::<f64>::zeros((k, k));
    let mut min_dist = f64::INFINITY;
    let mut max_dist = 0.0_f64;
    for i in 0..k {
        for j in (i + 1)..k {
            let edge: Array1<f64> = &vertices.row(j) - &vertices.row(i);
            let length = edge.dot(&edge).sqrt();
            min_dist = min_dist.min(length);
            max_dist = max_dist.max(length);
            if length == 0.0 {
                return 0.0;
            }
            let spread = restricted
                .iter()
                .map(|m| projected_variance(m.view(), &edge))
                .sum::<f64>()
                / k as f64;
            edge_spread[[i, j]] = spread;
            edge_spread[[j, i]] = spread;
        }
    }

    let spread_volume: f64 = (0..k)
        .map(|i| {
            (0..k)
                .filter(|&j| j != i)
                .map(|j| edge_spread[[i, j]])
                .product::<f64>()
        })
        .sum();
    let irregularity = max_dist / min_dist;
    volume / (spread_volume + f64::EPSILON) / irregularity
}

/// Population variance of the members projected onto the unnormalized `edge`.
fn projected_variance(members: ArrayView2<f64>, edge: &Array1<f64>) -> f64 {
    let n = members.nrows();
    if n < 2 {
        return 0.0;
    }
    let projections = members.dot(edge);
    let mean = projections.sum() / n as f64;
    projections.mapv(|p| (p - mean).powi(2)).sum() / n as f64
}

/// Picks the feature subset that maximizes the weighted simplex volume.
///
/// All subsets of size `k - 1` are scored exhaustively; features are then added
/// greedily while the objective strictly increases. Ties keep the earlier
/// candidate, so the result is deterministic. The returned names follow the
/// order of `candidates`.
pub fn select_features_max_volume(
    cohorts: &[ReferenceCohort],
    candidates: &[String],
    aggregate: AggregateMethod,
) -> Result<Vec<String>, BasisError> {
    let k = cohorts.len();
    if k < 2 {
        return Err(BasisError::NoCohorts);
    }
    if candidates.len() < k - 1 {
        return Err(BasisError::TooFewFeatures {
            cohorts: k,
            needed: k - 1,
            found: candidates.len(),
        });
    }
    let names: Arc<[String]> = candidates.to_vec().into();
    let member_matrices = cohorts
        .iter()
        .map(|c| cohort_matrix(c, &names))
        .collect::<Result<Vec<_>, _>>()?;

    log::info!(
        "Running maximal simplex volume feature selection over {} features for {} classes",
        candidates.len(),
        k
    );

    let seed = (0..candidates.len())
        .combinations(k - 1)
        .enumerate()
        .par_bridge()
        .map(|(order, subset)| {
            let value = subset_objective(&member_matrices, &subset, aggregate);
            (order, value, subset)
        })
        .reduce_with(|a, b| {
            if b.1 > a.1 || (b.1 == a.1 && b.0 < a.0) {
                b
            } else {
                a
            }
        });
    let Some((_, mut best_value, mut selected)) = seed else {
        return Ok(Vec::new());
    };
    log::debug!(
        "Initial subset {:?} scores {best_value:.6e}",
        selected.iter().map(|&j| &candidates[j]).collect::<Vec<_>>()
    );

    loop {
        let mut improved: Option<(usize, f64)> = None;
        for candidate in 0..candidates.len() {
            if selected.contains(&candidate) {
                continue;
            }
            let mut trial = selected.clone();
            trial.push(candidate);
            let value = subset_objective(&member_matrices, &trial, aggregate);
            let current_best = improved.map_or(best_value, |(_, v)| v);
            if value > current_best {
                improved = Some((candidate, value));
            }
        }
        match improved {
            Some((candidate, value)) => {
                log::debug!("Adding feature '{}' ({value:.6e})", candidates[candidate]);
                selected.push(candidate);
                best_value = value;
            }
            None => break,
        }
    }

    selected.sort_unstable();
    log::info!(
        "Selected {} features, weighted simplex volume {best_value:.6e}",
        selected.len()
    );
    Ok(selected.into_iter().map(|j| candidates[j].clone()).collect())
}
