//! # Simplex projection
//!
//! Finds the convex combination of reference vertices closest to a query
//! vector, i.e. minimizes `‖Vᵀw − x‖²` subject to `w ≥ 0` and `Σw = 1`.
//!
//! The solver is a primal active-set method that works entirely on the
//! `k × k` Gram matrix `G = V Vᵀ` and the vector `c = V x`, so its cost per
//! iteration does not depend on the number of features. Each active-set
//! subproblem is an equality-constrained least-squares problem; one weight is
//! eliminated through the sum-to-one constraint and the remaining system is
//! solved with a symmetric pseudo-inverse.
//!
//! When the vertices are affinely dependent the optimal weights are not
//! unique. In that case the solver returns the minimum-norm solution of the
//! reduced problem reached from the nearest vertex, which is deterministic for
//! fixed inputs but is only one of the equally good mixtures.

use crate::basis::ReferenceSimplex;
use crate::features::FeatureVector;
use crate::linalg::pinv_solve_symmetric;
use crate::pipeline::SampleFailure;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// Relative eigenvalue cutoff for the reduced Gram pseudo-inverse.
const PINV_RELATIVE_TOLERANCE: f64 = 1e-12;

/// Mixture weights for one query, in vertex order.
#[derive(Debug, Clone, PartialEq)]
pub struct MixtureResult {
    pub weights: Vec<(String, f64)>,
    /// Euclidean distance between the query and the reconstructed mixture.
    pub residual: f64,
    /// Number of active-set subproblems solved.
    pub iterations: usize,
}

impl MixtureResult {
    pub fn weight(&self, phenotype: &str) -> Option<f64> {
        self.weights
            .iter()
            .find(|(label, _)| label == phenotype)
            .map(|(_, w)| *w)
    }

    /// Phenotype with the largest weight; the earliest vertex wins ties.
    pub fn dominant(&self) -> &str {
        let mut best: Option<&(String, f64)> = None;
        for entry in &self.weights {
            if best.is_none_or(|b| entry.1 > b.1) {
                best = Some(entry);
            }
        }
        best.map(|(label, _)| label.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimplexSolver {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for SimplexSolver {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-10,
        }
    }
}

impl SimplexSolver {
    pub fn new(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            tolerance,
        }
    }

    /// Projects `vector` onto `simplex`.
    ///
    /// The vector must already be aligned to the simplex features (see
    /// [`ReferenceSimplex::prepare_query`]).
    pub fn project(
        &self,
        vector: &FeatureVector,
        simplex: &ReferenceSimplex,
    ) -> Result<MixtureResult, SampleFailure> {
        vector.ensure_same_features("query", simplex.features())?;
        if let Some(j) = vector.values().iter().position(|v| !v.is_finite()) {
            return Err(SampleFailure::NonFiniteFeature {
                feature: simplex.features()[j].clone(),
            });
        }

        let vertices = simplex.vertices();
        let x = vector.values();
        let (weights, iterations) = self.solve_weights(vertices, x)?;
        let residual = reconstruction_residual(vertices, x, &weights);

        log::debug!("Projection converged after {iterations} iteration(s), residual {residual:.6e}");
        Ok(MixtureResult {
            weights: simplex
                .phenotypes()
                .iter()
                .cloned()
                .zip(weights.iter().copied())
                .collect(),
            residual,
            iterations,
        })
    }

    fn solve_weights(
        &self,
        vertices: &Array2<f64>,
        x: ArrayView1<f64>,
    ) -> Result<(Array1<f64>, usize), SampleFailure> {
        let k = vertices.nrows();
        let gram = vertices.dot(&vertices.t());
        let c = vertices.dot(&x);
        let xx = x.dot(&x);

        // Squared distance of every vertex to the query.
        let distances = Array1::from_shape_fn(k, |i| gram[[i, i]] - 2.0 * c[i] + xx);
        let mut start = 0;
        for i in 1..k {
            if distances[i] < distances[start] {
                start = i;
            }
        }

        let mut w = Array1::<f64>::zeros(k);
        w[start] = 1.0;
        if k == 1 {
            return Ok((w, 0));
        }

        let tol = self.tolerance;
        let gradient_tol = tol * gram.diag().iter().fold(1.0_f64, |acc, &g| acc.max(g.abs()));
        let mut passive = vec![start];
        let mut excluded = vec![false; k];
        let mut iterations = 0;

        loop {
            // Optimality: every inactive vertex must not decrease the objective.
            let gradient = 2.0 * (gram.dot(&w) - &c);
            let multiplier =
                passive.iter().map(|&j| gradient[j]).sum::<f64>() / passive.len() as f64;
            let mut entering: Option<usize> = None;
            for j in 0..k {
                if passive.contains(&j) || excluded[j] {
                    continue;
                }
                let reduced = gradient[j] - multiplier;
                if reduced < -gradient_tol
                    && entering.is_none_or(|e| reduced < gradient[e] - multiplier)
                {
                    entering = Some(j);
                }
            }
            let Some(entering) = entering else {
                break;
            };
            passive.push(entering);

            // Inner loop: move toward the subproblem optimum while staying feasible.
            loop {
                if iterations >= self.max_iterations {
                    return Err(SampleFailure::SolverDidNotConverge {
                        iterations,
                        last_residual: reconstruction_residual(vertices, x, &w),
                    });
                }
                iterations += 1;

                let z = solve_subproblem(&gram, &c, &passive, k)?;
                if passive.iter().all(|&j| z[j] > tol) {
                    w = z;
                    excluded.iter_mut().for_each(|e| *e = false);
                    break;
                }

                let mut alpha = 1.0_f64;
                for &j in &passive {
                    if z[j] <= tol {
                        let step = if w[j] > z[j] { w[j] / (w[j] - z[j]) } else { 0.0 };
                        alpha = alpha.min(step);
                    }
                }
                let alpha = alpha.clamp(0.0, 1.0);
                w = &w + &(alpha * (&z - &w));
                let before = passive.len();
                passive.retain(|&j| w[j] > tol);
                for j in 0..k {
                    if !passive.contains(&j) {
                        w[j] = 0.0;
                    }
                }
                if passive.is_empty() {
                    // Numerically impossible for a feasible point; restart from the start vertex.
                    w.fill(0.0);
                    w[start] = 1.0;
                    passive.push(start);
                }
                if alpha == 0.0 && passive.len() < before && !passive.contains(&entering) {
                    // The entering vertex could not take any weight.
                    excluded[entering] = true;
                    break;
                }
            }
        }

        Ok((normalize(w), iterations))
    }
}

/// Minimizes the objective over mixtures supported on `passive`.
fn solve_subproblem(
    gram: &Array2<f64>,
    c: &Array1<f64>,
    passive: &[usize],
    k: usize,
) -> Result<Array1<f64>, SampleFailure> {
    let mut z = Array1::zeros(k);
    let (&last, free) = passive
        .split_last()
        .ok_or(SampleFailure::SolverDidNotConverge {
            iterations: 0,
            last_residual: f64::NAN,
        })?;
    if free.is_empty() {
        z[last] = 1.0;
        return Ok(z);
    }

    let m = free.len();
    let reduced = Array2::from_shape_fn((m, m), |(a, b)| {
        let (i, j) = (free[a], free[b]);
        gram[[i, j]] - gram[[i, last]] - gram[[last, j]] + gram[[last, last]]
    });
    let rhs = Array1::from_shape_fn(m, |a| {
        let i = free[a];
        c[i] - gram[[i, last]] - c[last] + gram[[last, last]]
    });
    let y = pinv_solve_symmetric(&reduced, &rhs, PINV_RELATIVE_TOLERANCE)?;

    for (a, &i) in free.iter().enumerate() {
        z[i] = y[a];
    }
    z[last] = 1.0 - y.sum();
    Ok(z)
}

fn reconstruction_residual(vertices: &Array2<f64>, x: ArrayView1<f64>, w: &Array1<f64>) -> f64 {
    let mixture = vertices.t().dot(w);
    let diff = &mixture - &x;
    diff.dot(&diff).sqrt()
}

/// Clears round-off below zero and rescales to sum to one.
fn normalize(mut w: Array1<f64>) -> Array1<f64> {
    w.mapv_inplace(|v| v.max(0.0));
    let total = w.sum();
    if total > 0.0 {
        w /= total;
    }
    w
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::AggregateMethod;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn simplex(labels: &[&str], vertices: Array2<f64>) -> ReferenceSimplex {
        let features = (0..vertices.ncols()).map(|j| format!("f{j}")).collect();
        let sizes = vec![1; labels.len()];
        ReferenceSimplex::from_parts(
            features,
            labels.iter().map(|s| s.to_string()).collect(),
            vertices,
            sizes,
            AggregateMethod::Median,
            None,
        )
        .unwrap()
    }

    fn query(simplex: &ReferenceSimplex, values: &[f64]) -> FeatureVector {
        FeatureVector::new(
            simplex.features().clone(),
            Array1::from_vec(values.to_vec()),
        )
        .unwrap()
    }

    fn triangle() -> ReferenceSimplex {
        simplex(
            &["Normal", "Tumor", "Third"],
            array![[0.0, 0.0], [10.0, 0.0], [0.0, 10.0]],
        )
    }

    #[test]
    fn vertex_query_gets_all_weight() {
        let s = simplex(&["Normal", "Tumor"], array![[0.0, 0.0], [10.0, 0.0]]);
        let result = SimplexSolver::default().project(&query(&s, &[10.0, 0.0]), &s).unwrap();
        assert_abs_diff_eq!(result.weight("Normal").unwrap(), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(result.weight("Tumor").unwrap(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(result.residual, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn midpoint_splits_evenly() {
        let s = simplex(&["Normal", "Tumor"], array![[0.0, 0.0], [10.0, 0.0]]);
        let result = SimplexSolver::default().project(&query(&s, &[5.0, 0.0]), &s).unwrap();
        assert_abs_diff_eq!(result.weight("Normal").unwrap(), 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(result.weight("Tumor").unwrap(), 0.5, epsilon = 1e-9);
    }

    #[test]
    fn point_on_an_edge_leaves_the_opposite_vertex_empty() {
        let s = triangle();
        let result = SimplexSolver::default().project(&query(&s, &[5.0, 5.0]), &s).unwrap();
        assert_abs_diff_eq!(result.weight("Normal").unwrap(), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(result.weight("Tumor").unwrap(), 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(result.weight("Third").unwrap(), 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(result.residual, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn outside_point_projects_onto_nearest_edge() {
        let s = triangle();
        let result = SimplexSolver::default().project(&query(&s, &[8.0, 8.0]), &s).unwrap();
        assert_abs_diff_eq!(result.weight("Normal").unwrap(), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(result.weight("Tumor").unwrap(), 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(result.weight("Third").unwrap(), 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(result.residual, 18.0_f64.sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn interior_point_uses_all_vertices() {
        let s = triangle();
        let result = SimplexSolver::default().project(&query(&s, &[2.0, 3.0]), &s).unwrap();
        assert_abs_diff_eq!(result.weight("Normal").unwrap(), 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(result.weight("Tumor").unwrap(), 0.2, epsilon = 1e-9);
        assert_abs_diff_eq!(result.weight("Third").unwrap(), 0.3, epsilon = 1e-9);
        assert_eq!(result.dominant(), "Normal");
    }

    #[test]
    fn single_vertex_reports_distance() {
        let s = simplex(&["Only"], array![[1.0, 1.0]]);
        let result = SimplexSolver::default().project(&query(&s, &[4.0, 5.0]), &s).unwrap();
        assert_eq!(result.weights, vec![("Only".to_string(), 1.0)]);
        assert_abs_diff_eq!(result.residual, 5.0, epsilon = 1e-12);
    }

    #[test]
    fn collinear_simplex_is_deterministic() {
        let s = simplex(&["A", "B", "C"], array![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]]);
        let q = query(&s, &[1.5, 1.5]);
        let first = SimplexSolver::default().project(&q, &s).unwrap();
        let second = SimplexSolver::default().project(&q, &s).unwrap();
        assert_eq!(first, second);
        assert_abs_diff_eq!(first.residual, 0.0, epsilon = 1e-9);
        let total: f64 = first.weights.iter().map(|(_, w)| w).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn random_queries_stay_on_the_simplex() {
        let mut rng = StdRng::seed_from_u64(7);
        let vertices = Array2::from_shape_fn((4, 6), |_| rng.gen_range(-5.0..5.0));
        let s = simplex(&["A", "B", "C", "D"], vertices);
        let solver = SimplexSolver::default();
        for _ in 0..200 {
            let values: Vec<f64> = (0..6).map(|_| rng.gen_range(-10.0..10.0)).collect();
            let q = query(&s, &values);
            let result = solver.project(&q, &s).unwrap();
            let total: f64 = result.weights.iter().map(|(_, w)| w).sum();
            assert!(result.weights.iter().all(|(_, w)| *w >= 0.0));
            assert_abs_diff_eq!(total, 1.0, epsilon = 1e-9);
            assert_eq!(solver.project(&q, &s).unwrap(), result);

            // No vertex is closer than the projected mixture.
            for row in s.vertices().rows() {
                let diff = &row - &q.values();
                assert!(result.residual <= diff.dot(&diff).sqrt() + 1e-9);
            }
        }
    }

    #[test]
    fn mismatched_features_are_rejected() {
        let s = triangle();
        let wrong = FeatureVector::from_pairs([("f0", 1.0), ("other", 2.0)]).unwrap();
        assert!(matches!(
            SimplexSolver::default().project(&wrong, &s),
            Err(SampleFailure::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn exhausted_budget_reports_non_convergence() {
        let s = triangle();
        let solver = SimplexSolver::new(1, 1e-10);
        match solver.project(&query(&s, &[2.0, 3.0]), &s) {
            Err(SampleFailure::SolverDidNotConverge { iterations, .. }) => assert_eq!(iterations, 1),
            other => panic!("expected non-convergence, got {other:?}"),
        }
    }
}
