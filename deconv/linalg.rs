//! Thin bridge between `ndarray` containers and `faer` decompositions.
//!
//! Only the symmetric pieces needed by the simplex code live here: the
//! eigendecomposition of small Gram matrices and the pseudo-inverse solve built
//! on top of it.

use faer::diag::DiagRef;
use faer::linalg::solvers;
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("Matrix must be square, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("Right-hand side has length {found}, expected {expected}")]
    RhsLength { found: usize, expected: usize },
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

/// Zero-copy view of a standard- or Fortran-layout `ndarray` matrix as a faer matrix.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let storage = match array.as_slice_memory_order() {
            Some(slice) if array.is_standard_layout() => FaerStorage::Borrowed(
                MatRef::from_row_major_slice(slice, array.nrows(), array.ncols()),
            ),
            Some(slice) if array.t().is_standard_layout() => FaerStorage::Borrowed(
                MatRef::from_column_major_slice(slice, array.nrows(), array.ncols()),
            ),
            _ => {
                let (rows, cols) = array.dim();
                FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
            }
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        match &self.storage {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

pub trait FaerEigh {
    /// Eigenvalues (ascending) and eigenvectors (columns) of a symmetric matrix.
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), LinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), LinalgError> {
        if self.nrows() != self.ncols() {
            return Err(LinalgError::NotSquare {
                rows: self.nrows(),
                cols: self.ncols(),
            });
        }
        let faer_view = FaerArrayView::new(self);
        let eigen = faer_view
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(LinalgError::SelfAdjointEigen)?;
        let values = diag_to_array(eigen.S());
        let vectors = mat_to_array(eigen.U());
        Ok((values, vectors))
    }
}

/// Minimum-norm solution of `G y = r` for symmetric positive semi-definite `G`.
///
/// Eigenvalues below `rel_tol * max_eigenvalue` are treated as zero, which makes
/// the result the Moore-Penrose solution when `G` is singular.
pub fn pinv_solve_symmetric(
    gram: &Array2<f64>,
    rhs: &Array1<f64>,
    rel_tol: f64,
) -> Result<Array1<f64>, LinalgError> {
    let n = gram.nrows();
    if rhs.len() != n {
        return Err(LinalgError::RhsLength {
            found: rhs.len(),
            expected: n,
        });
    }
    if n == 0 {
        return Ok(Array1::zeros(0));
    }
    let (values, vectors) = gram.eigh(Side::Lower)?;
    let max_eig = values.iter().fold(0.0_f64, |acc, &v| acc.max(v.abs()));
    let cutoff = (max_eig * rel_tol).max(f64::MIN_POSITIVE);

    let mut solution = Array1::zeros(n);
    for (idx, &lambda) in values.iter().enumerate() {
        if lambda <= cutoff {
            continue;
        }
        let u = vectors.column(idx);
        let coef = u.dot(rhs) / lambda;
        solution.scaled_add(coef, &u);
    }
    Ok(solution)
}
