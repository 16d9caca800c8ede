//! # Feature vectors and matrices
//!
//! Every vector compared within one run shares the same ordered list of feature
//! names. The names are held behind an `Arc<[String]>` so that thousands of
//! per-sample vectors can point at a single allocation, and comparisons between
//! vectors can short-circuit on pointer equality before falling back to a
//! name-by-name check.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised when feature names or shapes disagree.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeatureError {
    #[error("Sample '{sample}' is missing feature '{feature}'.")]
    SchemaMismatch { sample: String, feature: String },
    #[error("Feature '{0}' is listed more than once.")]
    DuplicateFeature(String),
    #[error("Sample '{0}' appears more than once.")]
    DuplicateSample(String),
    #[error("Expected {expected} values but found {found}.")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("Feature matrices disagree on feature order; cannot combine them.")]
    IncompatibleMatrices,
}

/// An ordered sequence of named numeric features for one sample.
#[derive(Debug, Clone)]
pub struct FeatureVector {
    names: Arc<[String]>,
    values: Array1<f64>,
}

impl PartialEq for FeatureVector {
    fn eq(&self, other: &Self) -> bool {
        same_names(&self.names, &other.names) && self.values == other.values
    }
}

impl FeatureVector {
    pub fn new(names: Arc<[String]>, values: Array1<f64>) -> Result<Self, FeatureError> {
        if names.len() != values.len() {
            return Err(FeatureError::ShapeMismatch {
                expected: names.len(),
                found: values.len(),
            });
        }
        Ok(Self { names, values })
    }

    /// Builds a vector from `(name, value)` pairs, keeping their order.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, FeatureError>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut names = Vec::new();
        let mut values = Vec::new();
        let mut seen = HashSet::new();
        for (name, value) in pairs {
            let name = name.into();
            if !seen.insert(name.clone()) {
                return Err(FeatureError::DuplicateFeature(name));
            }
            names.push(name);
            values.push(value);
        }
        Self::new(names.into(), Array1::from_vec(values))
    }

    /// Pairs `values` with `names` when the caller already guarantees equal lengths.
    pub(crate) fn aligned(names: Arc<[String]>, values: Array1<f64>) -> Self {
        debug_assert_eq!(names.len(), values.len());
        Self { names, values }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn shared_names(&self) -> &Arc<[String]> {
        &self.names
    }

    pub fn values(&self) -> ArrayView1<'_, f64> {
        self.values.view()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| self.values[idx])
    }

    /// Replaces the values while keeping the feature names.
    pub fn with_values(&self, values: Array1<f64>) -> Result<Self, FeatureError> {
        Self::new(Arc::clone(&self.names), values)
    }

    /// Returns a new vector restricted to `names`, in that order.
    ///
    /// `sample` is only used to label the error when a feature is missing.
    pub fn restrict(&self, sample: &str, names: &Arc<[String]>) -> Result<Self, FeatureError> {
        if same_names(&self.names, names) {
            return Ok(Self {
                names: Arc::clone(names),
                values: self.values.clone(),
            });
        }

        let index: HashMap<&str, usize> = self
            .names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        let mut values = Array1::zeros(names.len());
        for (dst, name) in names.iter().enumerate() {
            let src = index
                .get(name.as_str())
                .ok_or_else(|| FeatureError::SchemaMismatch {
                    sample: sample.to_string(),
                    feature: name.clone(),
                })?;
            values[dst] = self.values[*src];
        }
        Ok(Self {
            names: Arc::clone(names),
            values,
        })
    }

    /// Fails unless `other` uses exactly the same ordered feature names.
    pub fn ensure_same_features(&self, sample: &str, names: &[String]) -> Result<(), FeatureError> {
        if same_names(&self.names, names) {
            return Ok(());
        }
        let feature = names
            .iter()
            .zip(self.names.iter())
            .find(|(expected, found)| expected != found)
            .map(|(expected, _)| expected.clone())
            .or_else(|| names.get(self.names.len()).cloned())
            .or_else(|| self.names.get(names.len()).cloned())
            .unwrap_or_default();
        Err(FeatureError::SchemaMismatch {
            sample: sample.to_string(),
            feature,
        })
    }
}

fn same_names(a: &[String], b: &[String]) -> bool {
    std::ptr::eq(a, b) || a == b
}

/// Per-sample feature rows sharing one ordered feature list.
///
/// Rows are samples and columns are features, stored row-major so that each
/// sample's vector is a contiguous slice.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    sample_ids: Vec<String>,
    features: Arc<[String]>,
    values: Array2<f64>,
}

impl FeatureMatrix {
    pub fn new(
        sample_ids: Vec<String>,
        features: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self, FeatureError> {
        if values.nrows() != sample_ids.len() {
            return Err(FeatureError::ShapeMismatch {
                expected: sample_ids.len(),
                found: values.nrows(),
            });
        }
        if values.ncols() != features.len() {
            return Err(FeatureError::ShapeMismatch {
                expected: features.len(),
                found: values.ncols(),
            });
        }
        let mut seen = HashSet::with_capacity(features.len());
        for name in &features {
            if !seen.insert(name.as_str()) {
                return Err(FeatureError::DuplicateFeature(name.clone()));
            }
        }
        let mut seen_ids = HashSet::with_capacity(sample_ids.len());
        for id in &sample_ids {
            if !seen_ids.insert(id.as_str()) {
                return Err(FeatureError::DuplicateSample(id.clone()));
            }
        }
        Ok(Self {
            sample_ids,
            features: features.into(),
            values,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn n_features(&self) -> usize {
        self.features.len()
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn features(&self) -> &Arc<[String]> {
        &self.features
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn row_index(&self, sample: &str) -> Option<usize> {
        self.sample_ids.iter().position(|s| s == sample)
    }

    pub fn vector(&self, row: usize) -> FeatureVector {
        FeatureVector {
            names: Arc::clone(&self.features),
            values: self.values.row(row).to_owned(),
        }
    }

    /// Iterates `(sample_id, vector)` pairs in row order.
    pub fn rows(&self) -> impl Iterator<Item = (&str, FeatureVector)> + '_ {
        self.sample_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), self.vector(i)))
    }

    /// Stacks matrices that share the same feature order.
    pub fn concat(matrices: Vec<FeatureMatrix>) -> Result<FeatureMatrix, FeatureError> {
        let mut iter = matrices.into_iter();
        let Some(first) = iter.next() else {
            return Err(FeatureError::ShapeMismatch {
                expected: 1,
                found: 0,
            });
        };
        let features = first.features.to_vec();
        let mut sample_ids = first.sample_ids;
        let mut blocks = vec![first.values];
        for matrix in iter {
            if !same_names(&matrix.features, &features) {
                return Err(FeatureError::IncompatibleMatrices);
            }
            sample_ids.extend(matrix.sample_ids);
            blocks.push(matrix.values);
        }
        let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
        let values = ndarray::concatenate(Axis(0), &views).map_err(|_| {
            FeatureError::IncompatibleMatrices
        })?;
        FeatureMatrix::new(sample_ids, features, values)
    }
}
