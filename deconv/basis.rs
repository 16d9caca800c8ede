//! # Reference simplex construction and persistence
//!
//! A reference simplex holds one vertex per phenotype, each collapsed from a
//! labeled cohort of reference samples. It is built once, optionally written to
//! a human-readable TOML artifact, and then shared read-only by every
//! per-sample projection. Building from cohorts and loading an artifact produce
//! values that are indistinguishable to downstream code.

use crate::cohort::ReferenceCohort;
use crate::features::{FeatureError, FeatureVector};
use crate::geometry::{self, SimplexGeometry};
use crate::linalg::LinalgError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Version written into every basis artifact.
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Smallest accepted ratio between the extreme eigenvalues of the edge Gram matrix.
pub const DEGENERACY_CONDITION_FLOOR: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum BasisError {
    #[error("Reference sample '{sample}' is missing feature '{feature}'.")]
    SchemaMismatch { sample: String, feature: String },
    #[error("Reference sample '{sample}' has a non-finite value for feature '{feature}'.")]
    NonFiniteValue { sample: String, feature: String },
    #[error("At least one reference cohort is required to build a simplex.")]
    NoCohorts,
    #[error("The feature list is empty.")]
    NoFeatures,
    #[error("{cohorts} cohorts need at least {needed} candidate features, found {found}.")]
    TooFewFeatures {
        cohorts: usize,
        needed: usize,
        found: usize,
    },
    #[error("Feature '{0}' is listed more than once.")]
    DuplicateFeature(String),
    #[error("Phenotype '{0}' is used by more than one cohort.")]
    DuplicatePhenotype(String),
    #[error("Phenotype '{0}' is not part of the reference simplex.")]
    UnknownPhenotype(String),
    #[error("Invalid aggregate configuration: {0}")]
    InvalidAggregate(String),
    #[error("Invalid basis artifact: {0}")]
    InvalidArtifact(String),
    #[error("Failed to read or write basis file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML basis file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize basis to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Simplex geometry could not be computed: {0}")]
    Linalg(#[from] LinalgError),
}

/// Non-fatal findings about a built or loaded simplex.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimplexWarning {
    #[error(
        "Degenerate simplex: affine rank {affine_rank} of {expected_rank} expected (eigenvalue ratio {condition:.3e}); projections may be ill-conditioned."
    )]
    DegenerateSimplex {
        affine_rank: usize,
        expected_rank: usize,
        condition: f64,
    },
}

/// How a cohort is collapsed into its vertex.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AggregateMethod {
    /// Coordinate-wise median.
    Median,
    /// Coordinate-wise mean after dropping `proportion` of members from each tail.
    TrimmedMean { proportion: f64 },
    Mean,
}

impl Default for AggregateMethod {
    fn default() -> Self {
        Self::Median
    }
}

impl AggregateMethod {
    pub fn validate(&self) -> Result<(), BasisError> {
        match *self {
            Self::TrimmedMean { proportion } if !(0.0..0.5).contains(&proportion) => {
                Err(BasisError::InvalidAggregate(format!(
                    "trimmed mean proportion must be in [0, 0.5), got {proportion}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Collapses `members` (rows = samples, columns = features) into one row.
    pub fn aggregate(&self, members: ArrayView2<f64>) -> Array1<f64> {
        if members.nrows() == 1 {
            return members.row(0).to_owned();
        }
        match *self {
            Self::Mean => members
                .mean_axis(Axis(0))
                .unwrap_or_else(|| Array1::zeros(members.ncols())),
            Self::Median => members.map_axis(Axis(0), median),
            Self::TrimmedMean { proportion } => {
                members.map_axis(Axis(0), |column| trimmed_mean(column, proportion))
            }
        }
    }
}

fn sorted_values(column: ArrayView1<f64>) -> Vec<f64> {
    let mut values = column.to_vec();
    values.sort_by(|a, b| a.total_cmp(b));
    values
}

fn median(column: ArrayView1<f64>) -> f64 {
    let values = sorted_values(column);
    let n = values.len();
    if n == 0 {
        return f64::NAN;
    }
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

fn trimmed_mean(column: ArrayView1<f64>, proportion: f64) -> f64 {
    let values = sorted_values(column);
    let n = values.len();
    let mut cut = (n as f64 * proportion).floor() as usize;
    if 2 * cut >= n {
        cut = (n - 1) / 2;
    }
    let kept = &values[cut..n - cut];
    kept.iter().sum::<f64>() / kept.len() as f64
}

/// Per-feature min/max standardization fitted on the reference cohorts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureScaling {
    pub minimum: Vec<f64>,
    pub range: Vec<f64>,
}

impl FeatureScaling {
    /// Fits minimum and range per column; zero-range columns keep a range of 1.
    pub fn fit(rows: ArrayView2<f64>, features: &[String]) -> Self {
        let mut minimum = Vec::with_capacity(rows.ncols());
        let mut range = Vec::with_capacity(rows.ncols());
        for (j, column) in rows.axis_iter(Axis(1)).enumerate() {
            let lo = column.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = column.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let mut span = hi - lo;
            if !(span > 0.0) {
                log::warn!(
                    "Feature '{}' is constant across the reference cohorts; leaving it unscaled.",
                    features.get(j).map(String::as_str).unwrap_or("?")
                );
                span = 1.0;
            }
            minimum.push(lo);
            range.push(span);
        }
        Self { minimum, range }
    }

    pub fn len(&self) -> usize {
        self.minimum.len()
    }

    pub fn is_empty(&self) -> bool {
        self.minimum.is_empty()
    }

    pub fn apply(&self, values: ArrayView1<f64>) -> Array1<f64> {
        Array1::from_shape_fn(values.len(), |j| {
            (values[j] - self.minimum[j]) / self.range[j]
        })
    }

    fn apply_rows(&self, rows: &mut Array2<f64>) {
        for mut row in rows.axis_iter_mut(Axis(0)) {
            let scaled = self.apply(row.view());
            row.assign(&scaled);
        }
    }
}

/// A phenotype's representative point in feature space.
#[derive(Debug, Clone, PartialEq)]
pub struct SimplexVertex {
    pub phenotype: String,
    pub cohort_size: usize,
    pub vector: FeatureVector,
}

/// The immutable set of phenotype vertices sharing one feature ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSimplex {
    features: Arc<[String]>,
    phenotypes: Vec<String>,
    /// Shape `[k, n_features]`, one row per phenotype.
    vertices: Array2<f64>,
    cohort_sizes: Vec<usize>,
    aggregate: AggregateMethod,
    scaling: Option<FeatureScaling>,
}

impl ReferenceSimplex {
    /// Assembles a simplex from already-aggregated vertices, validating shapes.
    pub fn from_parts(
        features: Vec<String>,
        phenotypes: Vec<String>,
        vertices: Array2<f64>,
        cohort_sizes: Vec<usize>,
        aggregate: AggregateMethod,
        scaling: Option<FeatureScaling>,
    ) -> Result<Self, BasisError> {
        check_unique_features(&features)?;
        if phenotypes.is_empty() {
            return Err(BasisError::NoCohorts);
        }
        let mut seen = HashSet::new();
        for label in &phenotypes {
            if !seen.insert(label.as_str()) {
                return Err(BasisError::DuplicatePhenotype(label.clone()));
            }
        }
        if vertices.dim() != (phenotypes.len(), features.len()) {
            return Err(BasisError::InvalidArtifact(format!(
                "vertex matrix is {}x{}, expected {}x{}",
                vertices.nrows(),
                vertices.ncols(),
                phenotypes.len(),
                features.len()
            )));
        }
        if cohort_sizes.len() != phenotypes.len() {
            return Err(BasisError::InvalidArtifact(format!(
                "{} cohort sizes for {} phenotypes",
                cohort_sizes.len(),
                phenotypes.len()
            )));
        }
        if let Some(scaling) = &scaling {
            if scaling.minimum.len() != features.len() || scaling.range.len() != features.len() {
                return Err(BasisError::InvalidArtifact(
                    "feature scaling length does not match the feature list".to_string(),
                ));
            }
        }
        aggregate.validate()?;
        Ok(Self {
            features: features.into(),
            phenotypes,
            vertices,
            cohort_sizes,
            aggregate,
            scaling,
        })
    }

    pub fn features(&self) -> &Arc<[String]> {
        &self.features
    }

    pub fn phenotypes(&self) -> &[String] {
        &self.phenotypes
    }

    /// Number of vertices.
    pub fn k(&self) -> usize {
        self.phenotypes.len()
    }

    pub fn n_features(&self) -> usize {
        self.features.len()
    }

    pub fn vertices(&self) -> &Array2<f64> {
        &self.vertices
    }

    pub fn cohort_sizes(&self) -> &[usize] {
        &self.cohort_sizes
    }

    pub fn aggregate(&self) -> AggregateMethod {
        self.aggregate
    }

    pub fn scaling(&self) -> Option<&FeatureScaling> {
        self.scaling.as_ref()
    }

    pub fn vertex_index(&self, phenotype: &str) -> Option<usize> {
        self.phenotypes.iter().position(|p| p == phenotype)
    }

    pub fn vertex_at(&self, index: usize) -> SimplexVertex {
        SimplexVertex {
            phenotype: self.phenotypes[index].clone(),
            cohort_size: self.cohort_sizes[index],
            vector: FeatureVector::aligned(
                Arc::clone(&self.features),
                self.vertices.row(index).to_owned(),
            ),
        }
    }

    pub fn vertex(&self, phenotype: &str) -> Result<SimplexVertex, BasisError> {
        self.vertex_index(phenotype)
            .map(|idx| self.vertex_at(idx))
            .ok_or_else(|| BasisError::UnknownPhenotype(phenotype.to_string()))
    }

    /// Aligns a raw sample vector to this simplex: feature subset, order and scaling.
    pub fn prepare_query(
        &self,
        sample: &str,
        raw: &FeatureVector,
    ) -> Result<FeatureVector, FeatureError> {
        let restricted = raw.restrict(sample, &self.features)?;
        match &self.scaling {
            Some(scaling) => restricted.with_values(scaling.apply(restricted.values())),
            None => Ok(restricted),
        }
    }

    pub fn geometry(&self) -> Result<SimplexGeometry, BasisError> {
        Ok(geometry::simplex_geometry(self.vertices.view())?)
    }

    /// Reports a `DegenerateSimplex` warning when the vertices are (nearly) affinely dependent.
    pub fn check_degeneracy(&self) -> Result<Option<SimplexWarning>, BasisError> {
        let geom = self.geometry()?;
        let expected_rank = self.k().saturating_sub(1);
        if geom.affine_rank < expected_rank || geom.condition < DEGENERACY_CONDITION_FLOOR {
            return Ok(Some(SimplexWarning::DegenerateSimplex {
                affine_rank: geom.affine_rank,
                expected_rank,
                condition: geom.condition,
            }));
        }
        Ok(None)
    }

    /// Saves the simplex to a file in a human-readable TOML format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), BasisError> {
        let artifact = SimplexArtifact::from(self);
        let toml_string = toml::to_string_pretty(&artifact)?;
        let mut file = BufWriter::new(fs::File::create(path.as_ref())?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a simplex from a TOML file without recomputing any aggregate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BasisError> {
        let toml_string = fs::read_to_string(path.as_ref())?;
        let artifact: SimplexArtifact = toml::from_str(&toml_string)?;
        let simplex = Self::try_from(artifact)?;
        let warning = simplex.check_degeneracy()?;
        if let Some(warning) = &warning {
            log::warn!("{warning}");
        }
        Ok(simplex)
    }
}

fn check_unique_features(features: &[String]) -> Result<(), BasisError> {
    if features.is_empty() {
        return Err(BasisError::NoFeatures);
    }
    let mut seen = HashSet::with_capacity(features.len());
    for name in features {
        if !seen.insert(name.as_str()) {
            return Err(BasisError::DuplicateFeature(name.clone()));
        }
    }
    Ok(())
}

/// On-disk layout of a [`ReferenceSimplex`].
#[derive(Debug, Serialize, Deserialize)]
struct SimplexArtifact {
    format_version: u32,
    features: Vec<String>,
    aggregate: AggregateMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scaling: Option<FeatureScaling>,
    vertices: Vec<VertexRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VertexRecord {
    phenotype: String,
    cohort_size: usize,
    values: Vec<f64>,
}

impl From<&ReferenceSimplex> for SimplexArtifact {
    fn from(simplex: &ReferenceSimplex) -> Self {
        let vertices = simplex
            .phenotypes
            .iter()
            .zip(simplex.cohort_sizes.iter())
            .zip(simplex.vertices.axis_iter(Axis(0)))
            .map(|((phenotype, &cohort_size), row)| VertexRecord {
                phenotype: phenotype.clone(),
                cohort_size,
                values: row.to_vec(),
            })
            .collect();
        Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            features: simplex.features.to_vec(),
            aggregate: simplex.aggregate,
            scaling: simplex.scaling.clone(),
            vertices,
        }
    }
}

impl TryFrom<SimplexArtifact> for ReferenceSimplex {
    type Error = BasisError;

    fn try_from(artifact: SimplexArtifact) -> Result<Self, Self::Error> {
        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(BasisError::InvalidArtifact(format!(
                "unsupported format version {} (expected {ARTIFACT_FORMAT_VERSION})",
                artifact.format_version
            )));
        }
        let n = artifact.features.len();
        let k = artifact.vertices.len();
        let mut vertices = Array2::zeros((k, n));
        let mut phenotypes = Vec::with_capacity(k);
        let mut cohort_sizes = Vec::with_capacity(k);
        for (i, record) in artifact.vertices.into_iter().enumerate() {
            if record.values.len() != n {
                return Err(BasisError::InvalidArtifact(format!(
                    "vertex '{}' has {} values for {} features",
                    record.phenotype,
                    record.values.len(),
                    n
                )));
            }
            vertices
                .row_mut(i)
                .assign(&ArrayView1::from(record.values.as_slice()));
            phenotypes.push(record.phenotype);
            cohort_sizes.push(record.cohort_size);
        }
        ReferenceSimplex::from_parts(
            artifact.features,
            phenotypes,
            vertices,
            cohort_sizes,
            artifact.aggregate,
            artifact.scaling,
        )
    }
}

/// Builds reference simplices from labeled cohorts. Holds configuration only.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimplexBuilder {
    pub aggregate: AggregateMethod,
    /// Fit min/max scaling on the reference members before aggregating.
    pub standardize: bool,
}

impl SimplexBuilder {
    pub fn new(aggregate: AggregateMethod) -> Self {
        Self {
            aggregate,
            standardize: false,
        }
    }

    pub fn with_standardization(mut self, standardize: bool) -> Self {
        self.standardize = standardize;
        self
    }

    pub fn build(
        &self,
        cohorts: &[ReferenceCohort],
        features: &[String],
    ) -> Result<ReferenceSimplex, BasisError> {
        self.build_checked(cohorts, features).map(|(simplex, _)| simplex)
    }

    /// Builds the simplex and also returns its degeneracy warning, if any.
    pub fn build_checked(
        &self,
        cohorts: &[ReferenceCohort],
        features: &[String],
    ) -> Result<(ReferenceSimplex, Option<SimplexWarning>), BasisError> {
        self.aggregate.validate()?;
        check_unique_features(features)?;
        if cohorts.is_empty() {
            return Err(BasisError::NoCohorts);
        }

        let names: Arc<[String]> = features.to_vec().into();
        let mut member_matrices = Vec::with_capacity(cohorts.len());
        for cohort in cohorts {
            member_matrices.push(cohort_matrix(cohort, &names)?);
        }

        let scaling = if self.standardize {
            let views: Vec<_> = member_matrices.iter().map(|m| m.view()).collect();
            let stacked = ndarray::concatenate(Axis(0), &views)
                .map_err(|e| BasisError::InvalidArtifact(e.to_string()))?;
            let scaling = FeatureScaling::fit(stacked.view(), features);
            for matrix in member_matrices.iter_mut() {
                scaling.apply_rows(matrix);
            }
            Some(scaling)
        } else {
            None
        };

        let mut vertices = Array2::zeros((cohorts.len(), features.len()));
        for (i, matrix) in member_matrices.iter().enumerate() {
            vertices.row_mut(i).assign(&self.aggregate.aggregate(matrix.view()));
        }

        let simplex = ReferenceSimplex::from_parts(
            features.to_vec(),
            cohorts.iter().map(|c| c.label().to_string()).collect(),
            vertices,
            cohorts.iter().map(ReferenceCohort::len).collect(),
            self.aggregate,
            scaling,
        )?;

        log::info!(
            "Built reference simplex with {} vertices over {} features ({:?} aggregation)",
            simplex.k(),
            simplex.n_features(),
            self.aggregate
        );
        let warning = simplex.check_degeneracy()?;
        if let Some(warning) = &warning {
            log::warn!("{warning}");
        }
        Ok((simplex, warning))
    }
}

/// Restricts every cohort member to `names` and stacks them row-wise.
pub(crate) fn cohort_matrix(
    cohort: &ReferenceCohort,
    names: &Arc<[String]>,
) -> Result<Array2<f64>, BasisError> {
    let mut matrix = Array2::zeros((cohort.len(), names.len()));
    for (i, member) in cohort.members().iter().enumerate() {
        let restricted = member
            .vector
            .restrict(&member.sample_id, names)
            .map_err(|err| match err {
                FeatureError::SchemaMismatch { sample, feature } => {
                    BasisError::SchemaMismatch { sample, feature }
                }
                other => BasisError::InvalidArtifact(other.to_string()),
            })?;
        if let Some(j) = restricted.values().iter().position(|v| !v.is_finite()) {
            return Err(BasisError::NonFiniteValue {
                sample: member.sample_id.clone(),
                feature: names[j].clone(),
            });
        }
        matrix.row_mut(i).assign(&restricted.values());
    }
    Ok(matrix)
}
