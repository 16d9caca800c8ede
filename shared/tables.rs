//! # Tabular input and output
//!
//! All user-facing tables are tab-separated text with a header row:
//!
//! - Feature matrices: first column is the sample identifier (any header
//!   name), every other column is a named numeric feature.
//! - Reference key: sample identifier and phenotype label.
//! - Tumor fractions: sample identifier and fraction; blank or `NA` means
//!   unknown, anything else non-numeric is carried as NaN so that only that
//!   sample fails.
//! - Feature lists: one name per line, `#` comments allowed.
//!
//! Failures are assumed to be user-input errors, so every `DataError` names
//! the file, sample or column at fault. Query matrices are the exception to
//! all-or-nothing reading: a bad cell only rejects its own row.

use crate::cohort::{CohortError, ReferenceKey};
use crate::features::{FeatureError, FeatureMatrix, FeatureVector};
use crate::pipeline::{BatchReport, ErrorKind, FailedSample, QuerySample};
use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use ndarray::{Array1, Array2};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Malformed tab-separated input: {0}")]
    CsvError(#[from] csv::Error),
    #[error("The file '{0}' contains no data rows.")]
    EmptyFile(String),
    #[error("The required column '{0}' was not found. Please check spelling and case.")]
    ColumnNotFound(String),
    #[error("Sample '{sample}' is missing feature '{feature}'.")]
    SchemaMismatch { sample: String, feature: String },
    #[error("Sample '{sample}' has a missing value for '{column}'.")]
    MissingValue { sample: String, column: String },
    #[error("Sample '{sample}' has a non-numeric value '{value}' for '{column}'.")]
    NotNumeric {
        sample: String,
        column: String,
        value: String,
    },
    #[error("Sample '{sample}' has a non-finite value for '{column}'.")]
    NonFiniteValue { sample: String, column: String },
    #[error("'{0}' appears more than once.")]
    DuplicateEntry(String),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Cohort(#[from] CohortError),
}

fn tsv_reader(path: &Path) -> Result<csv::Reader<fs::File>, DataError> {
    Ok(ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .trim(Trim::All)
        .from_path(path)?)
}

fn is_missing(cell: &str) -> bool {
    cell.is_empty() || cell.eq_ignore_ascii_case("na") || cell.eq_ignore_ascii_case("nan")
}

fn parse_cell(sample: &str, column: &str, cell: &str) -> Result<f64, DataError> {
    if is_missing(cell) {
        return Err(DataError::MissingValue {
            sample: sample.to_string(),
            column: column.to_string(),
        });
    }
    let value: f64 = cell.parse().map_err(|_| DataError::NotNumeric {
        sample: sample.to_string(),
        column: column.to_string(),
        value: cell.to_string(),
    })?;
    if !value.is_finite() {
        return Err(DataError::NonFiniteValue {
            sample: sample.to_string(),
            column: column.to_string(),
        });
    }
    Ok(value)
}

/// Maps the wanted feature names to column positions; all columns when `None`.
fn select_columns(
    header: &StringRecord,
    features: Option<&[String]>,
    first: &StringRecord,
) -> Result<(Vec<String>, Vec<usize>), DataError> {
    let available: Vec<String> = header.iter().skip(1).map(str::to_string).collect();
    let Some(wanted) = features else {
        let columns = (1..=available.len()).collect();
        return Ok((available, columns));
    };
    let index: HashMap<&str, usize> = available
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i + 1))
        .collect();
    let mut columns = Vec::with_capacity(wanted.len());
    for name in wanted {
        match index.get(name.as_str()) {
            Some(&col) => columns.push(col),
            None => {
                return Err(DataError::SchemaMismatch {
                    sample: first.get(0).unwrap_or_default().to_string(),
                    feature: name.clone(),
                });
            }
        }
    }
    Ok((wanted.to_vec(), columns))
}

/// Reads a sample-by-feature matrix, optionally keeping only `features` in that order.
pub fn read_feature_matrix(
    path: impl AsRef<Path>,
    features: Option<&[String]>,
) -> Result<FeatureMatrix, DataError> {
    let path = path.as_ref();
    let mut reader = tsv_reader(path)?;
    let header = reader.headers()?.clone();
    let records: Vec<StringRecord> = reader.records().collect::<Result<_, _>>()?;
    if records.is_empty() {
        return Err(DataError::EmptyFile(path.display().to_string()));
    }

    let (names, columns) = select_columns(&header, features, &records[0])?;

    let mut sample_ids = Vec::with_capacity(records.len());
    let mut values = Array2::zeros((records.len(), names.len()));
    for (row, record) in records.iter().enumerate() {
        let sample = record.get(0).unwrap_or_default();
        for (j, (&col, name)) in columns.iter().zip(&names).enumerate() {
            let cell = record.get(col).unwrap_or_default();
            values[[row, j]] = parse_cell(sample, name, cell)?;
        }
        sample_ids.push(sample.to_string());
    }

    log::info!(
        "Loaded {} sample(s) x {} feature(s) from {}",
        sample_ids.len(),
        names.len(),
        path.display()
    );
    Ok(FeatureMatrix::new(sample_ids, names, values)?)
}

/// Query rows split into runnable samples and rows rejected while reading.
#[derive(Debug, Default)]
pub struct QueryTable {
    pub samples: Vec<QuerySample>,
    pub failures: Vec<FailedSample>,
}

/// Reads query samples against the basis `features`, one row at a time.
///
/// A missing, `NA` or non-numeric cell rejects only its row, recorded as a
/// `SchemaMismatch` failure. A missing feature column or a duplicated sample id
/// still fails the whole file.
pub fn read_query_samples(
    path: impl AsRef<Path>,
    features: &Arc<[String]>,
    tumor_fractions: &HashMap<String, f64>,
) -> Result<QueryTable, DataError> {
    let path = path.as_ref();
    let mut reader = tsv_reader(path)?;
    let header = reader.headers()?.clone();
    let records: Vec<StringRecord> = reader.records().collect::<Result<_, _>>()?;
    if records.is_empty() {
        return Err(DataError::EmptyFile(path.display().to_string()));
    }
    let (_, columns) = select_columns(&header, Some(&features[..]), &records[0])?;

    let mut seen = HashSet::new();
    let mut table = QueryTable::default();
    for record in &records {
        let sample = record.get(0).unwrap_or_default();
        if !seen.insert(sample) {
            return Err(DataError::DuplicateEntry(sample.to_string()));
        }
        let parsed: Result<Vec<f64>, DataError> = columns
            .iter()
            .zip(features.iter())
            .map(|(&col, name)| parse_cell(sample, name, record.get(col).unwrap_or_default()))
            .collect();
        match parsed {
            Ok(values) => table.samples.push(QuerySample {
                id: sample.to_string(),
                vector: FeatureVector::new(Arc::clone(features), Array1::from_vec(values))?,
                tumor_fraction: tumor_fractions.get(sample).copied(),
            }),
            Err(err) => {
                log::warn!("Skipping query sample '{sample}': {err}");
                table.failures.push(FailedSample {
                    sample_id: sample.to_string(),
                    kind: ErrorKind::SchemaMismatch,
                    message: err.to_string(),
                });
            }
        }
    }

    log::info!(
        "Loaded {} query sample(s) from {} ({} rejected)",
        table.samples.len(),
        path.display(),
        table.failures.len()
    );
    Ok(table)
}

/// Reads one feature name per line; blank lines and `#` comments are skipped.
pub fn read_feature_list(path: impl AsRef<Path>) -> Result<Vec<String>, DataError> {
    let text = fs::read_to_string(path.as_ref())?;
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for line in text.lines() {
        let name = line.split('#').next().unwrap_or_default().trim();
        if name.is_empty() {
            continue;
        }
        if !seen.insert(name.to_string()) {
            return Err(DataError::DuplicateEntry(name.to_string()));
        }
        names.push(name.to_string());
    }
    if names.is_empty() {
        return Err(DataError::EmptyFile(path.as_ref().display().to_string()));
    }
    Ok(names)
}

/// Reads a two-column sample-to-phenotype table.
pub fn read_reference_key(path: impl AsRef<Path>) -> Result<ReferenceKey, DataError> {
    let path = path.as_ref();
    let mut reader = tsv_reader(path)?;
    let mut key = ReferenceKey::new();
    for record in reader.records() {
        let record = record?;
        let sample = record.get(0).unwrap_or_default();
        let label = record.get(1).unwrap_or_default();
        if sample.is_empty() || label.is_empty() {
            return Err(DataError::MissingValue {
                sample: sample.to_string(),
                column: "phenotype".to_string(),
            });
        }
        key.insert(sample, label)?;
    }
    if key.is_empty() {
        return Err(DataError::EmptyFile(path.display().to_string()));
    }
    log::info!(
        "Reference key: {} sample(s) across {} phenotype(s)",
        key.len(),
        key.labels().len()
    );
    Ok(key)
}

/// Reads per-sample tumor fractions. Blank or `NA` fractions are left out;
/// non-numeric ones are kept as NaN and fail only their sample downstream.
pub fn read_tumor_fractions(path: impl AsRef<Path>) -> Result<HashMap<String, f64>, DataError> {
    let mut reader = tsv_reader(path.as_ref())?;
    let mut fractions = HashMap::new();
    let mut seen = HashSet::new();
    for record in reader.records() {
        let record = record?;
        let sample = record.get(0).unwrap_or_default().to_string();
        if !seen.insert(sample.clone()) {
            return Err(DataError::DuplicateEntry(sample));
        }
        let cell = record.get(1).unwrap_or_default();
        if is_missing(cell) {
            continue;
        }
        let value = cell.parse::<f64>().unwrap_or_else(|_| {
            log::warn!("Sample '{sample}' has a non-numeric tumor fraction '{cell}'.");
            f64::NAN
        });
        fractions.insert(sample, value);
    }
    Ok(fractions)
}

/// Reads `(truth, score)` pairs from the named columns of a labeled table.
///
/// Truth cells are `1`/`0` or `true`/`false`.
pub fn read_labeled_scores(
    path: impl AsRef<Path>,
    truth_column: &str,
    score_column: &str,
) -> Result<(Vec<bool>, Vec<f64>), DataError> {
    let mut reader = tsv_reader(path.as_ref())?;
    let header = reader.headers()?.clone();
    let position = |name: &str| {
        header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))
    };
    let truth_col = position(truth_column)?;
    let score_col = position(score_column)?;

    let mut truth = Vec::new();
    let mut scores = Vec::new();
    for record in reader.records() {
        let record = record?;
        let sample = record.get(0).unwrap_or_default();
        let label = record.get(truth_col).unwrap_or_default();
        let positive = match label.to_ascii_lowercase().as_str() {
            "1" | "true" => true,
            "0" | "false" => false,
            _ => {
                return Err(DataError::NotNumeric {
                    sample: sample.to_string(),
                    column: truth_column.to_string(),
                    value: label.to_string(),
                });
            }
        };
        truth.push(positive);
        scores.push(parse_cell(sample, score_column, record.get(score_col).unwrap_or_default())?);
    }
    Ok((truth, scores))
}

fn format_optional(value: Option<f64>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| v.to_string())
}

/// Writes one row per successful sample; `phenotypes` fixes the weight columns.
///
/// Likelihood columns cover every phenotype except `normal_phenotype` and hold
/// `NA` for samples without a likelihood read-out.
pub fn write_report(
    path: impl AsRef<Path>,
    report: &BatchReport,
    phenotypes: &[String],
    normal_phenotype: &str,
) -> Result<(), DataError> {
    let tumor_phenotypes: Vec<&String> =
        phenotypes.iter().filter(|p| *p != normal_phenotype).collect();
    let mut writer = WriterBuilder::new().delimiter(b'\t').from_path(path.as_ref())?;

    let mut header = vec![
        "sample".to_string(),
        "tumor_fraction".to_string(),
        "tumor_fraction_source".to_string(),
        "low_confidence".to_string(),
    ];
    header.extend(phenotypes.iter().cloned());
    header.extend(
        [
            "residual",
            "dominant",
            "phenotype_of_interest",
            "threshold",
            "condition",
            "call",
            "likelihood_tumor_fraction",
        ]
        .map(str::to_string),
    );
    header.extend(tumor_phenotypes.iter().map(|p| format!("likelihood_{p}")));
    header.push("likelihood_prediction".to_string());
    writer.write_record(&header)?;

    for outcome in &report.successes {
        let mut row = vec![
            outcome.sample_id.clone(),
            format_optional(outcome.tumor_fraction),
            outcome.tumor_fraction_source.to_string(),
            outcome.low_confidence.to_string(),
        ];
        for phenotype in phenotypes {
            row.push(format_optional(outcome.mixture.weight(phenotype)));
        }
        row.push(outcome.mixture.residual.to_string());
        row.push(outcome.mixture.dominant().to_string());
        match &outcome.call {
            Some(call) => {
                row.push(call.phenotype.clone());
                row.push(call.threshold.value.to_string());
                row.push(call.threshold.condition.to_string());
                row.push(call.call.to_string());
            }
            None => row.extend(std::iter::repeat_n("NA".to_string(), 4)),
        }
        match &outcome.likelihood {
            Some(likelihood) => {
                row.push(likelihood.tumor_fraction.to_string());
                for phenotype in &tumor_phenotypes {
                    row.push(format_optional(likelihood.weight(phenotype)));
                }
                row.push(
                    likelihood
                        .prediction
                        .clone()
                        .unwrap_or_else(|| "NoSolution".to_string()),
                );
            }
            None => row.extend(std::iter::repeat_n("NA".to_string(), tumor_phenotypes.len() + 2)),
        }
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes the failed samples with their error kind and message.
pub fn write_failures(path: impl AsRef<Path>, failures: &[FailedSample]) -> Result<(), DataError> {
    let mut writer = WriterBuilder::new().delimiter(b'\t').from_path(path.as_ref())?;
    writer.write_record(["sample", "error_kind", "message"])?;
    for failure in failures {
        writer.write_record([
            failure.sample_id.as_str(),
            failure.kind.as_str(),
            failure.message.as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
