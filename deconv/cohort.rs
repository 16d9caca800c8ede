//! Grouping of reference samples into labeled phenotype cohorts.

use crate::features::{FeatureMatrix, FeatureVector};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CohortError {
    #[error("Cohort '{0}' has no members.")]
    EmptyCohort(String),
    #[error("Sample '{sample}' is assigned to both '{first}' and '{second}' in the reference key.")]
    ConflictingLabel {
        sample: String,
        first: String,
        second: String,
    },
    #[error("Phenotype label '{0}' is used by more than one cohort.")]
    DuplicateLabel(String),
}

/// One reference sample within a cohort.
#[derive(Debug, Clone, PartialEq)]
pub struct CohortMember {
    pub sample_id: String,
    pub vector: FeatureVector,
}

/// A non-empty set of reference samples sharing a phenotype label.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceCohort {
    label: String,
    members: Vec<CohortMember>,
}

impl ReferenceCohort {
    pub fn new(label: impl Into<String>, members: Vec<CohortMember>) -> Result<Self, CohortError> {
        let label = label.into();
        if members.is_empty() {
            return Err(CohortError::EmptyCohort(label));
        }
        Ok(Self { label, members })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn members(&self) -> &[CohortMember] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Sample identifier to phenotype label mapping, in key-file order.
#[derive(Debug, Clone, Default)]
pub struct ReferenceKey {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl ReferenceKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mapping. Repeating an identical mapping is a no-op; relabeling fails.
    pub fn insert(
        &mut self,
        sample: impl Into<String>,
        label: impl Into<String>,
    ) -> Result<(), CohortError> {
        let sample = sample.into();
        let label = label.into();
        if let Some(&idx) = self.index.get(&sample) {
            let existing = &self.entries[idx].1;
            if existing != &label {
                return Err(CohortError::ConflictingLabel {
                    sample,
                    first: existing.clone(),
                    second: label,
                });
            }
            return Ok(());
        }
        self.index.insert(sample.clone(), self.entries.len());
        self.entries.push((sample, label));
        Ok(())
    }

    pub fn label_of(&self, sample: &str) -> Option<&str> {
        self.index
            .get(sample)
            .map(|&idx| self.entries[idx].1.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct labels in order of first appearance.
    pub fn labels(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|(_, label)| seen.insert(label.as_str()))
            .map(|(_, label)| label.clone())
            .collect()
    }

    /// Groups the rows of `matrix` into one cohort per label.
    ///
    /// When `phenotypes` is given, only those labels are kept and cohorts follow
    /// that order; otherwise cohorts follow first appearance in the key.
    pub fn resolve(
        &self,
        matrix: &FeatureMatrix,
        phenotypes: Option<&[String]>,
    ) -> Result<Vec<ReferenceCohort>, CohortError> {
        let labels = match phenotypes {
            Some(list) => {
                let mut seen = HashSet::new();
                for label in list {
                    if !seen.insert(label.as_str()) {
                        return Err(CohortError::DuplicateLabel(label.clone()));
                    }
                }
                list.to_vec()
            }
            None => self.labels(),
        };

        let mut grouped: HashMap<String, Vec<CohortMember>> = labels
            .iter()
            .map(|label| (label.clone(), Vec::new()))
            .collect();

        for (sample, vector) in matrix.rows() {
            match self.label_of(sample) {
                Some(label) => {
                    if let Some(members) = grouped.get_mut(label) {
                        members.push(CohortMember {
                            sample_id: sample.to_string(),
                            vector,
                        });
                    }
                }
                None => log::debug!("Sample '{sample}' has no reference label; skipping."),
            }
        }

        let unmatched = self
            .entries
            .iter()
            .filter(|(sample, _)| matrix.row_index(sample).is_none())
            .count();
        if unmatched > 0 {
            log::warn!(
                "{unmatched} sample(s) in the reference key were not found in the reference feature matrices."
            );
        }

        labels
            .into_iter()
            .map(|label| {
                let members = grouped.remove(label.as_str()).unwrap_or_default();
                log::info!("Cohort '{label}': {} member(s)", members.len());
                ReferenceCohort::new(label, members)
            })
            .collect()
    }
}
