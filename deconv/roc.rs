//! ROC statistics for calibrating classification thresholds on labeled samples.
//!
//! A sample is predicted positive when its score is at least the threshold,
//! matching [`classify`](crate::classify::classify).

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RocError {
    #[error("Truth labels and scores differ in length ({truth} vs {scores}).")]
    LengthMismatch { truth: usize, scores: usize },
    #[error("No positive samples; sensitivity is undefined.")]
    NoPositives,
    #[error("No negative samples; specificity is undefined.")]
    NoNegatives,
    #[error("At least one threshold step is required.")]
    NoThresholds,
    #[error("Target specificity {0} is not reachable on the threshold grid.")]
    Unreachable(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RocPoint {
    pub threshold: f64,
    pub fpr: f64,
    pub tpr: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Confusion {
    tp: usize,
    fp: usize,
    tn: usize,
    fn_: usize,
}

impl Confusion {
    fn tally(truth: &[bool], scores: &[f64], threshold: f64) -> Self {
        let mut c = Self::default();
        for (&positive, &score) in truth.iter().zip(scores) {
            match (positive, score >= threshold) {
                (true, true) => c.tp += 1,
                (true, false) => c.fn_ += 1,
                (false, true) => c.fp += 1,
                (false, false) => c.tn += 1,
            }
        }
        c
    }

    fn sensitivity(&self) -> f64 {
        self.tp as f64 / (self.tp + self.fn_) as f64
    }

    fn specificity(&self) -> f64 {
        self.tn as f64 / (self.tn + self.fp) as f64
    }
}

fn check_inputs(truth: &[bool], scores: &[f64]) -> Result<(), RocError> {
    if truth.len() != scores.len() {
        return Err(RocError::LengthMismatch {
            truth: truth.len(),
            scores: scores.len(),
        });
    }
    if !truth.iter().any(|&t| t) {
        return Err(RocError::NoPositives);
    }
    if truth.iter().all(|&t| t) {
        return Err(RocError::NoNegatives);
    }
    Ok(())
}

/// Returns `(sensitivity, specificity)` at `threshold`.
pub fn sensitivity_specificity(
    truth: &[bool],
    scores: &[f64],
    threshold: f64,
) -> Result<(f64, f64), RocError> {
    check_inputs(truth, scores)?;
    let c = Confusion::tally(truth, scores, threshold);
    Ok((c.sensitivity(), c.specificity()))
}

/// ROC points at the thresholds `0, 1/n, …, 1`.
pub fn roc_curve(
    truth: &[bool],
    scores: &[f64],
    num_thresholds: usize,
) -> Result<Vec<RocPoint>, RocError> {
    check_inputs(truth, scores)?;
    if num_thresholds == 0 {
        return Err(RocError::NoThresholds);
    }
    Ok((0..=num_thresholds)
        .map(|i| {
            let threshold = i as f64 / num_thresholds as f64;
            let c = Confusion::tally(truth, scores, threshold);
            RocPoint {
                threshold,
                fpr: 1.0 - c.specificity(),
                tpr: c.sensitivity(),
            }
        })
        .collect())
}

/// Trapezoidal area under the curve traced by `points`, in any order.
pub fn auc(points: &[RocPoint]) -> f64 {
    let mut sorted: Vec<(f64, f64)> = points.iter().map(|p| (p.fpr, p.tpr)).collect();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
    let mut area = 0.0;
    let mut prev = (0.0, 0.0);
    for &(fpr, tpr) in &sorted {
        area += (fpr - prev.0) * (tpr + prev.1) / 2.0;
        prev = (fpr, tpr);
    }
    area + (1.0 - prev.0) * (1.0 + prev.1) / 2.0
}

/// Smallest grid threshold whose specificity reaches `target`.
pub fn threshold_for_specificity(
    truth: &[bool],
    scores: &[f64],
    target: f64,
    num_thresholds: usize,
) -> Result<RocPoint, RocError> {
    roc_curve(truth, scores, num_thresholds)?
        .into_iter()
        .find(|p| 1.0 - p.fpr >= target)
        .ok_or(RocError::Unreachable(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn separated_scores_have_unit_auc() {
        let truth = [false, false, false, true, true];
        let scores = [0.05, 0.1, 0.2, 0.8, 0.95];
        let curve = roc_curve(&truth, &scores, 100).unwrap();
        assert_eq!(curve.len(), 101);
        assert_abs_diff_eq!(auc(&curve), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn sensitivity_specificity_uses_inclusive_threshold() {
        let truth = [false, true, true, false];
        let scores = [0.5, 0.5, 0.2, 0.1];
        let (sens, spec) = sensitivity_specificity(&truth, &scores, 0.5).unwrap();
        assert_abs_diff_eq!(sens, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(spec, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn threshold_for_target_specificity() {
        let truth = [false, false, false, false, true, true];
        let scores = [0.1, 0.2, 0.3, 0.45, 0.4, 0.9];
        let point = threshold_for_specificity(&truth, &scores, 1.0, 100).unwrap();
        assert_abs_diff_eq!(point.threshold, 0.46, epsilon = 1e-12);
        assert_abs_diff_eq!(point.tpr, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn single_class_inputs_are_rejected() {
        assert_eq!(
            roc_curve(&[true, true], &[0.1, 0.2], 10).unwrap_err(),
            RocError::NoNegatives
        );
        assert_eq!(
            sensitivity_specificity(&[false], &[0.1], 0.5).unwrap_err(),
            RocError::NoPositives
        );
    }
}
