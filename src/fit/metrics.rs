//! Calibration quality metrics.
//!
//! Cllr is the log-likelihood-ratio cost (in bits):
//!
//! ```text
//! Cllr = 1/2 * ( mean_{colocated} log2(1 + 1/LR) + mean_{dislocated} log2(1 + LR) )
//! ```
//!
//! Cllr-min is the cost after an optimal monotonic recalibration of the same
//! LRs (PAV), i.e. the discrimination loss alone.

use crate::domain::{FeatureKind, Label, ScoreDirection};
use crate::fit::pav::PavCalibrator;

/// Cost of a single LR given the true label.
pub fn cllr_contribution(lr: f64, label: Label) -> f64 {
    match label {
        Label::Colocated => (1.0 + 1.0 / lr).log2(),
        Label::Dislocated => (1.0 + lr).log2(),
    }
}

/// `None` unless both labels are present.
pub fn cllr(lrs: &[(f64, Label)]) -> Option<f64> {
    let (mut sum_c, mut n_c, mut sum_d, mut n_d) = (0.0, 0usize, 0.0, 0usize);
    for &(lr, label) in lrs {
        let cost = cllr_contribution(lr, label);
        match label {
            Label::Colocated => {
                sum_c += cost;
                n_c += 1;
            }
            Label::Dislocated => {
                sum_d += cost;
                n_d += 1;
            }
        }
    }
    if n_c == 0 || n_d == 0 {
        return None;
    }
    Some(0.5 * (sum_c / n_c as f64 + sum_d / n_d as f64))
}

/// LRs after an unbounded PAV fit on the LRs themselves, in input order.
pub fn pav_recalibrate(lrs: &[(f64, Label)], min_lr: f64, max_lr: f64) -> Option<Vec<f64>> {
    let model = PavCalibrator::with_bounds(FeatureKind::Stored, ScoreDirection::Increasing, min_lr, max_lr)
        .fit(lrs)
        .ok()?;
    Some(lrs.iter().map(|&(lr, _)| model.lr(lr)).collect())
}

pub fn cllr_min(lrs: &[(f64, Label)]) -> Option<f64> {
    let calibrated = pav_recalibrate(lrs, 0.0, f64::INFINITY)?;
    let relabeled: Vec<(f64, Label)> = calibrated
        .into_iter()
        .zip(lrs)
        .map(|(lr, &(_, label))| (lr, label))
        .collect();
    cllr(&relabeled)
}
