//! Fitting a `CalibrationModel` with pool-adjacent-violators.
//!
//! Steps:
//!
//! 1. sort training pairs by score and pool tied scores into one position
//! 2. run PAV on the colocated fraction per position, in the order that makes
//!    the fit non-decreasing for the configured direction
//! 3. convert each fitted probability to an LR, dividing out the training prior
//!    `n_colocated / n_dislocated`, and clip to `[min_lr, max_lr]`
//! 4. condense adjacent positions with equal LR into breakpoints

use tracing::debug;

use crate::domain::{FeatureKind, Label, RunConfig, ScoreDirection};
use crate::error::{AppError, ErrorKind};
use crate::math::pool_adjacent_violators;
use crate::models::{Breakpoint, CalibrationModel};

#[derive(Debug, Clone, Copy)]
pub struct PavCalibrator {
    feature: FeatureKind,
    direction: ScoreDirection,
    min_lr: f64,
    max_lr: f64,
}

/// Tied training scores pooled into one PAV position.
#[derive(Debug, Clone, Copy)]
struct Position {
    score: f64,
    colocated: usize,
    dislocated: usize,
}

impl PavCalibrator {
    pub fn new(config: &RunConfig) -> Result<Self, AppError> {
        let (min_lr, max_lr) = (config.min_lr, config.max_lr);
        if !(min_lr.is_finite() && max_lr.is_finite() && min_lr > 0.0 && min_lr < max_lr) {
            return Err(AppError::input(format!(
                "LR bounds must be finite with 0 < min < max (got [{min_lr}, {max_lr}])."
            )));
        }
        Ok(Self::with_bounds(config.feature, config.score_direction(), min_lr, max_lr))
    }

    /// Unchecked bounds; `[0, inf]` gives the unclipped fit used for Cllr-min.
    pub fn with_bounds(feature: FeatureKind, direction: ScoreDirection, min_lr: f64, max_lr: f64) -> Self {
        Self {
            feature,
            direction,
            min_lr,
            max_lr,
        }
    }

    pub fn fit(&self, scored: &[(f64, Label)]) -> Result<CalibrationModel, AppError> {
        let n_colocated = scored.iter().filter(|(_, l)| l.is_colocated()).count();
        let n_dislocated = scored.len() - n_colocated;
        if n_colocated == 0 || n_dislocated == 0 {
            return Err(AppError::new(
                ErrorKind::InsufficientTrainingData,
                format!(
                    "Calibration needs both colocated and dislocated training pairs \
                     (got {n_colocated} colocated, {n_dislocated} dislocated)."
                ),
            ));
        }
        if let Some((s, _)) = scored.iter().find(|(s, _)| !s.is_finite()) {
            return Err(AppError::input(format!("Training score {s} is not finite.")));
        }

        let positions = pool_ties(scored);
        let lrs = self.fit_lrs(&positions, n_colocated, n_dislocated);
        let breakpoints = condense(&positions, &lrs);

        debug!(
            positions = positions.len(),
            breakpoints = breakpoints.len(),
            "calibration fitted"
        );

        Ok(CalibrationModel {
            feature: self.feature,
            direction: self.direction,
            min_lr: self.min_lr,
            max_lr: self.max_lr,
            n_colocated,
            n_dislocated,
            breakpoints,
        })
    }

    /// Fitted, prior-corrected and clipped LR per position (ascending score).
    fn fit_lrs(&self, positions: &[Position], n_colocated: usize, n_dislocated: usize) -> Vec<f64> {
        // PAV fits non-decreasing P(colocated); a decreasing feature is fitted on
        // the reversed sequence.
        let order: Vec<usize> = match self.direction {
            ScoreDirection::Increasing => (0..positions.len()).collect(),
            ScoreDirection::Decreasing => (0..positions.len()).rev().collect(),
        };
        let sums: Vec<f64> = order.iter().map(|&i| positions[i].colocated as f64).collect();
        let weights: Vec<f64> = order
            .iter()
            .map(|&i| (positions[i].colocated + positions[i].dislocated) as f64)
            .collect();

        let prior_odds = n_colocated as f64 / n_dislocated as f64;
        let mut lrs = vec![0.0; positions.len()];
        for block in pool_adjacent_violators(&sums, &weights) {
            let lr = self.probability_to_lr(block.sum, block.weight, prior_odds);
            for &i in &order[block.first..=block.last] {
                lrs[i] = lr;
            }
        }
        lrs
    }

    fn probability_to_lr(&self, colocated: f64, total: f64, prior_odds: f64) -> f64 {
        let dislocated = total - colocated;
        let lr = if colocated <= 0.0 {
            self.min_lr
        } else if dislocated <= 0.0 {
            self.max_lr
        } else {
            (colocated / dislocated) / prior_odds
        };
        lr.clamp(self.min_lr, self.max_lr)
    }
}

fn pool_ties(scored: &[(f64, Label)]) -> Vec<Position> {
    let mut sorted: Vec<(f64, Label)> = scored.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut positions: Vec<Position> = Vec::new();
    for (score, label) in sorted {
        if positions.last().is_none_or(|p| p.score != score) {
            positions.push(Position {
                score,
                colocated: 0,
                dislocated: 0,
            });
        }
        if let Some(pos) = positions.last_mut() {
            match label {
                Label::Colocated => pos.colocated += 1,
                Label::Dislocated => pos.dislocated += 1,
            }
        }
    }
    positions
}

fn condense(positions: &[Position], lrs: &[f64]) -> Vec<Breakpoint> {
    let mut out: Vec<Breakpoint> = Vec::new();
    for (p, &lr) in positions.iter().zip(lrs) {
        if let Some(b) = out.last_mut().filter(|b| b.lr == lr) {
            b.n_colocated += p.colocated;
            b.n_dislocated += p.dislocated;
            continue;
        }
        out.push(Breakpoint {
            score: p.score,
            lr,
            n_colocated: p.colocated,
            n_dislocated: p.dislocated,
        });
    }
    out
}
