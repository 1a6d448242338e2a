//! The fitted score → likelihood-ratio mapping.

use serde::{Deserialize, Serialize};

use crate::domain::{FeatureKind, ScoreDirection};
use crate::error::AppError;

/// Start of a constant-LR step: applies to scores in `[score, next.score)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub score: f64,
    pub lr: f64,
    /// Training pairs pooled into this step.
    pub n_colocated: usize,
    pub n_dislocated: usize,
}

/// Monotonic step function from score to LR.
///
/// Built once by `PavCalibrator::fit` and read-only afterwards; it is `Sync`
/// and can be shared across evaluation threads as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationModel {
    pub feature: FeatureKind,
    pub direction: ScoreDirection,
    pub min_lr: f64,
    pub max_lr: f64,
    /// Training class sizes used for the prior correction.
    pub n_colocated: usize,
    pub n_dislocated: usize,
    /// Ascending by score; LRs are monotonic in `direction`.
    pub breakpoints: Vec<Breakpoint>,
}

impl CalibrationModel {
    /// LR of the step with the largest threshold `<= score`.
    ///
    /// Scores below the first threshold take the first step's LR and scores
    /// above the last take the last, so results never leave the fitted range.
    pub fn lr(&self, score: f64) -> f64 {
        let idx = self.breakpoints.partition_point(|b| b.score <= score);
        let bp = match idx {
            0 => self.breakpoints.first(),
            n => self.breakpoints.get(n - 1),
        };
        bp.map_or(1.0, |b| b.lr)
    }

    pub fn score_range(&self) -> Option<(f64, f64)> {
        Some((self.breakpoints.first()?.score, self.breakpoints.last()?.score))
    }

    /// Structural checks for models read from disk.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.breakpoints.is_empty() {
            return Err(AppError::input("Calibration model has no breakpoints."));
        }
        if !(self.min_lr > 0.0 && self.max_lr.is_finite() && self.min_lr < self.max_lr) {
            return Err(AppError::input(format!(
                "Calibration model has invalid LR bounds [{}, {}].",
                self.min_lr, self.max_lr
            )));
        }
        for b in &self.breakpoints {
            if !b.score.is_finite() || b.lr.is_nan() || b.lr < self.min_lr || b.lr > self.max_lr {
                return Err(AppError::input(format!(
                    "Calibration model breakpoint (score {}, lr {}) is out of range.",
                    b.score, b.lr
                )));
            }
        }
        for w in self.breakpoints.windows(2) {
            let ordered = w[0].score < w[1].score;
            let monotone = match self.direction {
                ScoreDirection::Increasing => w[0].lr <= w[1].lr,
                ScoreDirection::Decreasing => w[0].lr >= w[1].lr,
            };
            if !(ordered && monotone) {
                return Err(AppError::input(format!(
                    "Calibration model breakpoints at scores {} and {} are not monotonic.",
                    w[0].score, w[1].score
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bp(score: f64, lr: f64) -> Breakpoint {
        Breakpoint {
            score,
            lr,
            n_colocated: 1,
            n_dislocated: 1,
        }
    }

    fn model() -> CalibrationModel {
        CalibrationModel {
            feature: FeatureKind::Distance,
            direction: ScoreDirection::Decreasing,
            min_lr: 1e-4,
            max_lr: 1e4,
            n_colocated: 3,
            n_dislocated: 3,
            breakpoints: vec![bp(0.0, 100.0), bp(10.0, 1.0), bp(20.0, 0.01)],
        }
    }

    #[test]
    fn lookup_takes_the_step_at_or_below_the_score() {
        let m = model();
        assert_eq!(m.lr(0.0), 100.0);
        assert_eq!(m.lr(9.99), 100.0);
        assert_eq!(m.lr(10.0), 1.0);
        assert_eq!(m.lr(1e9), 0.01);
    }

    #[test]
    fn scores_below_the_range_clamp_to_the_first_step() {
        assert_eq!(model().lr(-50.0), 100.0);
    }

    #[test]
    fn validate_rejects_non_monotonic_steps() {
        let mut m = model();
        assert!(m.validate().is_ok());
        m.breakpoints[2].lr = 5.0;
        assert!(m.validate().is_err());
    }

    #[test]
    fn json_round_trip() {
        let m = model();
        let text = serde_json::to_string(&m).unwrap();
        let back: CalibrationModel = serde_json::from_str(&text).unwrap();
        assert_eq!(back, m);
    }
}
