//! Applying a calibration model to test pairs.
//!
//! The evaluator scores each pair, looks up its LR, and aggregates everything
//! the reports and plots need: per-label counts, Cllr / Cllr-min, the ordered
//! (score, LR) curve with post-hoc PAV values, a log10-LR histogram, and the
//! verbal-scale LR distribution table.

use tracing::info;

use crate::domain::{Label, PairRecord, RunConfig};
use crate::error::AppError;
use crate::features::FeatureExtractor;
use crate::fit::metrics::{cllr, cllr_contribution, cllr_min, pav_recalibrate};
use crate::models::CalibrationModel;

/// Upper bounds of the verbal-scale LR ranges; the first range starts at 0.
pub const LR_RANGE_BOUNDS: [f64; 9] = [1e-5, 0.01, 0.1, 0.5, 2.0, 10.0, 100.0, 10_000.0, f64::INFINITY];

const LR_RANGE_NAMES: [&str; 9] = [
    "extremely stronger support for dislocated",
    "much stronger support for dislocated",
    "stronger support for dislocated",
    "slightly stronger support for dislocated",
    "about equal support",
    "slightly stronger support for colocated",
    "stronger support for colocated",
    "much stronger support for colocated",
    "extremely stronger support for colocated",
];

/// LR of one evaluated pair.
#[derive(Debug, Clone, Copy)]
pub struct PairLr<'p> {
    pub pair: &'p PairRecord,
    pub score: f64,
    pub lr: f64,
}

impl PairLr<'_> {
    pub fn log10_lr(&self) -> f64 {
        self.lr.log10()
    }

    /// Cllr cost of this pair; `None` for unlabeled pairs.
    pub fn cllr_contribution(&self) -> Option<f64> {
        self.pair.label.map(|label| cllr_contribution(self.lr, label))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationStats {
    pub input: usize,
    pub evaluated: usize,
    pub colocated: usize,
    pub dislocated: usize,
    pub unlabeled: usize,
    /// Pairs without a computable score; excluded, never defaulted.
    pub unresolvable: usize,
    pub cllr: Option<f64>,
    pub cllr_min: Option<f64>,
}

impl EvaluationStats {
    pub fn cllr_cal(&self) -> Option<f64> {
        Some(self.cllr? - self.cllr_min?)
    }
}

/// A point of the PAV plot, ordered by score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PavPoint {
    pub score: f64,
    pub lr: f64,
    /// LR after optimal monotonic recalibration of the evaluated set.
    pub pav_lr: Option<f64>,
    pub label: Option<Label>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramBin {
    pub log10_lower: f64,
    pub log10_upper: f64,
    pub colocated: usize,
    pub dislocated: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrRange {
    pub name: &'static str,
    pub lower: f64,
    pub upper: f64,
    pub colocated: usize,
    pub dislocated: usize,
}

#[derive(Debug, Clone)]
pub struct EvaluationResult<'p> {
    pub results: Vec<PairLr<'p>>,
    pub stats: EvaluationStats,
    pub pav_curve: Vec<PavPoint>,
    pub histogram: Vec<HistogramBin>,
    pub distribution: Vec<LrRange>,
}

impl EvaluationResult<'_> {
    /// (LR, label) of every labeled result.
    pub fn labeled_lrs(&self) -> Vec<(f64, Label)> {
        self.results
            .iter()
            .filter_map(|r| r.pair.label.map(|l| (r.lr, l)))
            .collect()
    }
}

pub struct Evaluator<'a> {
    model: &'a CalibrationModel,
    extractor: &'a FeatureExtractor<'a>,
    histogram_bins: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        config: &RunConfig,
        model: &'a CalibrationModel,
        extractor: &'a FeatureExtractor<'a>,
    ) -> Result<Self, AppError> {
        if extractor.kind() != model.feature {
            return Err(AppError::input(format!(
                "Calibration model was fitted on feature `{}` but the run uses `{}`.",
                model.feature.name(),
                extractor.kind().name()
            )));
        }
        let range = HistogramRange::from_config(config)?;
        Ok(Self {
            model,
            extractor,
            histogram_bins: range.bins,
        })
    }

    pub fn evaluate<'p>(&self, pairs: &'p [PairRecord]) -> Result<EvaluationResult<'p>, AppError> {
        let scored = self.extractor.score_pairs(pairs)?;
        let results: Vec<PairLr<'p>> = pairs
            .iter()
            .zip(&scored.scores)
            .filter_map(|(pair, score)| {
                let score = (*score)?;
                Some(PairLr {
                    pair,
                    score,
                    lr: self.model.lr(score),
                })
            })
            .collect();

        let range = HistogramRange {
            min_lr: self.model.min_lr,
            max_lr: self.model.max_lr,
            bins: self.histogram_bins,
        };
        Ok(aggregate(pairs.len(), results, scored.unresolvable, range))
    }
}

/// LR bounds and bin count shared by the PAV curve and the histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramRange {
    pub min_lr: f64,
    pub max_lr: f64,
    pub bins: usize,
}

impl HistogramRange {
    pub fn from_config(config: &RunConfig) -> Result<Self, AppError> {
        if config.histogram_bins == 0 {
            return Err(AppError::input("Histogram needs at least one bin."));
        }
        Ok(Self {
            min_lr: config.min_lr,
            max_lr: config.max_lr,
            bins: config.histogram_bins,
        })
    }
}

/// Build the statistics, curves and tables of an evaluation from per-pair LRs.
///
/// `input` counts every pair offered for evaluation, `unresolvable` those
/// that got no LR.
pub fn aggregate<'p>(
    input: usize,
    results: Vec<PairLr<'p>>,
    unresolvable: usize,
    range: HistogramRange,
) -> EvaluationResult<'p> {
    let labeled: Vec<(f64, Label)> = results
        .iter()
        .filter_map(|r| r.pair.label.map(|l| (r.lr, l)))
        .collect();
    let colocated = labeled.iter().filter(|(_, l)| l.is_colocated()).count();

    let stats = EvaluationStats {
        input,
        evaluated: results.len(),
        colocated,
        dislocated: labeled.len() - colocated,
        unlabeled: results.len() - labeled.len(),
        unresolvable,
        cllr: cllr(&labeled),
        cllr_min: cllr_min(&labeled),
    };

    info!(
        evaluated = stats.evaluated,
        unresolvable = stats.unresolvable,
        cllr = ?stats.cllr,
        "evaluation done"
    );

    EvaluationResult {
        pav_curve: pav_curve(&results, range),
        histogram: histogram(&results, range),
        distribution: lr_distribution(&results),
        results,
        stats,
    }
}

fn pav_curve(results: &[PairLr<'_>], range: HistogramRange) -> Vec<PavPoint> {
    let labeled: Vec<(usize, (f64, Label))> = results
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.pair.label.map(|l| (i, (r.lr, l))))
        .collect();
    let lrs: Vec<(f64, Label)> = labeled.iter().map(|&(_, x)| x).collect();

    let mut pav_lr = vec![None; results.len()];
    if let Some(calibrated) = pav_recalibrate(&lrs, range.min_lr, range.max_lr) {
        for (&(i, _), v) in labeled.iter().zip(calibrated) {
            pav_lr[i] = Some(v);
        }
    }

    let mut curve: Vec<PavPoint> = results
        .iter()
        .zip(pav_lr)
        .map(|(r, pav_lr)| PavPoint {
            score: r.score,
            lr: r.lr,
            pav_lr,
            label: r.pair.label,
        })
        .collect();
    curve.sort_by(|a, b| a.score.total_cmp(&b.score));
    curve
}

/// Equal-width bins over the log10 LR range.
fn histogram(results: &[PairLr<'_>], range: HistogramRange) -> Vec<HistogramBin> {
    let lo = range.min_lr.log10();
    let hi = range.max_lr.log10();
    let n = range.bins.max(1);
    let width = (hi - lo) / n as f64;

    let mut bins: Vec<HistogramBin> = (0..n)
        .map(|i| HistogramBin {
            log10_lower: lo + i as f64 * width,
            log10_upper: if i + 1 == n { hi } else { lo + (i + 1) as f64 * width },
            colocated: 0,
            dislocated: 0,
        })
        .collect();

    for r in results {
        let Some(label) = r.pair.label else { continue };
        let x = r.log10_lr();
        let idx = if width > 0.0 {
            (((x - lo) / width).floor().max(0.0) as usize).min(n - 1)
        } else {
            0
        };
        match label {
            Label::Colocated => bins[idx].colocated += 1,
            Label::Dislocated => bins[idx].dislocated += 1,
        }
    }
    bins
}

/// Counts per verbal-scale range `[lower, upper)`.
pub fn lr_distribution(results: &[PairLr<'_>]) -> Vec<LrRange> {
    let mut lower = 0.0;
    LR_RANGE_BOUNDS
        .iter()
        .zip(LR_RANGE_NAMES)
        .map(|(&upper, name)| {
            let from = lower;
            let in_range = |r: &&PairLr<'_>| r.lr >= from && r.lr < upper;
            let count = |label: Label| {
                results
                    .iter()
                    .filter(in_range)
                    .filter(|r| r.pair.label == Some(label))
                    .count()
            };
            let row = LrRange {
                name,
                lower: from,
                upper,
                colocated: count(Label::Colocated),
                dislocated: count(Label::Dislocated),
            };
            lower = upper;
            row
        })
        .collect()
}
