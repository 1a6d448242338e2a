//! Shared pipeline steps used by the command handlers.
//!
//! Keeping the workflows here keeps `app` focused on presentation (printing
//! and writing files):
//! measurements -> pairs, pairs -> filtered pairs, pairs -> calibration -> evaluation

use std::path::Path;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::data::{CachedCellLookup, CellDatabase, CellTable, LookupStats};
use crate::domain::{Label, PairRecord, RunConfig};
use crate::error::{AppError, ErrorKind};
use crate::eval::{EvaluationResult, HistogramRange, PairLr, aggregate};
use crate::features::FeatureExtractor;
use crate::fit::PavCalibrator;
use crate::io::read_pairs;
use crate::models::CalibrationModel;
use crate::pairing::{BackgroundSampler, BackgroundStats, PairGenerator, PairingPolicy, PairingStats, holdout_split, triage};
use crate::store::MeasurementStore;

/// Pairs produced from one measurement store.
#[derive(Debug, Clone)]
pub struct PairingRun {
    pub pairs: Vec<PairRecord>,
    pub stats: PairingStats,
    /// Present when antenna positions were resolved against a cell database.
    pub lookup: Option<LookupStats>,
}

pub fn load_cell_db(path: Option<&Path>) -> Result<Option<CellTable>, AppError> {
    path.map(CellTable::load).transpose()
}

/// Generate labeled pairs, resolving antenna positions when `cells` is given.
pub fn pair_measurements(
    store: &MeasurementStore,
    config: &RunConfig,
    policy: &dyn PairingPolicy,
    cells: Option<&dyn CellDatabase>,
) -> Result<PairingRun, AppError> {
    let generator = PairGenerator::new(config, policy);
    match cells {
        Some(db) => {
            let lookup = CachedCellLookup::new(db, config.on_duplicate_cell);
            let generated = generator.generate_resolved(store, &lookup)?;
            Ok(PairingRun {
                pairs: generated.pairs,
                stats: generated.stats,
                lookup: Some(lookup.stats()),
            })
        }
        None => {
            let generated = generator.generate(store)?;
            Ok(PairingRun {
                pairs: generated
                    .pairs
                    .iter()
                    .map(|p| PairRecord::from_pair(p, None, None))
                    .collect(),
                stats: generated.stats,
                lookup: None,
            })
        }
    }
}

/// Filters applied by `filter-pairs`, in this order.
#[derive(Default)]
pub struct FilterOptions<'a> {
    pub max_delay_secs: Option<u64>,
    pub label: Option<Label>,
    /// Background measurements for one-pair-per-day selection.
    pub select_by_day: Option<&'a MeasurementStore>,
    /// Fill `score` with this extractor's feature.
    pub extract_features: Option<&'a FeatureExtractor<'a>>,
    pub clear_geo_data: bool,
}

/// Pair counts after each filtering step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterStats {
    pub input: usize,
    pub after_delay: usize,
    pub after_label: usize,
    pub after_day: usize,
    /// Pairs left without a score by feature extraction.
    pub unresolvable: usize,
}

pub fn filter_pairs(mut pairs: Vec<PairRecord>, opts: &FilterOptions<'_>) -> Result<(Vec<PairRecord>, FilterStats), AppError> {
    let mut stats = FilterStats {
        input: pairs.len(),
        ..FilterStats::default()
    };

    if let Some(max) = opts.max_delay_secs {
        info!(max_delay_secs = max, "applying delay filter");
        pairs = triage::select_by_delay(pairs, max);
    }
    stats.after_delay = pairs.len();

    if let Some(label) = opts.label {
        pairs = triage::select_by_label(pairs, label);
    }
    stats.after_label = pairs.len();

    if let Some(background) = opts.select_by_day {
        info!("applying selection by day");
        pairs = triage::select_by_day(&pairs, background);
    }
    stats.after_day = pairs.len();

    if let Some(extractor) = opts.extract_features {
        info!(feature = extractor.kind().name(), "extracting features");
        let scored = extractor.score_pairs(&pairs)?;
        for (pair, score) in pairs.iter_mut().zip(scored.scores) {
            pair.score = score;
        }
        stats.unresolvable = scored.unresolvable;
    }

    if opts.clear_geo_data {
        for pair in &mut pairs {
            pair.left.site = None;
            pair.right.site = None;
        }
    }

    Ok((pairs, stats))
}

/// Training and test pairs of one evaluation run.
#[derive(Debug, Clone)]
pub struct EvaluationPairs {
    pub train: Vec<PairRecord>,
    pub test: Vec<PairRecord>,
    /// The test pairs are the training pairs themselves.
    pub self_validation: bool,
}

/// Where the pairs of an evaluation run come from.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluationSource<'a> {
    pub training: Option<&'a Path>,
    pub test: Option<&'a Path>,
    pub holdout_fraction: Option<f64>,
    pub seed: u64,
    pub max_delay_secs: Option<u64>,
}

pub fn load_evaluation_pairs(source: &EvaluationSource<'_>) -> Result<EvaluationPairs, AppError> {
    let read = |path: &Path| -> Result<Vec<PairRecord>, AppError> {
        let pairs = read_pairs(path)?;
        Ok(match source.max_delay_secs {
            Some(max) => triage::select_by_delay(pairs, max),
            None => pairs,
        })
    };

    let train = source.training.map(read).transpose()?.unwrap_or_default();

    if let Some(test) = source.test {
        if source.holdout_fraction.is_some() {
            return Err(AppError::input("A holdout fraction cannot be combined with separate test pairs."));
        }
        return Ok(EvaluationPairs {
            train,
            test: read(test)?,
            self_validation: false,
        });
    }
    if source.training.is_none() {
        return Err(AppError::input("Nothing to evaluate: give --test-pairs or --training-pairs."));
    }
    if let Some(fraction) = source.holdout_fraction {
        let split = holdout_split(train, fraction, source.seed)?;
        info!(train = split.train.len(), test = split.test.len(), seed = source.seed, "holdout split");
        return Ok(EvaluationPairs {
            train: split.train,
            test: split.test,
            self_validation: false,
        });
    }

    warn!("no test pairs given; evaluating on the training pairs (self-validation)");
    Ok(EvaluationPairs {
        test: train.clone(),
        train,
        self_validation: true,
    })
}

/// Fit a calibration model on the labeled, scorable training pairs.
///
/// Unlabeled pairs and pairs without a computable score are skipped and logged.
pub fn fit_calibration(
    train: &[PairRecord],
    extractor: &FeatureExtractor<'_>,
    config: &RunConfig,
) -> Result<CalibrationModel, AppError> {
    let calibrator = PavCalibrator::new(config)?;
    let scored = extractor.score_pairs(train)?;

    let mut unlabeled = 0usize;
    let training: Vec<(f64, Label)> = train
        .iter()
        .zip(&scored.scores)
        .filter_map(|(pair, score)| {
            if pair.label.is_none() {
                unlabeled += 1;
            }
            Some(((*score)?, pair.label?))
        })
        .collect();

    info!(
        pairs = train.len(),
        used = training.len(),
        unlabeled,
        unresolvable = scored.unresolvable,
        feature = extractor.kind().name(),
        "fitting calibration"
    );

    calibrator.fit(&training).map_err(|e| match e.kind() {
        ErrorKind::InsufficientTrainingData if scored.unresolvable > 0 => AppError::new(
            ErrorKind::InsufficientTrainingData,
            format!("{e} ({} training pairs had no computable score.)", scored.unresolvable),
        ),
        _ => e,
    })
}

#[derive(Debug, Clone)]
pub struct BackgroundEvaluation<'p> {
    pub result: EvaluationResult<'p>,
    pub stats: BackgroundStats,
}

/// Evaluate every test pair with its own model, fitted on the colocated
/// training pairs plus dislocated pairs built from `background` around the
/// test pair's left measurement.
///
/// Delay draws are seeded per test pair (`seed + index`), so the outcome does
/// not depend on parallelism. Test pairs without a score, or without
/// background to fit a model on, are counted as unresolvable.
pub fn evaluate_with_background<'p>(
    test: &'p [PairRecord],
    train: &[PairRecord],
    background: &MeasurementStore,
    extractor: &FeatureExtractor<'_>,
    config: &RunConfig,
    min_gap_secs: u64,
    seed: u64,
) -> Result<BackgroundEvaluation<'p>, AppError> {
    let range = HistogramRange::from_config(config)?;
    let calibrator = PavCalibrator::new(config)?;
    let colocated: Vec<PairRecord> = train
        .iter()
        .filter(|p| p.label == Some(Label::Colocated))
        .cloned()
        .collect();
    let sampler = BackgroundSampler::new(background, &colocated, min_gap_secs)?;

    let colocated_scored = extractor.score_pairs(&colocated)?;
    let colocated_training: Vec<(f64, Label)> = colocated_scored
        .scores
        .iter()
        .flatten()
        .map(|&s| (s, Label::Colocated))
        .collect();
    info!(
        test_pairs = test.len(),
        colocated = colocated_training.len(),
        unresolvable = colocated_scored.unresolvable,
        background = background.len(),
        min_gap_secs,
        "evaluating against background measurements"
    );

    struct Outcome {
        /// (score, LR) when the test pair got one.
        lr: Option<(f64, f64)>,
        built: usize,
        unresolvable: usize,
        without_model: bool,
    }

    let evaluate_one = |index: usize, pair: &PairRecord| -> Result<Outcome, AppError> {
        let score = match extractor.score(pair) {
            Ok(score) => score,
            Err(e) if e.kind() == ErrorKind::UnresolvableScore => {
                debug!("{e}");
                return Ok(Outcome {
                    lr: None,
                    built: 0,
                    unresolvable: 0,
                    without_model: false,
                });
            }
            Err(e) => return Err(e),
        };

        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(index as u64));
        let dislocated = sampler.dislocated_for(&pair.left, &mut rng);
        let scored = extractor.score_pairs(&dislocated)?;
        let mut training = colocated_training.clone();
        training.extend(scored.scores.iter().flatten().map(|&s| (s, Label::Dislocated)));

        match calibrator.fit(&training) {
            Ok(model) => Ok(Outcome {
                lr: Some((score, model.lr(score))),
                built: dislocated.len(),
                unresolvable: scored.unresolvable,
                without_model: false,
            }),
            Err(e) if e.kind() == ErrorKind::InsufficientTrainingData => {
                debug!(left = %pair.left.id, right = %pair.right.id, "{e}");
                Ok(Outcome {
                    lr: None,
                    built: dislocated.len(),
                    unresolvable: scored.unresolvable,
                    without_model: true,
                })
            }
            Err(e) => Err(e),
        }
    };

    let outcomes: Vec<Outcome> = if config.parallel {
        test.par_iter()
            .enumerate()
            .map(|(i, p)| evaluate_one(i, p))
            .collect::<Result<_, _>>()?
    } else {
        test.iter()
            .enumerate()
            .map(|(i, p)| evaluate_one(i, p))
            .collect::<Result<_, _>>()?
    };

    let mut stats = BackgroundStats {
        colocated_training: colocated_training.len(),
        ..BackgroundStats::default()
    };
    let mut results = Vec::with_capacity(test.len());
    for (pair, outcome) in test.iter().zip(outcomes) {
        stats.dislocated_built += outcome.built;
        stats.dislocated_unresolvable += outcome.unresolvable;
        if outcome.without_model {
            stats.without_model += 1;
        }
        if let Some((score, lr)) = outcome.lr {
            results.push(PairLr { pair, score, lr });
        }
    }
    if stats.without_model > 0 {
        warn!(
            test_pairs = stats.without_model,
            "no background to fit a model on; these test pairs get no LR"
        );
    }

    let unresolvable = test.len() - results.len();
    Ok(BackgroundEvaluation {
        result: aggregate(test.len(), results, unresolvable, range),
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CellIdentity, CellSite, FeatureKind, GeoPoint, Measurement, MeasurementId, Radio};
    use crate::pairing::TrackPolicy;
    use chrono::{Duration, TimeZone, Utc};

    fn measurement(id: u64, device: &str, track: &str, secs: i64, eci: u64) -> Measurement {
        Measurement {
            id: MeasurementId(id),
            device: device.to_string(),
            track: Some(track.to_string()),
            timestamp: Utc.with_ymd_and_hms(2023, 5, 1, 10, 0, 0).unwrap() + Duration::seconds(secs),
            cell: CellIdentity::eci(Radio::Lte, 204, 8, eci).unwrap(),
            position: None,
        }
    }

    fn store() -> MeasurementStore {
        MeasurementStore::from_measurements(
            vec![
                measurement(1, "a", "car", 0, 1),
                measurement(2, "b", "car", 10, 1),
                measurement(3, "c", "bike", 20, 2),
            ],
            &RunConfig::default(),
        )
    }

    fn config() -> RunConfig {
        RunConfig {
            max_delay_secs: 60,
            ..RunConfig::default()
        }
    }

    #[test]
    fn pairing_without_cell_db_leaves_sites_empty() {
        let run = pair_measurements(&store(), &config(), &TrackPolicy, None).unwrap();
        assert_eq!(run.stats.colocated, 1);
        assert_eq!(run.stats.dislocated, 2);
        assert!(run.lookup.is_none());
        assert!(run.pairs.iter().all(|p| p.left.site.is_none() && p.right.site.is_none()));
    }

    #[test]
    fn pairing_with_cell_db_resolves_sites() {
        let sites = vec![
            CellSite {
                cell: CellIdentity::eci(Radio::Lte, 204, 8, 1).unwrap(),
                position: GeoPoint::new(5.0, 52.0),
                azimuth: None,
                valid_from: None,
                valid_to: None,
            },
            CellSite {
                cell: CellIdentity::eci(Radio::Lte, 204, 8, 2).unwrap(),
                position: GeoPoint::new(5.1, 52.0),
                azimuth: None,
                valid_from: None,
                valid_to: None,
            },
        ];
        let table = CellTable::new(sites);
        let run = pair_measurements(&store(), &config(), &TrackPolicy, Some(&table)).unwrap();
        assert_eq!(run.pairs.len(), 3);
        assert!(run.pairs.iter().all(|p| p.left.site.is_some() && p.right.site.is_some()));
        let lookup = run.lookup.unwrap();
        assert_eq!(lookup.missing, 0);
    }

    #[test]
    fn filters_apply_in_order_and_clear_geo_data() {
        let cfg = RunConfig {
            feature: FeatureKind::Delay,
            ..config()
        };
        let pairs = pair_measurements(&store(), &cfg, &TrackPolicy, None).unwrap().pairs;
        let extractor = FeatureExtractor::new(&cfg, None);
        let opts = FilterOptions {
            max_delay_secs: Some(15),
            label: Some(Label::Dislocated),
            extract_features: Some(&extractor),
            clear_geo_data: true,
            ..FilterOptions::default()
        };
        let (kept, stats) = filter_pairs(pairs, &opts).unwrap();
        // a-b (10 s, colocated), a-c (20 s), b-c (10 s, dislocated)
        assert_eq!(stats.input, 3);
        assert_eq!(stats.after_delay, 2);
        assert_eq!(stats.after_label, 1);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].score, Some(10.0));
        assert!(kept[0].left.site.is_none());
    }

    #[test]
    fn self_validation_without_test_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.csv");
        let pairs = pair_measurements(&store(), &config(), &TrackPolicy, None).unwrap().pairs;
        crate::io::write_pairs(&path, &pairs).unwrap();

        let source = EvaluationSource {
            training: Some(&path),
            ..EvaluationSource::default()
        };
        let loaded = load_evaluation_pairs(&source).unwrap();
        assert!(loaded.self_validation);
        assert_eq!(loaded.train, loaded.test);
        assert!(load_evaluation_pairs(&EvaluationSource::default()).is_err());
    }

    #[test]
    fn holdout_with_separate_test_pairs_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairs.csv");
        let pairs = pair_measurements(&store(), &config(), &TrackPolicy, None).unwrap().pairs;
        crate::io::write_pairs(&path, &pairs).unwrap();

        let source = EvaluationSource {
            training: Some(&path),
            test: Some(&path),
            holdout_fraction: Some(0.5),
            ..EvaluationSource::default()
        };
        let err = load_evaluation_pairs(&source).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    /// Device a is near cell 1, far from cell 2 and 3; b and c each spend a
    /// day elsewhere.
    fn background_fixture() -> (MeasurementStore, CellTable) {
        let day = 24 * 3600;
        let store = MeasurementStore::from_measurements(
            vec![
                measurement(1, "a", "t", 0, 1),
                measurement(2, "a", "t", day + 60, 2),
                measurement(3, "a", "t", 2 * day, 3),
                measurement(4, "b", "t", 5, 1),
                measurement(5, "b", "t", day + 65, 2),
            ],
            &RunConfig::default(),
        );
        let site = |eci: u64, lon: f64| CellSite {
            cell: CellIdentity::eci(Radio::Lte, 204, 8, eci).unwrap(),
            position: GeoPoint::new(lon, 52.0),
            azimuth: None,
            valid_from: None,
            valid_to: None,
        };
        let table = CellTable::new(vec![site(1, 5.0), site(2, 5.5), site(3, 6.0)]);
        (store, table)
    }

    #[test]
    fn background_evaluation_fits_a_model_per_test_pair() {
        let (store, table) = background_fixture();
        let cfg = RunConfig {
            max_delay_secs: 60,
            ..RunConfig::default()
        };
        let lookup = CachedCellLookup::new(&table, cfg.on_duplicate_cell);
        let extractor = FeatureExtractor::new(&cfg, Some(&lookup));

        // a-b on the same cell at day 0 is the colocated training pair.
        let run = pair_measurements(&store, &cfg, &TrackPolicy, Some(&table)).unwrap();
        let train: Vec<PairRecord> = run.pairs.iter().filter(|p| p.left.id.0 == 1).cloned().collect();
        assert_eq!(train.len(), 1);
        let test = run.pairs.clone();

        let eval = evaluate_with_background(&test, &train, &store, &extractor, &cfg, 24 * 3600 - 120, 3).unwrap();
        assert_eq!(eval.stats.colocated_training, 1);
        assert_eq!(eval.stats.without_model, 0);
        // Each left measurement of a has two background measurements a day or more away.
        assert_eq!(eval.stats.dislocated_built, 2 * test.len());
        assert_eq!(eval.result.stats.evaluated, test.len());
        assert!(eval.result.results.iter().all(|r| r.lr > 1.0));

        let parallel = RunConfig { parallel: true, ..cfg.clone() };
        let again = evaluate_with_background(&test, &train, &store, &extractor, &parallel, 24 * 3600 - 120, 3).unwrap();
        let lrs = |e: &BackgroundEvaluation<'_>| e.result.results.iter().map(|r| r.lr).collect::<Vec<_>>();
        assert_eq!(lrs(&eval), lrs(&again));
    }

    #[test]
    fn test_pairs_without_background_get_no_lr() {
        let (store, table) = background_fixture();
        let cfg = RunConfig {
            max_delay_secs: 60,
            ..RunConfig::default()
        };
        let lookup = CachedCellLookup::new(&table, cfg.on_duplicate_cell);
        let extractor = FeatureExtractor::new(&cfg, Some(&lookup));
        let run = pair_measurements(&store, &cfg, &TrackPolicy, Some(&table)).unwrap();

        let mut test = run.pairs.clone();
        test[0].left.device = "stranger".to_string();
        let eval = evaluate_with_background(&test, &run.pairs, &store, &extractor, &cfg, 60, 3).unwrap();
        assert_eq!(eval.stats.without_model, 1);
        assert_eq!(eval.result.stats.unresolvable, 1);
        assert_eq!(eval.result.stats.evaluated, test.len() - 1);
    }

    #[test]
    fn fitting_on_delays_separates_labels() {
        let cfg = RunConfig {
            feature: FeatureKind::Delay,
            ..config()
        };
        let pairs = pair_measurements(&store(), &cfg, &TrackPolicy, None).unwrap().pairs;
        let extractor = FeatureExtractor::new(&cfg, None);
        let model = fit_calibration(&pairs, &extractor, &cfg).unwrap();
        assert_eq!(model.n_colocated, 1);
        assert_eq!(model.n_dislocated, 2);
        assert!(model.validate().is_ok());
    }
}
