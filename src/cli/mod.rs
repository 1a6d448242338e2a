//! Command-line parsing for the colocation calibration tool.
//!
//! Argument parsing and command dispatch stay separate from the pairing and
//! calibration code; `app::run_config_from_args` turns these structs into a
//! `RunConfig`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::domain::{DuplicatePolicy, FeatureKind, Label, ScoreDirection};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(
    name = "coloc",
    version,
    about = "Colocation likelihood ratios from cell-tower measurements"
)]
pub struct Cli {
    /// More log output (`-v` debug, `-vv` trace). `RUST_LOG` takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Combine measurements from different devices into labeled pairs.
    PairMeasurements(PairMeasurementsArgs),
    /// Produce training pairs from field-collection data, labeled by device GPS.
    GenerateCellscannerPairs(CellscannerPairsArgs),
    /// Apply delay, label and per-day selection filters to a pairs store.
    FilterPairs(FilterPairsArgs),
    /// Fit a calibration on training pairs and evaluate it on test pairs.
    EvaluateWithBackground(EvaluateArgs),
    /// Print per-device measurement counts and time spans.
    Summarize(SummarizeArgs),
}

/// Cell database options shared by every command that resolves antennas.
#[derive(Debug, Args, Clone)]
pub struct CellDbArgs {
    /// Cell database CSV (radio, mcc, mnc, lac, ci, eci, lon, lat, date_start, date_end).
    #[arg(long, value_name = "CSV")]
    pub cell_db: Option<PathBuf>,

    /// What to do when a cell identity has several records at one time.
    #[arg(long, value_enum, default_value_t = DuplicatePolicy::TakeFirst)]
    pub on_duplicate_cell: DuplicatePolicy,
}

#[derive(Debug, Args, Clone)]
pub struct PairMeasurementsArgs {
    /// Measurements CSV.
    #[arg(long, value_name = "CSV")]
    pub measurements_file: PathBuf,

    /// Output pairs store (`.csv` or `.db`); CSV on stdout when omitted.
    #[arg(long, value_name = "PATH")]
    pub write_pairs: Option<PathBuf>,

    /// Maximum time between the two measurements of a pair.
    #[arg(long, value_name = "SECONDS", default_value_t = 60)]
    pub max_delay: u64,

    /// TOML file with co-present device groups; labels come from `track` otherwise.
    #[arg(long, value_name = "TOML")]
    pub colocation_groups: Option<PathBuf>,

    #[arg(long, value_name = "N")]
    pub limit_colocated: Option<usize>,

    #[arg(long, value_name = "N")]
    pub limit_dislocated: Option<usize>,

    /// Also pair measurements of one device with each other.
    #[arg(long)]
    pub allow_same_device: bool,

    /// Keep exact repeats (same device, timestamp and cell) of a measurement.
    #[arg(long)]
    pub keep_repeated_measurements: bool,

    /// Scan device pairs on all cores.
    #[arg(long)]
    pub parallel: bool,

    #[command(flatten)]
    pub cells: CellDbArgs,
}

#[derive(Debug, Args, Clone)]
pub struct CellscannerPairsArgs {
    /// Measurements CSV with device GPS positions (`lon`, `lat`).
    #[arg(long, value_name = "CSV")]
    pub measurements_file: PathBuf,

    /// Cell database CSV used to resolve antenna positions.
    #[arg(long, value_name = "CSV")]
    pub cell_db: PathBuf,

    #[arg(long, value_enum, default_value_t = DuplicatePolicy::Drop)]
    pub on_duplicate_cell: DuplicatePolicy,

    /// Output pairs store (`.csv` or `.db`).
    #[arg(long, value_name = "PATH")]
    pub write_pairs: PathBuf,

    #[arg(long, value_name = "SECONDS", default_value_t = 0)]
    pub max_delay: u64,

    #[arg(long, value_name = "N", default_value_t = 1000)]
    pub limit_colocated: usize,

    #[arg(long, value_name = "N", default_value_t = 1000)]
    pub limit_dislocated: usize,

    /// Device positions at most this far apart are colocated.
    #[arg(long, value_name = "METERS", default_value_t = 50.0)]
    pub colocated_radius: f64,

    /// Device positions at least this far apart are dislocated.
    #[arg(long, value_name = "METERS", default_value_t = 5000.0)]
    pub dislocated_min_distance: f64,

    #[arg(long)]
    pub keep_repeated_measurements: bool,

    #[arg(long)]
    pub parallel: bool,
}

#[derive(Debug, Args, Clone)]
pub struct FilterPairsArgs {
    /// Input pairs store (`.csv` or `.db`).
    #[arg(long, value_name = "PATH")]
    pub pairs_file: PathBuf,

    /// Output pairs store (`.csv` or `.db`).
    #[arg(long, value_name = "PATH")]
    pub write_pairs: PathBuf,

    /// Keep pairs with at most this many seconds between the measurements.
    #[arg(long, value_name = "SECONDS")]
    pub max_delay: Option<u64>,

    /// Keep only pairs with this label.
    #[arg(long, value_enum)]
    pub label: Option<Label>,

    /// Keep at most one pair per day and device combination; needs background measurements.
    #[arg(long, requires = "background_measurements")]
    pub select_by_day: bool,

    /// Background measurements CSV used to rank right cells by rarity.
    #[arg(long, value_name = "CSV")]
    pub background_measurements: Option<PathBuf>,

    /// Fill the `score` column with the configured feature.
    #[arg(long)]
    pub extract_features: bool,

    #[arg(long, value_enum, default_value_t = FeatureKind::Distance)]
    pub feature: FeatureKind,

    /// Blank the stored antenna coordinates before writing.
    #[arg(long)]
    pub clear_geo_data: bool,

    #[command(flatten)]
    pub cells: CellDbArgs,
}

#[derive(Debug, Args, Clone)]
pub struct EvaluateArgs {
    /// Pairs store to fit the calibration on.
    #[arg(long, value_name = "PATH", required_unless_present = "load_model")]
    pub training_pairs: Option<PathBuf>,

    /// Pairs store to evaluate; the training pairs themselves when omitted.
    #[arg(long, value_name = "PATH")]
    pub test_pairs: Option<PathBuf>,

    /// Drop pairs with more than this many seconds between the measurements.
    #[arg(long, value_name = "SECONDS")]
    pub max_delay: Option<u64>,

    #[arg(long, value_enum, default_value_t = FeatureKind::Distance)]
    pub feature: FeatureKind,

    /// Sense of the score to LR relation; defaults per feature.
    #[arg(long, value_enum)]
    pub direction: Option<ScoreDirection>,

    #[arg(long, default_value_t = 1e-4)]
    pub min_lr: f64,

    #[arg(long, default_value_t = 1e4)]
    pub max_lr: f64,

    /// Hold out this fraction of the training pairs for testing (without --test-pairs).
    #[arg(long, value_name = "FRACTION", conflicts_with = "test_pairs")]
    pub holdout_fraction: Option<f64>,

    /// Build dislocated training pairs per test pair from these measurements
    /// instead of using the dislocated training pairs.
    #[arg(
        long,
        value_name = "CSV",
        requires = "training_pairs",
        conflicts_with_all = ["holdout_fraction", "load_model", "write_model"]
    )]
    pub background_measurements: Option<PathBuf>,

    /// Minimum time between a test measurement and the background measurements paired with it.
    #[arg(long, value_name = "SECONDS", default_value_t = crate::pairing::DEFAULT_MIN_BACKGROUND_GAP_SECS)]
    pub min_background_delay: u64,

    /// Seed for the holdout split and the background delay draws.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Per-pair results CSV.
    #[arg(long, value_name = "CSV")]
    pub write_results: Option<PathBuf>,

    /// PAV curve data CSV.
    #[arg(long, value_name = "CSV")]
    pub plot_pav: Option<PathBuf>,

    /// LR histogram data CSV.
    #[arg(long, value_name = "CSV")]
    pub plot_lr_histogram: Option<PathBuf>,

    #[arg(long, default_value_t = 20)]
    pub histogram_bins: usize,

    /// Render the PAV curve and LR histogram in the terminal.
    #[arg(long)]
    pub plot: bool,

    /// Plot width (columns).
    #[arg(long, default_value_t = 100)]
    pub width: usize,

    /// Plot height (rows).
    #[arg(long, default_value_t = 25)]
    pub height: usize,

    /// Save the fitted calibration model as JSON.
    #[arg(long, value_name = "JSON")]
    pub write_model: Option<PathBuf>,

    /// Evaluate with a saved model instead of fitting one.
    #[arg(long, value_name = "JSON", conflicts_with = "write_model")]
    pub load_model: Option<PathBuf>,

    #[arg(long)]
    pub parallel: bool,

    #[command(flatten)]
    pub cells: CellDbArgs,
}

#[derive(Debug, Args, Clone)]
pub struct SummarizeArgs {
    /// Measurements CSV.
    #[arg(long, value_name = "CSV")]
    pub measurements_file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cellscanner_defaults() {
        let cli = Cli::parse_from([
            "coloc",
            "generate-cellscanner-pairs",
            "--measurements-file",
            "m.csv",
            "--cell-db",
            "cells.csv",
            "--write-pairs",
            "p.db",
        ]);
        let Command::GenerateCellscannerPairs(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(args.max_delay, 0);
        assert_eq!(args.limit_colocated, 1000);
        assert_eq!(args.on_duplicate_cell, DuplicatePolicy::Drop);
    }

    #[test]
    fn duplicate_policy_accepts_both_spellings() {
        for spelling in ["take-first", "take_first"] {
            let cli = Cli::parse_from([
                "coloc",
                "pair-measurements",
                "--measurements-file",
                "m.csv",
                "--on-duplicate-cell",
                spelling,
            ]);
            let Command::PairMeasurements(args) = cli.command else {
                panic!("wrong subcommand");
            };
            assert_eq!(args.cells.on_duplicate_cell, DuplicatePolicy::TakeFirst);
        }
    }

    #[test]
    fn select_by_day_requires_background() {
        let res = Cli::try_parse_from([
            "coloc",
            "filter-pairs",
            "--pairs-file",
            "in.csv",
            "--write-pairs",
            "out.csv",
            "--select-by-day",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn holdout_conflicts_with_test_pairs() {
        let res = Cli::try_parse_from([
            "coloc",
            "evaluate-with-background",
            "--training-pairs",
            "train.csv",
            "--test-pairs",
            "test.csv",
            "--holdout-fraction",
            "0.2",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn background_mode_needs_training_pairs_and_no_model_file() {
        let parse = |extra: &[&str]| {
            let mut argv = vec!["coloc", "evaluate-with-background", "--background-measurements", "bg.csv"];
            argv.extend_from_slice(extra);
            Cli::try_parse_from(argv)
        };
        let Command::EvaluateWithBackground(args) = parse(&["--training-pairs", "t.db"]).unwrap().command else {
            panic!("wrong subcommand");
        };
        assert_eq!(args.min_background_delay, 86_400);
        assert!(parse(&["--load-model", "m.json", "--test-pairs", "t.db"]).is_err());
        assert!(parse(&["--training-pairs", "t.db", "--write-model", "m.json"]).is_err());
    }

    #[test]
    fn evaluate_needs_training_pairs_or_a_model() {
        assert!(Cli::try_parse_from(["coloc", "evaluate-with-background"]).is_err());
        assert!(
            Cli::try_parse_from([
                "coloc",
                "evaluate-with-background",
                "--load-model",
                "m.json",
                "--test-pairs",
                "t.csv"
            ])
            .is_ok()
        );
    }
}
