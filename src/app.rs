//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments and sets up logging
//! - builds the `RunConfig` for the chosen command
//! - runs the pipeline steps in `pipeline`
//! - prints reports/plots and writes the requested files

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{
    CellscannerPairsArgs, Cli, Command, EvaluateArgs, FilterPairsArgs, PairMeasurementsArgs, SummarizeArgs,
};
use crate::data::{CachedCellLookup, CellDatabase};
use crate::domain::{PairRecord, RunConfig};
use crate::error::AppError;
use crate::eval::{EvaluationResult, Evaluator};
use crate::features::FeatureExtractor;
use crate::pairing::{DeviceGroups, PairingPolicy, ProximityPolicy, TrackPolicy};
use crate::store::MeasurementStore;

pub mod pipeline;

/// Entry point for the `coloc` binary.
pub fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = run_config_from_args(&cli.command);
    match &cli.command {
        Command::PairMeasurements(args) => handle_pair_measurements(args, &config),
        Command::GenerateCellscannerPairs(args) => handle_cellscanner_pairs(args, &config),
        Command::FilterPairs(args) => handle_filter_pairs(args, &config),
        Command::EvaluateWithBackground(args) => handle_evaluate(args, &config),
        Command::Summarize(args) => handle_summarize(args, &config),
    }
}

/// Logs go to stderr; `RUST_LOG` (also read from `.env`) overrides `-v`.
fn init_logging(verbose: u8) {
    dotenvy::dotenv().ok();
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run_config_from_args(command: &Command) -> RunConfig {
    let base = RunConfig::default();
    match command {
        Command::PairMeasurements(a) => RunConfig {
            max_delay_secs: a.max_delay,
            limit_colocated: a.limit_colocated,
            limit_dislocated: a.limit_dislocated,
            allow_same_device: a.allow_same_device,
            drop_repeated_measurements: !a.keep_repeated_measurements,
            parallel: a.parallel,
            on_duplicate_cell: a.cells.on_duplicate_cell,
            ..base
        },
        Command::GenerateCellscannerPairs(a) => RunConfig {
            max_delay_secs: a.max_delay,
            limit_colocated: Some(a.limit_colocated),
            limit_dislocated: Some(a.limit_dislocated),
            drop_repeated_measurements: !a.keep_repeated_measurements,
            parallel: a.parallel,
            on_duplicate_cell: a.on_duplicate_cell,
            colocated_radius_m: a.colocated_radius,
            dislocated_min_distance_m: a.dislocated_min_distance,
            ..base
        },
        Command::FilterPairs(a) => RunConfig {
            max_delay_secs: a.max_delay.unwrap_or(base.max_delay_secs),
            on_duplicate_cell: a.cells.on_duplicate_cell,
            feature: a.feature,
            ..base
        },
        Command::EvaluateWithBackground(a) => RunConfig {
            max_delay_secs: a.max_delay.unwrap_or(base.max_delay_secs),
            parallel: a.parallel,
            on_duplicate_cell: a.cells.on_duplicate_cell,
            feature: a.feature,
            direction: a.direction,
            min_lr: a.min_lr,
            max_lr: a.max_lr,
            histogram_bins: a.histogram_bins,
            ..base
        },
        Command::Summarize(_) => base,
    }
}

fn handle_pair_measurements(args: &PairMeasurementsArgs, config: &RunConfig) -> Result<(), AppError> {
    let store = MeasurementStore::load(&args.measurements_file, config)?;
    let policy: Box<dyn PairingPolicy> = match &args.colocation_groups {
        Some(path) => Box::new(DeviceGroups::load(path)?),
        None => Box::new(TrackPolicy),
    };
    let cells = pipeline::load_cell_db(args.cells.cell_db.as_deref())?;
    let run = pipeline::pair_measurements(
        &store,
        config,
        policy.as_ref(),
        cells.as_ref().map(|c| c as &dyn CellDatabase),
    )?;

    // Stdout may carry the pairs themselves; summaries then go to stderr.
    let summary = format!(
        "{}{}",
        crate::report::format_store_summary("coloc - pair measurements", &store),
        crate::report::format_pairing_summary(&run.stats, run.lookup.as_ref())
    );
    match &args.write_pairs {
        Some(path) => {
            crate::io::write_pairs(path, &run.pairs)?;
            println!("{summary}");
        }
        None => {
            crate::io::write_pairs(std::path::Path::new("-"), &run.pairs)?;
            eprintln!("{summary}");
        }
    }
    Ok(())
}

fn handle_cellscanner_pairs(args: &CellscannerPairsArgs, config: &RunConfig) -> Result<(), AppError> {
    let policy = ProximityPolicy::new(config)?;
    let store = MeasurementStore::load(&args.measurements_file, config)?;
    let cells = crate::data::CellTable::load(&args.cell_db)?;
    let run = pipeline::pair_measurements(&store, config, &policy, Some(&cells))?;

    crate::io::write_pairs(&args.write_pairs, &run.pairs)?;
    println!(
        "{}{}",
        crate::report::format_store_summary("coloc - cellscanner pairs", &store),
        crate::report::format_pairing_summary(&run.stats, run.lookup.as_ref())
    );
    Ok(())
}

fn handle_filter_pairs(args: &FilterPairsArgs, config: &RunConfig) -> Result<(), AppError> {
    let pairs = crate::io::read_pairs(&args.pairs_file)?;

    let background = match (&args.background_measurements, args.select_by_day) {
        (Some(path), true) => Some(MeasurementStore::load(path, config)?),
        (None, true) => {
            return Err(AppError::input(
                "--select-by-day needs --background-measurements to rank cells.",
            ));
        }
        _ => None,
    };
    let cells = pipeline::load_cell_db(args.cells.cell_db.as_deref())?;
    let lookup = cells
        .as_ref()
        .map(|c| CachedCellLookup::new(c, config.on_duplicate_cell));
    let extractor = FeatureExtractor::new(config, lookup.as_ref());

    let opts = pipeline::FilterOptions {
        max_delay_secs: args.max_delay,
        label: args.label,
        select_by_day: background.as_ref(),
        extract_features: args.extract_features.then_some(&extractor),
        clear_geo_data: args.clear_geo_data,
    };
    let (pairs, stats) = pipeline::filter_pairs(pairs, &opts)?;
    crate::io::write_pairs(&args.write_pairs, &pairs)?;

    println!("=== coloc - filter pairs ===");
    println!(
        "Pairs: {} read -> {} after delay -> {} after label -> {} after day selection",
        stats.input, stats.after_delay, stats.after_label, stats.after_day
    );
    if args.extract_features {
        println!("Unresolvable scores: {}", stats.unresolvable);
    }
    println!("{}", format_label_counts("Written", &pairs));
    Ok(())
}

fn handle_evaluate(args: &EvaluateArgs, config: &RunConfig) -> Result<(), AppError> {
    let source = pipeline::EvaluationSource {
        training: args.training_pairs.as_deref(),
        test: args.test_pairs.as_deref(),
        holdout_fraction: args.holdout_fraction,
        seed: args.seed,
        max_delay_secs: args.max_delay,
    };
    let data = pipeline::load_evaluation_pairs(&source)?;

    let cells = pipeline::load_cell_db(args.cells.cell_db.as_deref())?;
    let lookup = cells
        .as_ref()
        .map(|c| CachedCellLookup::new(c, config.on_duplicate_cell));
    let extractor = FeatureExtractor::new(config, lookup.as_ref());

    if let Some(path) = &args.background_measurements {
        let background = MeasurementStore::load(path, config)?;
        let eval = pipeline::evaluate_with_background(
            &data.test,
            &data.train,
            &background,
            &extractor,
            config,
            args.min_background_delay,
            args.seed,
        )?;
        print_evaluation_header(&data);
        println!("{}", crate::report::format_store_summary("Background measurements", &background));
        println!("{}", crate::report::format_background_summary(&eval.stats));
        return finish_evaluation(args, &eval.result, lookup.as_ref());
    }

    let model = match &args.load_model {
        Some(path) => crate::io::read_model_json(path)?,
        None => pipeline::fit_calibration(&data.train, &extractor, config)?,
    };
    if let Some(path) = &args.write_model {
        crate::io::write_model_json(path, &model)?;
    }

    let evaluator = Evaluator::new(config, &model, &extractor)?;
    let result = evaluator.evaluate(&data.test)?;

    print_evaluation_header(&data);
    println!("{}", crate::report::format_model_summary(&model));
    finish_evaluation(args, &result, lookup.as_ref())
}

fn print_evaluation_header(data: &pipeline::EvaluationPairs) {
    println!("=== coloc - evaluate with background ===");
    if !data.train.is_empty() {
        println!("{}", format_label_counts("Training", &data.train));
    }
    println!("{}", format_label_counts("Test", &data.test));
    if data.self_validation {
        println!("(self-validation: test pairs are the training pairs)");
    }
    println!();
}

/// Shared tail of both evaluation modes: summaries, plots and output files.
fn finish_evaluation(
    args: &EvaluateArgs,
    result: &EvaluationResult<'_>,
    lookup: Option<&CachedCellLookup<'_>>,
) -> Result<(), AppError> {
    println!("{}", crate::report::format_evaluation_summary(&result.stats));
    println!("{}", crate::report::format_lr_distribution(&result.distribution));
    if let Some(stats) = lookup.map(CachedCellLookup::stats) {
        println!(
            "Cell lookups: {} backend, {} cached | {} duplicate, {} missing",
            stats.backend_calls, stats.cache_hits, stats.duplicates, stats.missing
        );
    }

    if args.plot {
        println!("{}", crate::plot::render_pav_plot(&result.pav_curve, args.width, args.height));
        println!("{}", crate::plot::render_lr_histogram(&result.histogram, args.width));
    }

    write_evaluation_outputs(args, result)
}

fn write_evaluation_outputs(args: &EvaluateArgs, result: &EvaluationResult<'_>) -> Result<(), AppError> {
    if let Some(path) = &args.write_results {
        crate::io::write_results_csv(path, &result.results)?;
    }
    if let Some(path) = &args.plot_pav {
        crate::io::write_pav_csv(path, &result.pav_curve)?;
    }
    if let Some(path) = &args.plot_lr_histogram {
        crate::io::write_histogram_csv(path, &result.histogram)?;
    }
    Ok(())
}

fn handle_summarize(args: &SummarizeArgs, config: &RunConfig) -> Result<(), AppError> {
    let store = MeasurementStore::load(&args.measurements_file, config)?;
    let rows = store.summarize();
    info!(devices = rows.len(), "summarized measurements");
    println!("{}", crate::report::format_store_summary("coloc - summarize", &store));
    println!("{}", crate::report::format_device_summary(&rows));
    Ok(())
}

fn format_label_counts(what: &str, pairs: &[PairRecord]) -> String {
    let count = |label| pairs.iter().filter(|p| p.label == Some(label)).count();
    let colocated = count(crate::domain::Label::Colocated);
    let dislocated = count(crate::domain::Label::Dislocated);
    format!(
        "{what}: {} cell measurement pairs ({colocated} colocated; {dislocated} dislocated; {} unlabeled)",
        pairs.len(),
        pairs.len() - colocated - dislocated
    )
}
