//! Formatted terminal output: run summaries and tables.
//!
//! Formatting lives in one place so the pairing/fitting code stays clean and
//! output changes are localized. Every summary reports what was excluded next to
//! what was produced, so dropped data is always visible.

use crate::data::LookupStats;
use crate::domain::Label;
use crate::eval::{EvaluationStats, LrRange};
use crate::models::CalibrationModel;
use crate::pairing::{BackgroundStats, PairingStats};
use crate::store::{DeviceSummary, MeasurementStore};

/// Row errors listed before the summary switches to a count.
const MAX_LISTED_ROW_ERRORS: usize = 5;

pub fn format_store_summary(title: &str, store: &MeasurementStore) -> String {
    let inc = store.inconsistencies();
    let mut out = String::new();
    out.push_str(&format!("=== {title} ===\n"));
    out.push_str(&format!(
        "Measurements: {} from {} device(s) | rows read: {}\n",
        store.len(),
        store.device_count(),
        store.rows_read()
    ));
    out.push_str(&format!(
        "Excluded: {} invalid row(s), {} repeated measurement(s)\n",
        inc.row_errors.len(),
        inc.duplicate_measurements
    ));
    for e in inc.row_errors.iter().take(MAX_LISTED_ROW_ERRORS) {
        out.push_str(&format!("  line {}: {}\n", e.line, e.message));
    }
    if inc.row_errors.len() > MAX_LISTED_ROW_ERRORS {
        out.push_str(&format!(
            "  ... and {} more\n",
            inc.row_errors.len() - MAX_LISTED_ROW_ERRORS
        ));
    }
    out
}

pub fn format_pairing_summary(stats: &PairingStats, lookup: Option<&LookupStats>) -> String {
    let mut out = String::new();
    out.push_str("Pairing:\n");
    out.push_str(&format!("- device pairs scanned : {}\n", stats.device_pairs));
    out.push_str(&format!(
        "- pairs written        : {} ({} colocated, {} dislocated)\n",
        stats.emitted(),
        stats.colocated,
        stats.dislocated
    ));
    out.push_str(&format!(
        "- excluded             : {} ambiguous, {} unresolvable, {} duplicate cell, {} over limit\n",
        stats.ambiguous, stats.unresolvable, stats.duplicate_cells, stats.over_limit
    ));
    if !stats.limits_reached.is_empty() {
        let labels: Vec<&str> = stats.limits_reached.iter().map(|l| l.as_str()).collect();
        out.push_str(&format!("- limit reached        : {}\n", labels.join(", ")));
    }
    if let Some(l) = lookup {
        out.push_str(&format!(
            "Cell lookups: {} backend, {} cached | {} duplicate, {} missing\n",
            l.backend_calls, l.cache_hits, l.duplicates, l.missing
        ));
    }
    out
}

pub fn format_background_summary(stats: &BackgroundStats) -> String {
    let mut out = String::new();
    out.push_str("Background calibration (one model per test pair):\n");
    out.push_str(&format!("- colocated training   : {}\n", stats.colocated_training));
    out.push_str(&format!(
        "- dislocated built     : {} ({} unresolvable)\n",
        stats.dislocated_built, stats.dislocated_unresolvable
    ));
    out.push_str(&format!("- test pairs w/o model : {}\n", stats.without_model));
    out
}

pub fn format_model_summary(model: &CalibrationModel) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Calibration: feature={} direction={:?} | trained on {} colocated, {} dislocated\n",
        model.feature.name(),
        model.direction,
        model.n_colocated,
        model.n_dislocated
    ));
    out.push_str(&format!(
        "LR bounds [{}, {}] | {} breakpoint(s)\n",
        fmt_lr(model.min_lr),
        fmt_lr(model.max_lr),
        model.breakpoints.len()
    ));

    out.push_str(&format!(
        "{:>14} {:>12} {:>8} {:>8}\n",
        "score >=", "lr", "n_coloc", "n_disl"
    ));
    out.push_str(&format!("{:-<14} {:-<12} {:-<8} {:-<8}\n", "", "", "", ""));
    for b in &model.breakpoints {
        out.push_str(&format!(
            "{:>14} {:>12} {:>8} {:>8}\n",
            format!("{:.3}", b.score),
            fmt_lr(b.lr),
            b.n_colocated,
            b.n_dislocated
        ));
    }
    out
}

pub fn format_evaluation_summary(stats: &EvaluationStats) -> String {
    let mut out = String::new();
    out.push_str("Evaluation:\n");
    out.push_str(&format!(
        "- pairs evaluated      : {} of {} ({} colocated, {} dislocated, {} unlabeled)\n",
        stats.evaluated, stats.input, stats.colocated, stats.dislocated, stats.unlabeled
    ));
    out.push_str(&format!("- unresolvable score   : {}\n", stats.unresolvable));
    out.push_str(&format!("- Cllr                 : {}\n", fmt_opt(stats.cllr)));
    out.push_str(&format!("- Cllr-min             : {}\n", fmt_opt(stats.cllr_min)));
    out.push_str(&format!("- Cllr-cal             : {}\n", fmt_opt(stats.cllr_cal())));
    out
}

/// Verbal-scale LR distribution, one row per range.
pub fn format_lr_distribution(ranges: &[LrRange]) -> String {
    let mut out = String::new();
    out.push_str("LR distribution:\n");
    out.push_str(&format!(
        "{:<44} {:>18} {:>10} {:>10}\n",
        "range", "lr", Label::Colocated.as_str(), Label::Dislocated.as_str()
    ));
    out.push_str(&format!("{:-<44} {:-<18} {:-<10} {:-<10}\n", "", "", "", ""));
    for r in ranges {
        out.push_str(&format!(
            "{:<44} {:>18} {:>10} {:>10}\n",
            truncate(r.name, 44),
            format!("[{}, {})", fmt_lr(r.lower), fmt_lr(r.upper)),
            r.colocated,
            r.dislocated
        ));
    }
    out
}

pub fn format_device_summary(rows: &[DeviceSummary]) -> String {
    let mut out = String::new();
    out.push_str(
        format!(
            "{:<24} {:<16} {:>8} {:<25} {:<25}",
            "device", "tracks", "count", "first", "last"
        )
        .trim_end(),
    );
    out.push('\n');
    out.push_str(format!("{:-<24} {:-<16} {:-<8} {:-<25} {:-<25}", "", "", "", "", "").trim_end());
    out.push('\n');
    for r in rows {
        out.push_str(
            format!(
                "{:<24} {:<16} {:>8} {:<25} {:<25}",
                truncate(&r.device, 24),
                truncate(&r.tracks.join(","), 16),
                r.count,
                r.first.format("%Y-%m-%d %H:%M:%S"),
                r.last.format("%Y-%m-%d %H:%M:%S"),
            )
            .trim_end(),
        );
        out.push('\n');
    }
    out
}

fn fmt_lr(lr: f64) -> String {
    if lr.is_infinite() {
        "inf".to_string()
    } else if lr == 0.0 {
        "0".to_string()
    } else if (0.01..1e4).contains(&lr) {
        format!("{lr:.3}")
    } else {
        format!("{lr:.1e}")
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map_or_else(|| "n/a (needs both labels)".to_string(), |v| format!("{v:.4}"))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn pairing_summary_reports_exclusions_and_limits() {
        let stats = PairingStats {
            device_pairs: 3,
            colocated: 10,
            dislocated: 4,
            ambiguous: 2,
            unresolvable: 1,
            duplicate_cells: 5,
            over_limit: 7,
            limits_reached: vec![Label::Colocated],
        };
        let text = format_pairing_summary(&stats, None);
        assert!(text.contains("14 (10 colocated, 4 dislocated)"));
        assert!(text.contains("2 ambiguous, 1 unresolvable, 5 duplicate cell, 7 over limit"));
        assert!(text.contains("limit reached        : colocated"));
        assert!(!text.contains("Cell lookups"));
    }

    #[test]
    fn background_summary_counts_models_and_pairs() {
        let stats = BackgroundStats {
            colocated_training: 12,
            dislocated_built: 40,
            dislocated_unresolvable: 3,
            without_model: 1,
        };
        let text = format_background_summary(&stats);
        assert!(text.contains("colocated training   : 12"));
        assert!(text.contains("40 (3 unresolvable)"));
        assert!(text.contains("w/o model : 1"));
    }

    #[test]
    fn evaluation_summary_marks_missing_cost() {
        let stats = EvaluationStats {
            input: 3,
            evaluated: 3,
            colocated: 3,
            ..EvaluationStats::default()
        };
        assert!(format_evaluation_summary(&stats).contains("n/a"));
    }

    #[test]
    fn lr_formatting_switches_to_exponent_outside_the_readable_band() {
        assert_eq!(fmt_lr(2.0), "2.000");
        assert_eq!(fmt_lr(1e-5), "1.0e-5");
        assert_eq!(fmt_lr(f64::INFINITY), "inf");
    }

    #[test]
    fn device_table_has_one_row_per_device() {
        let t = Utc.with_ymd_and_hms(2023, 5, 1, 10, 0, 0).unwrap();
        let rows = vec![DeviceSummary {
            device: "a-very-long-device-name-that-does-not-fit".to_string(),
            tracks: vec!["t1".to_string()],
            count: 12,
            first: t,
            last: t,
        }];
        let text = format_device_summary(&rows);
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("2023-05-01 10:00:00"));
        assert!(text.lines().nth(2).unwrap().starts_with("a-very-long-device-name."));
    }
}
