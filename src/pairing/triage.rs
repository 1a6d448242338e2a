//! Reducing a pair set: delay/label filters and one-pair-per-day selection.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};

use crate::domain::{CellIdentity, Label, Measurement, PairRecord};
use crate::store::MeasurementStore;

/// Start of the first day interval: 2000-01-01 05:00 UTC.
///
/// Days start in the early morning so that a night of measurements is not
/// split over two intervals.
pub fn day_anchor() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(946_702_800)
}

/// Pairs with `0 <= delay <= max_delay_secs`.
pub fn select_by_delay(pairs: Vec<PairRecord>, max_delay_secs: u64) -> Vec<PairRecord> {
    let max = max_delay_secs as f64;
    pairs
        .into_iter()
        .filter(|p| (0.0..=max).contains(&p.delay_secs))
        .collect()
}

pub fn select_by_label(pairs: Vec<PairRecord>, label: Label) -> Vec<PairRecord> {
    pairs.into_iter().filter(|p| p.label == Some(label)).collect()
}

/// Intervals of length `duration`, aligned to `start`, that contain at least one timestamp.
///
/// Returned sorted and without repeats; `start` may lie after some timestamps.
pub fn extract_intervals(
    timestamps: impl IntoIterator<Item = DateTime<Utc>>,
    start: DateTime<Utc>,
    duration: Duration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let step = duration.num_milliseconds().max(1);
    let mut seqs: Vec<i64> = timestamps
        .into_iter()
        .map(|ts| (ts - start).num_milliseconds().div_euclid(step))
        .collect();
    seqs.sort_unstable();
    seqs.dedup();
    seqs.into_iter()
        .map(|n| {
            let from = start + Duration::milliseconds(n * step);
            (from, from + Duration::milliseconds(step))
        })
        .collect()
}

/// At most one pair per day per (left device, right device), using 24 h
/// intervals from [`day_anchor`].
pub fn select_by_day(pairs: &[PairRecord], background: &MeasurementStore) -> Vec<PairRecord> {
    let intervals = extract_intervals(pairs.iter().map(|p| p.left.timestamp), day_anchor(), Duration::hours(24));
    select_by_right_cell_rarity(pairs, background, &intervals)
}

/// For every device combination and interval, keep the pair whose left
/// measurement falls in `[start, end)` and whose right cell is most frequent in
/// the right device's background measurements *outside* that interval.
///
/// Ties go to the smaller delay, then to the earlier left timestamp, then to
/// input order. Output is ordered by right device, left device, interval.
pub fn select_by_right_cell_rarity(
    pairs: &[PairRecord],
    background: &MeasurementStore,
    intervals: &[(DateTime<Utc>, DateTime<Utc>)],
) -> Vec<PairRecord> {
    let mut groups: BTreeMap<(&str, &str), Vec<&PairRecord>> = BTreeMap::new();
    for p in pairs {
        groups
            .entry((p.right.device.as_str(), p.left.device.as_str()))
            .or_default()
            .push(p);
    }

    let mut selected = Vec::new();
    for ((right_device, _), group) in groups {
        let device_background = background.get_by_device(right_device).unwrap_or(&[]);
        let totals = cell_counts(device_background);

        for &(start, end) in intervals {
            let candidates = group
                .iter()
                .filter(|p| p.left.timestamp >= start && p.left.timestamp < end);

            let lo = device_background.partition_point(|m| m.timestamp < start);
            let hi = device_background.partition_point(|m| m.timestamp < end);
            let inside = cell_counts(&device_background[lo..hi.max(lo)]);
            let outside = |cell: &CellIdentity| {
                totals.get(cell).copied().unwrap_or(0) - inside.get(cell).copied().unwrap_or(0)
            };

            let best = candidates.min_by(|a, b| {
                outside(&b.right.cell)
                    .cmp(&outside(&a.right.cell))
                    .then(a.delay_secs.total_cmp(&b.delay_secs))
                    .then(a.left.timestamp.cmp(&b.left.timestamp))
            });
            if let Some(best) = best {
                selected.push((*best).clone());
            }
        }
    }
    selected
}

fn cell_counts(measurements: &[Measurement]) -> HashMap<&CellIdentity, usize> {
    let mut counts = HashMap::new();
    for m in measurements {
        *counts.entry(&m.cell).or_insert(0) += 1;
    }
    counts
}
