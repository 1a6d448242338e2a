//! Pair generation.
//!
//! Candidate pairs are enumerated per device pair in sorted device order. For
//! every measurement of the left device, the right device's measurements within
//! `[t - max_delay, t + max_delay]` are taken with two binary searches. The
//! configured `PairingPolicy` labels each candidate; per-label limits are then
//! applied first-reached-first-kept over the concatenated candidate stream.
//!
//! Because limits are applied after concatenation in a fixed order, the emitted
//! pair set is the same with and without rayon parallelism. Both paths stop
//! admitting device pairs once every limited label is full; the sequential path
//! also stops scanning there, the parallel one discards the surplus scans along
//! with any error they carry.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::data::{CachedCellLookup, Resolution};
use crate::domain::{Label, Measurement, Pair, PairRecord, RunConfig};
use crate::error::AppError;
use crate::pairing::policy::PairingPolicy;
use crate::store::{MeasurementStore, time_window};

/// Counters of a pairing run. Everything that was looked at but not emitted is
/// accounted for in one of the exclusion counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairingStats {
    pub device_pairs: usize,
    pub colocated: usize,
    pub dislocated: usize,
    /// Candidates the policy could not label.
    pub ambiguous: usize,
    /// Candidates with a cell missing from the cell database.
    pub unresolvable: usize,
    /// Candidates dropped because a cell had several records (policy `drop`).
    pub duplicate_cells: usize,
    /// Candidates rejected because their label's limit was already reached.
    pub over_limit: usize,
    /// Labels whose limit was reached, in the order they filled up.
    pub limits_reached: Vec<Label>,
}

impl PairingStats {
    pub fn emitted(&self) -> usize {
        self.colocated + self.dislocated
    }

    pub fn count(&self, label: Label) -> usize {
        match label {
            Label::Colocated => self.colocated,
            Label::Dislocated => self.dislocated,
        }
    }

    pub fn excluded(&self) -> usize {
        self.ambiguous + self.unresolvable + self.duplicate_cells
    }

    fn bump(&mut self, label: Label) {
        match label {
            Label::Colocated => self.colocated += 1,
            Label::Dislocated => self.dislocated += 1,
        }
    }
}

/// Emitted pairs plus the stats that explain them.
#[derive(Debug, Clone)]
pub struct GeneratedPairs<T> {
    pub pairs: Vec<T>,
    pub stats: PairingStats,
}

/// Verdict of the per-candidate screening step.
enum Screened<T> {
    Keep(T),
    Unresolvable,
    DuplicateDropped,
}

/// Candidates of one device pair, before limits.
struct Scan<T> {
    items: Vec<(Label, T)>,
    ambiguous: usize,
    unresolvable: usize,
    duplicate_cells: usize,
}

pub struct PairGenerator<'a> {
    config: &'a RunConfig,
    policy: &'a dyn PairingPolicy,
}

impl<'a> PairGenerator<'a> {
    pub fn new(config: &'a RunConfig, policy: &'a dyn PairingPolicy) -> Self {
        Self { config, policy }
    }

    /// Same-dataset pairing: labeled pairs borrowing from `store`.
    pub fn generate<'s>(&self, store: &'s MeasurementStore) -> Result<GeneratedPairs<Pair<'s>>, AppError> {
        self.run(store, |pair| Ok(Screened::Keep(pair)))
    }

    /// Background pairing: every emitted pair has both antenna positions resolved.
    ///
    /// Cell resolution happens before limits are applied, so a pair that cannot
    /// be resolved never takes a slot from one that can.
    pub fn generate_resolved(
        &self,
        store: &MeasurementStore,
        lookup: &CachedCellLookup<'_>,
    ) -> Result<GeneratedPairs<PairRecord>, AppError> {
        self.run(store, |pair| {
            let left = lookup.resolve(&pair.left.cell, pair.left.timestamp)?;
            let right = lookup.resolve(&pair.right.cell, pair.right.timestamp)?;
            Ok(match (left.site(), right.site()) {
                (Some(l), Some(r)) => Screened::Keep(PairRecord::from_pair(&pair, Some(l.position), Some(r.position))),
                _ if is_dropped_duplicate(&left) || is_dropped_duplicate(&right) => Screened::DuplicateDropped,
                _ => Screened::Unresolvable,
            })
        })
    }

    fn run<'s, T, F>(&self, store: &'s MeasurementStore, screen: F) -> Result<GeneratedPairs<T>, AppError>
    where
        T: Send,
        F: Fn(Pair<'s>) -> Result<Screened<T>, AppError> + Sync,
    {
        let device_pairs = self.device_pairs(store)?;
        let mut stats = PairingStats {
            device_pairs: device_pairs.len(),
            ..PairingStats::default()
        };
        let mut pairs = Vec::new();

        info!(
            policy = self.policy.name(),
            device_pairs = device_pairs.len(),
            max_delay_secs = self.config.max_delay_secs,
            parallel = self.config.parallel,
            "generating pairs"
        );

        if self.config.parallel {
            // Errors stay attached to their device pair so that one the
            // sequential scan would never reach cannot abort the run.
            let scans: Vec<Result<Scan<T>, AppError>> = device_pairs
                .par_iter()
                .map(|&(left, right, same)| self.scan(left, right, same, &screen))
                .collect();
            for scan in scans {
                if self.limits_full(&stats) {
                    debug!("all pair limits reached; ignoring remaining scans");
                    break;
                }
                self.admit(scan?, &mut pairs, &mut stats);
            }
        } else {
            for &(left, right, same) in &device_pairs {
                if self.limits_full(&stats) {
                    debug!("all pair limits reached; stopping scan early");
                    break;
                }
                let scan = self.scan(left, right, same, &screen)?;
                self.admit(scan, &mut pairs, &mut stats);
            }
        }

        info!(
            colocated = stats.colocated,
            dislocated = stats.dislocated,
            ambiguous = stats.ambiguous,
            unresolvable = stats.unresolvable,
            duplicate_cells = stats.duplicate_cells,
            "pair generation done"
        );
        Ok(GeneratedPairs { pairs, stats })
    }

    /// (left, right, same_device) measurement lists in deterministic order.
    #[allow(clippy::type_complexity)]
    fn device_pairs<'s>(
        &self,
        store: &'s MeasurementStore,
    ) -> Result<Vec<(&'s [Measurement], &'s [Measurement], bool)>, AppError> {
        let lists = store
            .devices()
            .map(|d| store.get_by_device(d))
            .collect::<Result<Vec<_>, AppError>>()?;

        let mut out = Vec::new();
        for (i, &left) in lists.iter().enumerate() {
            if self.config.allow_same_device {
                out.push((left, left, true));
            }
            for &right in &lists[i + 1..] {
                out.push((left, right, false));
            }
        }
        Ok(out)
    }

    fn scan<'s, T, F>(
        &self,
        left: &'s [Measurement],
        right: &'s [Measurement],
        same_device: bool,
        screen: &F,
    ) -> Result<Scan<T>, AppError>
    where
        F: Fn(Pair<'s>) -> Result<Screened<T>, AppError>,
    {
        let max_delay = self.config.max_delay();
        let mut scan = Scan {
            items: Vec::new(),
            ambiguous: 0,
            unresolvable: 0,
            duplicate_cells: 0,
        };

        for l in left {
            let from = l.timestamp.checked_sub_signed(max_delay).unwrap_or(DateTime::<Utc>::MIN_UTC);
            let to = l.timestamp.checked_add_signed(max_delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
            for r in time_window(right, from, to) {
                // Within one device each unordered pair is visited once, never with itself.
                if same_device && r.id <= l.id {
                    continue;
                }
                let Some(label) = self.policy.label(l, r) else {
                    scan.ambiguous += 1;
                    continue;
                };
                let pair = Pair { left: l, right: r, label };
                if pair.delay() > max_delay {
                    continue;
                }
                match screen(pair)? {
                    Screened::Keep(item) => scan.items.push((label, item)),
                    Screened::Unresolvable => scan.unresolvable += 1,
                    Screened::DuplicateDropped => scan.duplicate_cells += 1,
                }
            }
        }
        Ok(scan)
    }

    fn admit<T>(&self, scan: Scan<T>, out: &mut Vec<T>, stats: &mut PairingStats) {
        stats.ambiguous += scan.ambiguous;
        stats.unresolvable += scan.unresolvable;
        stats.duplicate_cells += scan.duplicate_cells;

        for (label, item) in scan.items {
            if let Some(limit) = self.config.limit_for(label).filter(|&n| stats.count(label) >= n) {
                stats.over_limit += 1;
                if !stats.limits_reached.contains(&label) {
                    warn!(label = %label, limit, "pair limit reached; further {label} pairs are skipped");
                    stats.limits_reached.push(label);
                }
                continue;
            }
            stats.bump(label);
            out.push(item);
        }
    }

    fn limits_full(&self, stats: &PairingStats) -> bool {
        [Label::Colocated, Label::Dislocated]
            .into_iter()
            .all(|label| self.config.limit_for(label).is_some_and(|n| stats.count(label) >= n))
    }
}

fn is_dropped_duplicate(resolution: &Resolution) -> bool {
    matches!(resolution, Resolution::Duplicate { site: None, .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CellTable;
    use crate::domain::{CellIdentity, CellSite, DuplicatePolicy, GeoPoint, MeasurementId, Radio};
    use crate::error::ErrorKind;
    use crate::pairing::policy::{ProximityPolicy, TrackPolicy};
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    fn m(id: u64, device: &str, track: &str, secs: i64, eci: u64) -> Measurement {
        Measurement {
            id: MeasurementId(id),
            device: device.to_string(),
            track: Some(track.to_string()),
            timestamp: Utc.with_ymd_and_hms(2023, 5, 1, 10, 0, 0).unwrap() + Duration::seconds(secs),
            cell: CellIdentity::eci(Radio::Lte, 204, 8, eci).unwrap(),
            position: None,
        }
    }

    /// Three devices: a and b travel together, c elsewhere; one measurement a minute.
    fn fixture() -> MeasurementStore {
        let mut all = Vec::new();
        let mut id = 0;
        for (device, track, offset) in [("a", "car", 0), ("b", "car", 5), ("c", "bike", 20)] {
            for k in 0..10 {
                id += 1;
                all.push(m(id, device, track, k * 60 + offset, (k % 3) as u64));
            }
        }
        MeasurementStore::from_measurements(all, &RunConfig::default())
    }

    fn config(max_delay_secs: u64) -> RunConfig {
        RunConfig {
            max_delay_secs,
            ..RunConfig::default()
        }
    }

    #[test]
    fn pairs_respect_delay_and_never_pair_a_device_with_itself() {
        let store = fixture();
        let cfg = config(30);
        let out = PairGenerator::new(&cfg, &TrackPolicy).generate(&store).unwrap();
        assert!(!out.pairs.is_empty());
        for p in &out.pairs {
            assert!(p.delay() <= Duration::seconds(30));
            assert_ne!(p.left.device, p.right.device);
        }
        // a-b are 5 s apart (10 pairs), a-c 20 s (10), b-c 15 s (10).
        assert_eq!(out.stats.colocated, 10);
        assert_eq!(out.stats.dislocated, 20);
        assert_eq!(out.stats.device_pairs, 3);
    }

    #[test]
    fn zero_delay_only_pairs_simultaneous_measurements() {
        let store = MeasurementStore::from_measurements(
            vec![m(1, "a", "x", 0, 1), m(2, "b", "x", 0, 2), m(3, "b", "x", 1, 2)],
            &RunConfig::default(),
        );
        let cfg = config(0);
        let out = PairGenerator::new(&cfg, &TrackPolicy).generate(&store).unwrap();
        assert_eq!(out.pairs.len(), 1);
        assert_eq!(out.pairs[0].right.id, MeasurementId(2));
    }

    #[test]
    fn same_device_pairs_only_when_allowed() {
        let store = MeasurementStore::from_measurements(
            vec![m(1, "a", "x", 0, 1), m(2, "a", "x", 10, 2), m(3, "a", "x", 20, 3)],
            &RunConfig::default(),
        );
        let mut cfg = config(15);
        let out = PairGenerator::new(&cfg, &TrackPolicy).generate(&store).unwrap();
        assert!(out.pairs.is_empty());

        cfg.allow_same_device = true;
        let out = PairGenerator::new(&cfg, &TrackPolicy).generate(&store).unwrap();
        let ids: Vec<(u64, u64)> = out.pairs.iter().map(|p| (p.left.id.0, p.right.id.0)).collect();
        assert_eq!(ids, vec![(1, 2), (2, 3)]);
    }

    #[test]
    fn limits_are_first_reached_first_kept() {
        let store = fixture();
        let cfg = RunConfig {
            limit_colocated: Some(3),
            limit_dislocated: Some(4),
            ..config(30)
        };
        let out = PairGenerator::new(&cfg, &TrackPolicy).generate(&store).unwrap();
        assert_eq!(out.stats.colocated, 3);
        assert_eq!(out.stats.dislocated, 4);
        assert_eq!(out.stats.limits_reached, vec![Label::Colocated, Label::Dislocated]);

        // The kept colocated pairs are the earliest a-b pairs.
        let kept: Vec<u64> = out
            .pairs
            .iter()
            .filter(|p| p.label == Label::Colocated)
            .map(|p| p.left.id.0)
            .collect();
        assert_eq!(kept, vec![1, 2, 3]);
    }

    #[test]
    fn parallel_and_sequential_runs_emit_identical_pairs() {
        let store = fixture();
        let seq_cfg = RunConfig {
            limit_dislocated: Some(7),
            ..config(120)
        };
        let par_cfg = RunConfig {
            parallel: true,
            ..seq_cfg.clone()
        };
        let key = |p: &Pair<'_>| (p.left.id, p.right.id, p.label);
        let seq: Vec<_> = PairGenerator::new(&seq_cfg, &TrackPolicy)
            .generate(&store)
            .unwrap()
            .pairs
            .iter()
            .map(key)
            .collect();
        let par: Vec<_> = PairGenerator::new(&par_cfg, &TrackPolicy)
            .generate(&store)
            .unwrap()
            .pairs
            .iter()
            .map(key)
            .collect();
        assert_eq!(seq, par);
    }

    fn positioned(id: u64, device: &str, secs: i64, eci: u64, lat: f64) -> Measurement {
        Measurement {
            position: Some(GeoPoint::new(5.0, lat)),
            track: None,
            ..m(id, device, "", secs, eci)
        }
    }

    fn site(eci: u64, lat: f64) -> CellSite {
        CellSite {
            cell: CellIdentity::eci(Radio::Lte, 204, 8, eci).unwrap(),
            position: GeoPoint::new(5.0, lat),
            azimuth: None,
            valid_from: None,
            valid_to: None,
        }
    }

    #[test]
    fn resolved_generation_counts_missing_and_duplicate_cells() {
        let store = MeasurementStore::from_measurements(
            vec![
                positioned(1, "a", 0, 1, 52.0),
                positioned(2, "b", 1, 1, 52.0),
                positioned(3, "a", 100, 2, 52.0),
                positioned(4, "b", 101, 9, 52.0),
                positioned(5, "a", 200, 3, 52.0),
                positioned(6, "b", 201, 1, 52.5),
            ],
            &RunConfig::default(),
        );
        // Cell 3 has two records; cell 9 has none.
        let table = CellTable::new(vec![site(1, 52.0), site(2, 52.01), site(3, 52.0), site(3, 52.1)]);
        let cfg = config(5);
        let policy = ProximityPolicy::new(&cfg).unwrap();

        let lookup = CachedCellLookup::new(&table, DuplicatePolicy::Drop);
        let out = PairGenerator::new(&cfg, &policy).generate_resolved(&store, &lookup).unwrap();
        assert_eq!(out.pairs.len(), 1);
        assert_eq!(out.stats.colocated, 1);
        assert_eq!(out.stats.unresolvable, 1);
        assert_eq!(out.stats.duplicate_cells, 1);
        assert_eq!(out.pairs[0].left.site, Some(GeoPoint::new(5.0, 52.0)));

        let lookup = CachedCellLookup::new(&table, DuplicatePolicy::TakeFirst);
        let out = PairGenerator::new(&cfg, &policy).generate_resolved(&store, &lookup).unwrap();
        assert_eq!(out.stats.emitted(), 2);
        assert_eq!(out.stats.dislocated, 1);

        let lookup = CachedCellLookup::new(&table, DuplicatePolicy::Error);
        let err = PairGenerator::new(&cfg, &policy).generate_resolved(&store, &lookup).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateCell);
    }

    #[test]
    fn unreached_duplicate_cells_do_not_abort_a_parallel_run() {
        // a and b share a clean cell; c sits on a cell with two records.
        let store = MeasurementStore::from_measurements(
            vec![m(1, "a", "car", 0, 1), m(2, "b", "car", 1, 1), m(3, "c", "bike", 2, 2)],
            &RunConfig::default(),
        );
        let table = CellTable::new(vec![site(1, 52.0), site(2, 52.0), site(2, 52.1)]);
        let seq_cfg = RunConfig {
            limit_colocated: Some(1),
            limit_dislocated: Some(0),
            ..config(10)
        };
        let par_cfg = RunConfig {
            parallel: true,
            ..seq_cfg.clone()
        };

        let run = |cfg: &RunConfig| {
            let lookup = CachedCellLookup::new(&table, DuplicatePolicy::Error);
            PairGenerator::new(cfg, &TrackPolicy)
                .generate_resolved(&store, &lookup)
                .map(|out| out.pairs)
        };
        let seq = run(&seq_cfg).unwrap();
        let par = run(&par_cfg).unwrap();
        assert_eq!(seq.len(), 1);
        assert_eq!(seq, par);

        // Without limits both modes reach the duplicate and fail alike.
        let open = RunConfig { parallel: true, ..config(10) };
        assert_eq!(run(&open).unwrap_err().kind(), ErrorKind::DuplicateCell);
        assert_eq!(run(&config(10)).unwrap_err().kind(), ErrorKind::DuplicateCell);
    }

    proptest! {
        #[test]
        fn delay_and_limit_invariants_hold(
            offsets in prop::collection::vec((0usize..4, 0i64..3_600), 1..60),
            max_delay in 0u64..600,
            limit_colocated in prop::option::of(0usize..20),
            limit_dislocated in prop::option::of(0usize..20),
        ) {
            let measurements = offsets
                .iter()
                .enumerate()
                .map(|(i, &(d, secs))| {
                    let device = format!("d{d}");
                    let track = if d < 2 { "t0" } else { "t1" };
                    m(i as u64 + 1, &device, track, secs, 1)
                })
                .collect::<Vec<_>>();
            let store = MeasurementStore::from_measurements(measurements, &RunConfig { drop_repeated_measurements: false, ..RunConfig::default() });
            let cfg = RunConfig { limit_colocated, limit_dislocated, ..config(max_delay) };
            let out = PairGenerator::new(&cfg, &TrackPolicy).generate(&store).unwrap();

            for p in &out.pairs {
                prop_assert!(p.delay() >= Duration::zero());
                prop_assert!(p.delay() <= Duration::seconds(max_delay as i64));
                prop_assert_ne!(&p.left.device, &p.right.device);
            }
            let colocated = out.pairs.iter().filter(|p| p.label == Label::Colocated).count();
            let dislocated = out.pairs.len() - colocated;
            prop_assert!(limit_colocated.is_none_or(|n| colocated <= n));
            prop_assert!(limit_dislocated.is_none_or(|n| dislocated <= n));
            prop_assert_eq!(colocated, out.stats.colocated);
        }
    }
}
