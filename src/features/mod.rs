//! Per-pair feature extraction.
//!
//! A feature is a pure function of a pair plus the read-only cell lookup.
//! Pairs whose feature cannot be computed yield an `UnresolvableScore` error,
//! which callers count and skip; any other error aborts the run.

use rayon::prelude::*;
use tracing::debug;

use crate::data::{CachedCellLookup, ProximityQuery, Resolution};
use crate::domain::{FeatureKind, GeoPoint, MeasurementRef, PairRecord, RunConfig};
use crate::error::{AppError, ErrorKind};
use crate::math::{facing_angle_deg, haversine_m};

/// Scores of a batch of pairs; `None` marks an unresolvable pair.
#[derive(Debug, Clone, Default)]
pub struct ScoredPairs {
    pub scores: Vec<Option<f64>>,
    pub unresolvable: usize,
}

/// Antenna of one pair side.
#[derive(Debug, Clone, Copy)]
struct Antenna {
    position: GeoPoint,
    azimuth: Option<f64>,
}

pub struct FeatureExtractor<'a> {
    kind: FeatureKind,
    parallel: bool,
    lookup: Option<&'a CachedCellLookup<'a>>,
}

impl<'a> FeatureExtractor<'a> {
    pub fn new(config: &RunConfig, lookup: Option<&'a CachedCellLookup<'a>>) -> Self {
        Self {
            kind: config.feature,
            parallel: config.parallel,
            lookup,
        }
    }

    pub fn kind(&self) -> FeatureKind {
        self.kind
    }

    pub fn score(&self, pair: &PairRecord) -> Result<f64, AppError> {
        let value = match self.kind {
            FeatureKind::Distance => {
                let a = self.antenna(&pair.left)?;
                let b = self.antenna(&pair.right)?;
                haversine_m(a.position, b.position)
            }
            FeatureKind::Delay => pair.delay_secs,
            FeatureKind::CountCloser => self.count_closer(pair)?,
            FeatureKind::Angle => {
                let a = self.antenna(&pair.left)?;
                let b = self.antenna(&pair.right)?;
                match (a.azimuth, b.azimuth) {
                    (Some(az_a), Some(az_b)) => facing_angle_deg(a.position, az_a, b.position, az_b),
                    _ => {
                        return Err(unresolvable(format!(
                            "Pair {}/{} lacks an antenna azimuth.",
                            pair.left.id, pair.right.id
                        )));
                    }
                }
            }
            FeatureKind::Stored => pair.score.ok_or_else(|| {
                unresolvable(format!(
                    "Pair {}/{} has no stored score.",
                    pair.left.id, pair.right.id
                ))
            })?,
        };
        if value.is_finite() {
            Ok(value)
        } else {
            Err(unresolvable(format!(
                "Pair {}/{} has a non-finite {}.",
                pair.left.id,
                pair.right.id,
                self.kind.name()
            )))
        }
    }

    /// Score every pair, keeping input order.
    pub fn score_pairs(&self, pairs: &[PairRecord]) -> Result<ScoredPairs, AppError> {
        let results: Vec<Result<f64, AppError>> = if self.parallel {
            pairs.par_iter().map(|p| self.score(p)).collect()
        } else {
            pairs.iter().map(|p| self.score(p)).collect()
        };

        let mut out = ScoredPairs {
            scores: Vec::with_capacity(results.len()),
            unresolvable: 0,
        };
        for r in results {
            match r {
                Ok(v) => out.scores.push(Some(v)),
                Err(e) if e.kind() == ErrorKind::UnresolvableScore => {
                    debug!("{e}");
                    out.unresolvable += 1;
                    out.scores.push(None);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Antennas other than the left one that lie closer to the left antenna
    /// than the right antenna does (1 m tolerance).
    fn count_closer(&self, pair: &PairRecord) -> Result<f64, AppError> {
        let lookup = self.lookup.ok_or_else(|| {
            unresolvable(format!(
                "Pair {}/{}: counting closer antennas needs a cell database.",
                pair.left.id, pair.right.id
            ))
        })?;
        let a = self.antenna(&pair.left)?;
        let b = self.antenna(&pair.right)?;
        let query = ProximityQuery::around(a.position)
            .within_m(haversine_m(a.position, b.position) + 1.0)
            .active_at(pair.left.timestamp);
        let closer = lookup
            .database()
            .search(&query)
            .refine(|hit| hit.site.cell != pair.left.cell);
        Ok(closer.len() as f64)
    }

    /// Antenna of one side. With a cell database attached, its record wins;
    /// a duplicate the policy dropped leaves the side unresolvable. The position
    /// stored with the pair is used only when the database has no record.
    fn antenna(&self, side: &MeasurementRef) -> Result<Antenna, AppError> {
        let resolution = match self.lookup {
            Some(lookup) => lookup.resolve(&side.cell, side.timestamp)?,
            None => Resolution::Missing,
        };
        match resolution {
            Resolution::Found(site) | Resolution::Duplicate { site: Some(site), .. } => Ok(Antenna {
                position: site.position,
                azimuth: site.azimuth,
            }),
            Resolution::Duplicate { site: None, hits } => Err(unresolvable(format!(
                "Cell {} has {hits} records at {}; duplicates are dropped.",
                side.cell,
                side.timestamp.to_rfc3339()
            ))),
            Resolution::Missing => side
                .site
                .map(|position| Antenna { position, azimuth: None })
                .ok_or_else(|| {
                    unresolvable(format!(
                        "No antenna position for cell {} at {}.",
                        side.cell,
                        side.timestamp.to_rfc3339()
                    ))
                }),
        }
    }
}

fn unresolvable(message: String) -> AppError {
    AppError::new(ErrorKind::UnresolvableScore, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CellTable;
    use crate::domain::{CellIdentity, CellSite, DuplicatePolicy, Label, MeasurementId, Radio};
    use chrono::{TimeZone, Utc};

    fn side(eci: u64, site: Option<GeoPoint>) -> MeasurementRef {
        MeasurementRef {
            id: MeasurementId(eci),
            device: "d".to_string(),
            timestamp: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            cell: CellIdentity::eci(Radio::Lte, 204, 8, eci).unwrap(),
            site,
        }
    }

    fn record(left: MeasurementRef, right: MeasurementRef) -> PairRecord {
        PairRecord {
            left,
            right,
            label: Some(Label::Colocated),
            delay_secs: 12.5,
            score: None,
        }
    }

    fn config(feature: FeatureKind) -> RunConfig {
        RunConfig {
            feature,
            ..RunConfig::default()
        }
    }

    #[test]
    fn distance_uses_stored_sites_without_a_database() {
        let cfg = config(FeatureKind::Distance);
        let fx = FeatureExtractor::new(&cfg, None);
        let p = record(
            side(1, Some(GeoPoint::new(5.0, 52.0))),
            side(2, Some(GeoPoint::new(5.0, 53.0))),
        );
        assert!((fx.score(&p).unwrap() - 111_195.0).abs() < 10.0);

        let missing = record(side(1, Some(GeoPoint::new(5.0, 52.0))), side(2, None));
        assert_eq!(fx.score(&missing).unwrap_err().kind(), ErrorKind::UnresolvableScore);
    }

    #[test]
    fn distance_prefers_the_cell_database() {
        let table = CellTable::new(vec![CellSite {
            cell: CellIdentity::eci(Radio::Lte, 204, 8, 2).unwrap(),
            position: GeoPoint::new(5.0, 52.0),
            azimuth: None,
            valid_from: None,
            valid_to: None,
        }]);
        let lookup = CachedCellLookup::new(&table, DuplicatePolicy::TakeFirst);
        let cfg = config(FeatureKind::Distance);
        let fx = FeatureExtractor::new(&cfg, Some(&lookup));
        let p = record(
            side(1, Some(GeoPoint::new(5.0, 52.0))),
            side(2, Some(GeoPoint::new(9.0, 50.0))),
        );
        assert_eq!(fx.score(&p).unwrap(), 0.0);
    }

    fn lte_site(eci: u64, lon: f64, azimuth: Option<f64>) -> CellSite {
        CellSite {
            cell: CellIdentity::eci(Radio::Lte, 204, 8, eci).unwrap(),
            position: GeoPoint::new(lon, 52.0),
            azimuth,
            valid_from: None,
            valid_to: None,
        }
    }

    #[test]
    fn dropped_duplicates_do_not_fall_back_to_stored_sites() {
        let table = CellTable::new(vec![lte_site(1, 5.0, None), lte_site(2, 5.0, None), lte_site(2, 5.3, None)]);
        let lookup = CachedCellLookup::new(&table, DuplicatePolicy::Drop);
        let cfg = config(FeatureKind::Distance);
        let fx = FeatureExtractor::new(&cfg, Some(&lookup));
        let p = record(
            side(1, Some(GeoPoint::new(5.0, 52.0))),
            side(2, Some(GeoPoint::new(5.0, 52.0))),
        );
        assert_eq!(fx.score(&p).unwrap_err().kind(), ErrorKind::UnresolvableScore);
        assert_eq!(lookup.stats().duplicates, 1);

        // A cell the database does not know still uses the stored site.
        let unknown = record(side(1, None), side(9, Some(GeoPoint::new(5.0, 52.0))));
        assert_eq!(fx.score(&unknown).unwrap(), 0.0);
    }

    #[test]
    fn count_closer_counts_antennas_inside_the_pair_distance() {
        let table = CellTable::new(vec![
            lte_site(1, 5.0, None),
            lte_site(2, 5.001, None),
            lte_site(3, 5.002, None),
            lte_site(4, 5.01, None),
            lte_site(5, 5.2, None),
        ]);
        let lookup = CachedCellLookup::new(&table, DuplicatePolicy::TakeFirst);
        let cfg = config(FeatureKind::CountCloser);
        let fx = FeatureExtractor::new(&cfg, Some(&lookup));

        // Cells 2, 3 and 4 lie within the 1-4 distance; cell 1 itself is not counted.
        assert_eq!(fx.score(&record(side(1, None), side(4, None))).unwrap(), 3.0);
        assert_eq!(fx.score(&record(side(1, None), side(1, None))).unwrap(), 0.0);

        let without_db = FeatureExtractor::new(&cfg, None);
        let p = record(
            side(1, Some(GeoPoint::new(5.0, 52.0))),
            side(4, Some(GeoPoint::new(5.01, 52.0))),
        );
        assert_eq!(without_db.score(&p).unwrap_err().kind(), ErrorKind::UnresolvableScore);
    }

    #[test]
    fn angle_needs_both_azimuths() {
        // Cell 2 lies due east of cell 1.
        let table = CellTable::new(vec![
            lte_site(1, 5.0, Some(90.0)),
            lte_site(2, 5.01, Some(270.0)),
            lte_site(3, 5.01, None),
        ]);
        let lookup = CachedCellLookup::new(&table, DuplicatePolicy::TakeFirst);
        let cfg = config(FeatureKind::Angle);
        let fx = FeatureExtractor::new(&cfg, Some(&lookup));

        let facing = fx.score(&record(side(1, None), side(2, None))).unwrap();
        assert!(facing < 0.1, "got {facing}");
        assert_eq!(
            fx.score(&record(side(1, None), side(3, None))).unwrap_err().kind(),
            ErrorKind::UnresolvableScore
        );
    }

    #[test]
    fn unresolvable_pairs_are_counted_not_zero_filled() {
        let cfg = config(FeatureKind::Stored);
        let fx = FeatureExtractor::new(&cfg, None);
        let mut scored = record(side(1, None), side(2, None));
        scored.score = Some(0.75);
        let unscored = record(side(3, None), side(4, None));

        let out = fx.score_pairs(&[scored, unscored]).unwrap();
        assert_eq!(out.scores, vec![Some(0.75), None]);
        assert_eq!(out.unresolvable, 1);
    }

    #[test]
    fn delay_feature_reads_the_pair_delay() {
        let cfg = config(FeatureKind::Delay);
        let fx = FeatureExtractor::new(&cfg, None);
        assert_eq!(fx.score(&record(side(1, None), side(2, None))).unwrap(), 12.5);
    }
}
