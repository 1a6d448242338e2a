//! Cell (antenna) database interface and an in-memory backend.
//!
//! The pairing and feature code only sees the `CellDatabase` trait, so a
//! relational/geospatial backend can be swapped in without touching them.
//! `CellTable` is the bundled backend: it loads a CSV export, indexes records
//! by identity for `get`, and answers proximity searches by a linear scan.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::domain::{CellIdentity, CellSite, GeoPoint, Radio};
use crate::error::AppError;
use crate::io::ingest::read_cell_sites_csv;
use crate::math::haversine_m;

/// Lookup capabilities required from a cell metadata store.
pub trait CellDatabase: Send + Sync {
    /// Every record of `cell` regardless of validity, in store order.
    fn records(&self, cell: &CellIdentity) -> Vec<CellSite>;

    /// All records for `cell` active at `at`, in store order.
    fn get(&self, cell: &CellIdentity, at: DateTime<Utc>) -> Vec<CellSite> {
        self.records(cell).into_iter().filter(|s| s.is_active_at(at)).collect()
    }

    /// Antennas near a point, sorted by increasing distance.
    fn search(&self, query: &ProximityQuery) -> QueryResult;
}

/// Parameters of a proximity search.
#[derive(Debug, Clone)]
pub struct ProximityQuery {
    pub center: GeoPoint,
    pub max_distance_m: Option<f64>,
    pub min_distance_m: Option<f64>,
    pub at: Option<DateTime<Utc>>,
    pub radios: Option<Vec<Radio>>,
    pub exclude: Option<CellIdentity>,
    pub count_limit: Option<usize>,
}

impl ProximityQuery {
    pub fn around(center: GeoPoint) -> Self {
        Self {
            center,
            max_distance_m: None,
            min_distance_m: None,
            at: None,
            radios: None,
            exclude: None,
            count_limit: None,
        }
    }

    pub fn within_m(mut self, meters: f64) -> Self {
        self.max_distance_m = Some(meters);
        self
    }

    pub fn beyond_m(mut self, meters: f64) -> Self {
        self.min_distance_m = Some(meters);
        self
    }

    pub fn active_at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }

    pub fn radios(mut self, radios: Vec<Radio>) -> Self {
        self.radios = Some(radios);
        self
    }

    pub fn excluding(mut self, cell: CellIdentity) -> Self {
        self.exclude = Some(cell);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.count_limit = Some(n);
        self
    }
}

/// A site returned by a proximity search together with its distance to the query point.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteHit {
    pub site: CellSite,
    pub distance_m: f64,
}

/// Immutable view over search results.
///
/// `refine` narrows the view without re-querying the backend; the underlying
/// hits are shared between a view and its refinements.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    hits: Arc<[SiteHit]>,
    selected: Vec<usize>,
}

impl QueryResult {
    pub fn new(hits: Vec<SiteHit>) -> Self {
        let selected = (0..hits.len()).collect();
        Self {
            hits: hits.into(),
            selected,
        }
    }

    /// A new view keeping only hits matching `predicate`.
    pub fn refine(&self, predicate: impl Fn(&SiteHit) -> bool) -> Self {
        Self {
            hits: Arc::clone(&self.hits),
            selected: self
                .selected
                .iter()
                .copied()
                .filter(|&i| predicate(&self.hits[i]))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SiteHit> {
        self.selected.iter().map(|&i| &self.hits[i])
    }

    pub fn first(&self) -> Option<&SiteHit> {
        self.selected.first().map(|&i| &self.hits[i])
    }
}

/// In-memory cell database.
#[derive(Debug, Clone, Default)]
pub struct CellTable {
    sites: Vec<CellSite>,
    /// Positions in `sites` per identity, ascending.
    by_cell: HashMap<CellIdentity, Vec<usize>>,
}

impl CellTable {
    pub fn new(sites: Vec<CellSite>) -> Self {
        let mut by_cell: HashMap<CellIdentity, Vec<usize>> = HashMap::new();
        for (i, site) in sites.iter().enumerate() {
            by_cell.entry(site.cell.clone()).or_default().push(i);
        }
        Self { sites, by_cell }
    }

    /// Load a CSV export (see `io::ingest::read_cell_sites`).
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let ingested = read_cell_sites_csv(path)?;
        for e in &ingested.row_errors {
            warn!(line = e.line, "skipped cell database row: {}", e.message);
        }
        if ingested.sites.is_empty() {
            return Err(AppError::input(format!(
                "Cell database '{}' contains no usable records.",
                path.display()
            )));
        }
        info!(path = %path.display(), sites = ingested.sites.len(), "loaded cell database");
        Ok(Self::new(ingested.sites))
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

impl CellDatabase for CellTable {
    fn records(&self, cell: &CellIdentity) -> Vec<CellSite> {
        self.by_cell
            .get(cell)
            .map(|idx| idx.iter().map(|&i| self.sites[i].clone()).collect())
            .unwrap_or_default()
    }

    fn search(&self, query: &ProximityQuery) -> QueryResult {
        let mut hits: Vec<SiteHit> = self
            .sites
            .iter()
            .filter(|s| query.at.is_none_or(|at| s.is_active_at(at)))
            .filter(|s| query.radios.as_ref().is_none_or(|r| r.contains(&s.cell.radio())))
            .filter(|s| query.exclude.as_ref() != Some(&s.cell))
            .filter_map(|s| {
                let distance_m = haversine_m(query.center, s.position);
                let too_far = query.max_distance_m.is_some_and(|max| distance_m > max);
                let too_close = query.min_distance_m.is_some_and(|min| distance_m < min);
                (!too_far && !too_close).then(|| SiteHit {
                    site: s.clone(),
                    distance_m,
                })
            })
            .collect();

        // Stable sort keeps store order among equidistant sites.
        hits.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
        if let Some(n) = query.count_limit {
            hits.truncate(n);
        }
        QueryResult::new(hits)
    }
}
