//! Cell identity → antenna resolution with duplicate handling and caching.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::data::celldb::CellDatabase;
use crate::domain::{CellIdentity, CellSite, DuplicatePolicy};
use crate::error::{AppError, ErrorKind};

/// Outcome of resolving one identity at one moment.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(CellSite),
    /// Several records matched; `site` is the one the policy kept, if any.
    Duplicate { site: Option<CellSite>, hits: usize },
    Missing,
}

impl Resolution {
    pub fn site(&self) -> Option<&CellSite> {
        match self {
            Resolution::Found(site) => Some(site),
            Resolution::Duplicate { site, .. } => site.as_ref(),
            Resolution::Missing => None,
        }
    }
}

/// Apply a duplicate policy to the raw hits of a lookup.
pub fn apply_duplicate_policy(
    cell: &CellIdentity,
    hits: &[CellSite],
    policy: DuplicatePolicy,
) -> Result<Resolution, AppError> {
    match hits {
        [] => Ok(Resolution::Missing),
        [only] => Ok(Resolution::Found(only.clone())),
        [first, .., last] => {
            let site = match policy {
                DuplicatePolicy::TakeFirst => Some(first.clone()),
                DuplicatePolicy::TakeLast => Some(last.clone()),
                DuplicatePolicy::Drop => None,
                DuplicatePolicy::Error => {
                    return Err(AppError::new(
                        ErrorKind::DuplicateCell,
                        format!("Duplicate cell {cell}: {} records match (policy `error`).", hits.len()),
                    ));
                }
            };
            Ok(Resolution::Duplicate { site, hits: hits.len() })
        }
    }
}

/// Counters describing lookups made through a `CachedCellLookup`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupStats {
    pub backend_calls: usize,
    pub cache_hits: usize,
    pub duplicates: usize,
    pub missing: usize,
}

/// Read-through cache in front of a `CellDatabase`, keyed by identity.
///
/// The backend is asked once per identity for all its records; the validity
/// window is applied per lookup. One instance lives for the duration of a run;
/// it is `Sync` so extractors can be shared across worker threads.
pub struct CachedCellLookup<'a> {
    db: &'a dyn CellDatabase,
    policy: DuplicatePolicy,
    cache: Mutex<HashMap<CellIdentity, Arc<[CellSite]>>>,
    backend_calls: AtomicUsize,
    cache_hits: AtomicUsize,
    duplicates: AtomicUsize,
    missing: AtomicUsize,
}

impl<'a> CachedCellLookup<'a> {
    pub fn new(db: &'a dyn CellDatabase, policy: DuplicatePolicy) -> Self {
        Self {
            db,
            policy,
            cache: Mutex::new(HashMap::new()),
            backend_calls: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
            duplicates: AtomicUsize::new(0),
            missing: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// The backend, for queries the cache does not cover (proximity search).
    pub fn database(&self) -> &'a dyn CellDatabase {
        self.db
    }

    /// Resolve `cell` at `at`, consulting the backend at most once per identity.
    pub fn resolve(&self, cell: &CellIdentity, at: DateTime<Utc>) -> Result<Resolution, AppError> {
        let records = self.records(cell)?;
        let hits: Vec<CellSite> = records.iter().filter(|s| s.is_active_at(at)).cloned().collect();
        let resolution = apply_duplicate_policy(cell, &hits, self.policy)?;
        match &resolution {
            Resolution::Duplicate { hits, .. } => {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(cell = %cell, hits, "duplicate cell records");
            }
            Resolution::Missing => {
                self.missing.fetch_add(1, Ordering::Relaxed);
            }
            Resolution::Found(_) => {}
        }
        Ok(resolution)
    }

    pub fn stats(&self) -> LookupStats {
        LookupStats {
            backend_calls: self.backend_calls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            missing: self.missing.load(Ordering::Relaxed),
        }
    }

    fn records(&self, cell: &CellIdentity) -> Result<Arc<[CellSite]>, AppError> {
        {
            let cache = self
                .cache
                .lock()
                .map_err(|_| AppError::internal("Cell lookup cache lock poisoned."))?;
            if let Some(records) = cache.get(cell) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(records));
            }
        }

        // The backend call happens outside the lock; a concurrent miss on the
        // same identity does a redundant lookup but stores an identical value.
        let records: Arc<[CellSite]> = self.db.records(cell).into();
        self.backend_calls.fetch_add(1, Ordering::Relaxed);

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| AppError::internal("Cell lookup cache lock poisoned."))?;
        Ok(Arc::clone(cache.entry(cell.clone()).or_insert(records)))
    }
}
