//! In-memory measurement store.
//!
//! Measurements are grouped per device and kept sorted by timestamp so that
//! pairing can take delay-bounded windows with two binary searches.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::domain::{Measurement, RunConfig};
use crate::error::AppError;
use crate::io::ingest::{IngestedMeasurements, RowError, read_measurements_csv};

/// Everything that did not make it into the store, and why.
#[derive(Debug, Clone, Default)]
pub struct Inconsistencies {
    /// Rows that could not be parsed.
    pub row_errors: Vec<RowError>,
    /// Exact repeats (same device, timestamp and cell) of an earlier measurement.
    pub duplicate_measurements: usize,
}

impl Inconsistencies {
    pub fn total(&self) -> usize {
        self.row_errors.len() + self.duplicate_measurements
    }
}

/// Per-device overview used by `coloc summarize`.
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub device: String,
    pub tracks: Vec<String>,
    pub count: usize,
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct MeasurementStore {
    by_device: BTreeMap<String, Vec<Measurement>>,
    inconsistencies: Inconsistencies,
    rows_read: usize,
}

impl MeasurementStore {
    /// Load measurements from a CSV file.
    pub fn load(path: &Path, config: &RunConfig) -> Result<Self, AppError> {
        let ingested = read_measurements_csv(path)?;
        let store = Self::from_ingest(ingested, config);
        info!(
            path = %path.display(),
            rows = store.rows_read,
            measurements = store.len(),
            devices = store.device_count(),
            "loaded measurements"
        );
        Ok(store)
    }

    pub fn from_ingest(ingested: IngestedMeasurements, config: &RunConfig) -> Self {
        let IngestedMeasurements {
            measurements,
            row_errors,
            rows_read,
        } = ingested;

        for e in &row_errors {
            warn!(line = e.line, "skipped measurement row: {}", e.message);
        }

        let mut store = Self::from_measurements(measurements, config);
        store.inconsistencies.row_errors = row_errors;
        store.rows_read = rows_read;
        store
    }

    pub fn from_measurements(measurements: impl IntoIterator<Item = Measurement>, config: &RunConfig) -> Self {
        let mut by_device: BTreeMap<String, Vec<Measurement>> = BTreeMap::new();
        let mut rows_read = 0usize;
        for m in measurements {
            rows_read += 1;
            by_device.entry(m.device.clone()).or_default().push(m);
        }

        let mut duplicate_measurements = 0usize;
        for (device, list) in by_device.iter_mut() {
            list.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
            if !config.drop_repeated_measurements {
                continue;
            }
            let before = list.len();
            // Exact repeats are adjacent only if they share a timestamp, so a
            // quadratic check within each equal-timestamp run is enough.
            let mut kept: Vec<Measurement> = Vec::with_capacity(before);
            for m in list.drain(..) {
                let is_repeat = kept
                    .iter()
                    .rev()
                    .take_while(|k| k.timestamp == m.timestamp)
                    .any(|k| k.cell == m.cell);
                if !is_repeat {
                    kept.push(m);
                }
            }
            let dropped = before - kept.len();
            if dropped > 0 {
                warn!(device = %device, dropped, "dropped repeated measurements");
            }
            duplicate_measurements += dropped;
            *list = kept;
        }

        Self {
            by_device,
            inconsistencies: Inconsistencies {
                row_errors: Vec::new(),
                duplicate_measurements,
            },
            rows_read,
        }
    }

    pub fn len(&self) -> usize {
        self.by_device.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_device.is_empty()
    }

    pub fn device_count(&self) -> usize {
        self.by_device.len()
    }

    pub fn rows_read(&self) -> usize {
        self.rows_read
    }

    pub fn inconsistencies(&self) -> &Inconsistencies {
        &self.inconsistencies
    }

    /// Device identifiers in sorted order.
    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.by_device.keys().map(String::as_str)
    }

    /// All measurements, by device and then by timestamp.
    pub fn iter(&self) -> impl Iterator<Item = &Measurement> {
        self.by_device.values().flatten()
    }

    /// Measurements of one device ordered by timestamp.
    pub fn get_by_device(&self, device: &str) -> Result<&[Measurement], AppError> {
        self.by_device
            .get(device)
            .map(Vec::as_slice)
            .ok_or_else(|| AppError::not_found(format!("No measurements for device '{device}'.")))
    }

    /// Measurements of one device with `from <= timestamp <= to`.
    pub fn window(&self, device: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<&[Measurement], AppError> {
        let list = self.get_by_device(device)?;
        Ok(time_window(list, from, to))
    }

    /// Measurements with `from <= timestamp < to` across all devices.
    pub fn select_by_timestamp(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<&Measurement> {
        self.by_device
            .values()
            .flat_map(|list| {
                let lo = list.partition_point(|m| m.timestamp < from);
                let hi = list.partition_point(|m| m.timestamp < to);
                &list[lo..hi.max(lo)]
            })
            .collect()
    }

    pub fn summarize(&self) -> Vec<DeviceSummary> {
        self.by_device
            .iter()
            .filter_map(|(device, list)| {
                let first = list.first()?.timestamp;
                let last = list.last()?.timestamp;
                let mut tracks: Vec<String> = list.iter().filter_map(|m| m.track.clone()).collect();
                tracks.sort();
                tracks.dedup();
                Some(DeviceSummary {
                    device: device.clone(),
                    tracks,
                    count: list.len(),
                    first,
                    last,
                })
            })
            .collect()
    }
}

/// Slice of a timestamp-sorted list with `from <= timestamp <= to`.
pub fn time_window(list: &[Measurement], from: DateTime<Utc>, to: DateTime<Utc>) -> &[Measurement] {
    let lo = list.partition_point(|m| m.timestamp < from);
    let hi = list.partition_point(|m| m.timestamp <= to);
    &list[lo..hi.max(lo)]
}
