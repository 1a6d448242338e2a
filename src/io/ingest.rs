//! CSV ingest and normalization.
//!
//! This module turns measurement and cell-database CSV exports into typed
//! records that are safe to pair and score.
//!
//! Design goals:
//! - **Strict schema** for required columns (clear errors + exit code 2)
//! - **Row-level validation** (skip bad rows, but report what happened)
//! - **Deterministic behavior** (rows keep file order, no hidden randomness)

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use csv::StringRecord;

use crate::domain::{CellIdentity, CellSite, GeoPoint, Measurement, MeasurementId, Radio};
use crate::error::AppError;

/// A row-level error encountered during ingest.
#[derive(Debug, Clone)]
pub struct RowError {
    pub line: usize,
    pub message: String,
}

/// Measurement ingest output: parsed rows in file order + row errors.
#[derive(Debug, Clone)]
pub struct IngestedMeasurements {
    pub measurements: Vec<Measurement>,
    pub row_errors: Vec<RowError>,
    pub rows_read: usize,
}

/// Cell database ingest output.
#[derive(Debug, Clone)]
pub struct IngestedCells {
    pub sites: Vec<CellSite>,
    pub row_errors: Vec<RowError>,
    pub rows_read: usize,
}

const MEASUREMENT_COLUMNS: [&str; 5] = ["device_id", "timestamp", "radio", "mcc", "mnc"];
const CELL_COLUMNS: [&str; 5] = ["radio", "mcc", "mnc", "lon", "lat"];

/// Read measurements from a CSV file.
pub fn read_measurements_csv(path: &Path) -> Result<IngestedMeasurements, AppError> {
    let file = File::open(path).map_err(|e| {
        AppError::input(format!("Failed to open measurements CSV '{}': {e}", path.display()))
    })?;
    read_measurements(file)
}

/// Read measurements from any CSV source.
pub fn read_measurements<R: Read>(source: R) -> Result<IngestedMeasurements, AppError> {
    let mut reader = csv_reader(source);
    let header_map = read_header_map(&mut reader)?;
    ensure_columns(&header_map, &MEASUREMENT_COLUMNS)?;

    let mut measurements: Vec<Measurement> = Vec::new();
    let mut row_errors = Vec::new();
    let mut rows_read = 0usize;
    let mut seen_ids: HashMap<MeasurementId, usize> = HashMap::new();

    for (idx, result) in reader.records().enumerate() {
        // +2: records() starts after the header, and CSV lines are 1-based.
        let line = idx + 2;
        rows_read += 1;

        let record = match result {
            Ok(r) => r,
            Err(e) => {
                row_errors.push(RowError {
                    line,
                    message: format!("CSV parse error: {e}"),
                });
                continue;
            }
        };

        // Without an explicit `id` column the 1-based data row number is the id.
        let fallback_id = MeasurementId(rows_read as u64);
        match parse_measurement(&record, &header_map, fallback_id) {
            Ok(m) => {
                if let Some(prev) = seen_ids.insert(m.id, line) {
                    row_errors.push(RowError {
                        line,
                        message: format!("Duplicate measurement id {} (first seen on line {prev}).", m.id),
                    });
                    continue;
                }
                measurements.push(m);
            }
            Err(message) => row_errors.push(RowError { line, message }),
        }
    }

    Ok(IngestedMeasurements {
        measurements,
        row_errors,
        rows_read,
    })
}

/// Read antenna records from a cell database CSV file.
pub fn read_cell_sites_csv(path: &Path) -> Result<IngestedCells, AppError> {
    let file = File::open(path).map_err(|e| {
        AppError::input(format!("Failed to open cell database CSV '{}': {e}", path.display()))
    })?;
    read_cell_sites(file)
}

/// Read antenna records from any CSV source.
pub fn read_cell_sites<R: Read>(source: R) -> Result<IngestedCells, AppError> {
    let mut reader = csv_reader(source);
    let header_map = read_header_map(&mut reader)?;
    ensure_columns(&header_map, &CELL_COLUMNS)?;

    let mut sites = Vec::new();
    let mut row_errors = Vec::new();
    let mut rows_read = 0usize;

    for (idx, result) in reader.records().enumerate() {
        let line = idx + 2;
        rows_read += 1;
        let parsed = result
            .map_err(|e| format!("CSV parse error: {e}"))
            .and_then(|record| parse_cell_site(&record, &header_map));
        match parsed {
            Ok(site) => sites.push(site),
            Err(message) => row_errors.push(RowError { line, message }),
        }
    }

    Ok(IngestedCells {
        sites,
        row_errors,
        rows_read,
    })
}

fn csv_reader<R: Read>(source: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(source)
}

fn read_header_map<R: Read>(reader: &mut csv::Reader<R>) -> Result<HashMap<String, usize>, AppError> {
    let headers = reader
        .headers()
        .map_err(|e| AppError::input(format!("Failed to read CSV headers: {e}")))?;
    Ok(build_header_map(headers))
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (normalize_header_name(name), idx))
        .collect()
}

fn normalize_header_name(name: &str) -> String {
    // Spreadsheet exports sometimes prefix the first header with a UTF-8 BOM.
    let name = name.trim().trim_start_matches('\u{feff}');
    name.to_ascii_lowercase()
}

fn ensure_columns(header_map: &HashMap<String, usize>, required: &[&str]) -> Result<(), AppError> {
    for name in required {
        if !header_map.contains_key(*name) {
            return Err(AppError::input(format!("Missing required column: `{name}`")));
        }
    }
    Ok(())
}

fn parse_measurement(
    record: &StringRecord,
    header_map: &HashMap<String, usize>,
    fallback_id: MeasurementId,
) -> Result<Measurement, String> {
    let id = match get_optional(record, header_map, "id") {
        Some(s) => MeasurementId(s.parse().map_err(|_| format!("Invalid `id` '{s}'."))?),
        None => fallback_id,
    };
    let device = get_required(record, header_map, "device_id")?.to_string();
    let timestamp = parse_timestamp(get_required(record, header_map, "timestamp")?)?;
    let cell = parse_cell_identity(record, header_map)?;
    let track = get_optional(record, header_map, "track").map(str::to_string);
    let position = parse_position(record, header_map)?;

    Ok(Measurement {
        id,
        device,
        track,
        timestamp,
        cell,
        position,
    })
}

fn parse_cell_site(record: &StringRecord, header_map: &HashMap<String, usize>) -> Result<CellSite, String> {
    let cell = parse_cell_identity(record, header_map)?;
    let position = parse_position(record, header_map)?.ok_or_else(|| "Missing `lon`/`lat` value.".to_string())?;
    let valid_from = get_optional(record, header_map, "date_start")
        .map(parse_timestamp)
        .transpose()?;
    let valid_to = get_optional(record, header_map, "date_end")
        .map(parse_timestamp)
        .transpose()?;
    let azimuth: Option<f64> = parse_optional(record, header_map, "azimuth")?;
    if let Some(a) = azimuth.filter(|a| !(0.0..=360.0).contains(a)) {
        return Err(format!("Azimuth {a} is outside 0..=360 degrees."));
    }

    Ok(CellSite {
        cell,
        position,
        azimuth,
        valid_from,
        valid_to,
    })
}

fn parse_cell_identity(record: &StringRecord, header_map: &HashMap<String, usize>) -> Result<CellIdentity, String> {
    let radio: Radio = get_required(record, header_map, "radio")?.parse()?;
    let mcc = parse_required(record, header_map, "mcc")?;
    let mnc = parse_required(record, header_map, "mnc")?;
    let lac = parse_optional(record, header_map, "lac")?;
    let ci = parse_optional(record, header_map, "ci")?;
    let eci = parse_optional(record, header_map, "eci")?;
    CellIdentity::from_parts(radio, mcc, mnc, lac, ci, eci)
}

fn parse_position(record: &StringRecord, header_map: &HashMap<String, usize>) -> Result<Option<GeoPoint>, String> {
    let lon: Option<f64> = parse_optional(record, header_map, "lon")?;
    let lat: Option<f64> = parse_optional(record, header_map, "lat")?;
    match (lon, lat) {
        (Some(lon), Some(lat)) => {
            let p = GeoPoint::new(lon, lat);
            if p.is_valid() {
                Ok(Some(p))
            } else {
                Err(format!("Coordinates out of range: lon={lon}, lat={lat}."))
            }
        }
        (None, None) => Ok(None),
        _ => Err("Only one of `lon`/`lat` is set.".to_string()),
    }
}

/// Parse a timestamp as UTC.
///
/// Accepted: RFC 3339, `YYYY-MM-DD HH:MM:SS[.f][±HH:MM]`, and the same without
/// offset (interpreted as UTC), with either a space or `T` separator.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    const OFFSET_FMTS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];
    for fmt in OFFSET_FMTS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    const NAIVE_FMTS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    for fmt in NAIVE_FMTS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.and_utc());
        }
    }
    Err(format!(
        "Invalid timestamp '{s}'. Expected RFC 3339 or YYYY-MM-DD HH:MM:SS[.f][+HH:MM]."
    ))
}

fn get_required<'a>(
    record: &'a StringRecord,
    header_map: &HashMap<String, usize>,
    name: &str,
) -> Result<&'a str, String> {
    let idx = header_map
        .get(name)
        .ok_or_else(|| format!("Missing required column: `{name}`"))?;
    record
        .get(*idx)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("Missing required value: `{name}`"))
}

fn get_optional<'a>(record: &'a StringRecord, header_map: &HashMap<String, usize>, name: &str) -> Option<&'a str> {
    let idx = header_map.get(name)?;
    record.get(*idx).map(str::trim).filter(|s| !s.is_empty())
}

fn parse_required<T: std::str::FromStr>(
    record: &StringRecord,
    header_map: &HashMap<String, usize>,
    name: &str,
) -> Result<T, String> {
    let s = get_required(record, header_map, name)?;
    s.parse().map_err(|_| format!("Invalid `{name}` value '{s}'."))
}

fn parse_optional<T: std::str::FromStr>(
    record: &StringRecord,
    header_map: &HashMap<String, usize>,
    name: &str,
) -> Result<Option<T>, String> {
    get_optional(record, header_map, name)
        .map(|s| s.parse().map_err(|_| format!("Invalid `{name}` value '{s}'.")))
        .transpose()
}
