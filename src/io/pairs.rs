//! Pairs store: CSV and binary encodings of the same flat row schema.
//!
//! The extension selects the encoding (`.csv` or `.db`); both carry exactly the
//! same fields so a store converts losslessly between them. The binary form is
//! a magic header followed by a bincode body with a format version.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CellIdentity, GeoPoint, Label, MeasurementId, MeasurementRef, PairRecord};
use crate::error::AppError;

const MAGIC: &[u8; 8] = b"COLOCPRS";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairsFormat {
    Csv,
    Binary,
}

impl PairsFormat {
    pub fn from_path(path: &Path) -> Result<Self, AppError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("csv") => Ok(PairsFormat::Csv),
            Some("db") => Ok(PairsFormat::Binary),
            _ => Err(AppError::input(format!(
                "Cannot tell the pairs format of '{}': use a `.csv` or `.db` extension.",
                path.display()
            ))),
        }
    }
}

/// One stored pair, flattened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairRow {
    pub left_id: u64,
    pub left_device: String,
    pub left_timestamp: DateTime<Utc>,
    pub left_cell: CellIdentity,
    pub left_lon: Option<f64>,
    pub left_lat: Option<f64>,
    pub right_id: u64,
    pub right_device: String,
    pub right_timestamp: DateTime<Utc>,
    pub right_cell: CellIdentity,
    pub right_lon: Option<f64>,
    pub right_lat: Option<f64>,
    pub label: Option<Label>,
    pub delay_seconds: f64,
    pub score: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BinaryBody {
    version: u32,
    rows: Vec<PairRow>,
}

impl From<&PairRecord> for PairRow {
    fn from(p: &PairRecord) -> Self {
        Self {
            left_id: p.left.id.0,
            left_device: p.left.device.clone(),
            left_timestamp: p.left.timestamp,
            left_cell: p.left.cell.clone(),
            left_lon: p.left.site.map(|s| s.lon),
            left_lat: p.left.site.map(|s| s.lat),
            right_id: p.right.id.0,
            right_device: p.right.device.clone(),
            right_timestamp: p.right.timestamp,
            right_cell: p.right.cell.clone(),
            right_lon: p.right.site.map(|s| s.lon),
            right_lat: p.right.site.map(|s| s.lat),
            label: p.label,
            delay_seconds: p.delay_secs,
            score: p.score,
        }
    }
}

impl TryFrom<PairRow> for PairRecord {
    type Error = String;

    fn try_from(r: PairRow) -> Result<Self, Self::Error> {
        if !(r.delay_seconds.is_finite() && r.delay_seconds >= 0.0) {
            return Err(format!("delay_seconds must be a non-negative number (got {}).", r.delay_seconds));
        }
        Ok(PairRecord {
            left: MeasurementRef {
                id: MeasurementId(r.left_id),
                device: r.left_device,
                timestamp: r.left_timestamp,
                cell: r.left_cell,
                site: site("left", r.left_lon, r.left_lat)?,
            },
            right: MeasurementRef {
                id: MeasurementId(r.right_id),
                device: r.right_device,
                timestamp: r.right_timestamp,
                cell: r.right_cell,
                site: site("right", r.right_lon, r.right_lat)?,
            },
            label: r.label,
            delay_secs: r.delay_seconds,
            score: r.score,
        })
    }
}

fn site(side: &str, lon: Option<f64>, lat: Option<f64>) -> Result<Option<GeoPoint>, String> {
    match (lon, lat) {
        (Some(lon), Some(lat)) => {
            let p = GeoPoint::new(lon, lat);
            if p.is_valid() {
                Ok(Some(p))
            } else {
                Err(format!("{side} coordinates ({lon}, {lat}) are out of range."))
            }
        }
        (None, None) => Ok(None),
        _ => Err(format!("{side}_lon and {side}_lat must be given together.")),
    }
}

/// Read a pairs store, picking the encoding from the extension.
pub fn read_pairs(path: &Path) -> Result<Vec<PairRecord>, AppError> {
    let format = PairsFormat::from_path(path)?;
    let file = File::open(path)
        .map_err(|e| AppError::input(format!("Failed to open pairs file '{}': {e}", path.display())))?;
    let reader = BufReader::new(file);
    let pairs = match format {
        PairsFormat::Csv => read_pairs_csv(reader),
        PairsFormat::Binary => read_pairs_binary(reader),
    }
    .map_err(|e| AppError::input(format!("{}: {e}", path.display())))?;
    tracing::info!(path = %path.display(), pairs = pairs.len(), "read pairs");
    Ok(pairs)
}

/// Write a pairs store; `-` writes CSV to stdout.
pub fn write_pairs(path: &Path, pairs: &[PairRecord]) -> Result<(), AppError> {
    if path.as_os_str() == "-" {
        return write_pairs_csv(std::io::stdout().lock(), pairs);
    }
    let format = PairsFormat::from_path(path)?;
    let file = File::create(path)
        .map_err(|e| AppError::input(format!("Failed to create pairs file '{}': {e}", path.display())))?;
    let writer = BufWriter::new(file);
    match format {
        PairsFormat::Csv => write_pairs_csv(writer, pairs)?,
        PairsFormat::Binary => write_pairs_binary(writer, pairs)?,
    }
    tracing::info!(path = %path.display(), pairs = pairs.len(), "wrote pairs");
    Ok(())
}

pub fn read_pairs_csv<R: Read>(source: R) -> Result<Vec<PairRecord>, AppError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::None).from_reader(source);
    let mut out = Vec::new();
    for (i, row) in reader.deserialize::<PairRow>().enumerate() {
        // Line 1 is the header.
        let line = i + 2;
        let row = row.map_err(|e| AppError::input(format!("pairs CSV line {line}: {e}")))?;
        out.push(PairRecord::try_from(row).map_err(|e| AppError::input(format!("pairs CSV line {line}: {e}")))?);
    }
    Ok(out)
}

pub fn write_pairs_csv<W: Write>(sink: W, pairs: &[PairRecord]) -> Result<(), AppError> {
    let mut writer = csv::Writer::from_writer(sink);
    for p in pairs {
        writer
            .serialize(PairRow::from(p))
            .map_err(|e| AppError::input(format!("Failed to write pairs CSV row: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| AppError::input(format!("Failed to write pairs CSV: {e}")))
}

pub fn read_pairs_binary<R: Read>(mut source: R) -> Result<Vec<PairRecord>, AppError> {
    let mut magic = [0u8; 8];
    source
        .read_exact(&mut magic)
        .map_err(|e| AppError::input(format!("Not a pairs database (header unreadable: {e}).")))?;
    if &magic != MAGIC {
        return Err(AppError::input("Not a pairs database (bad magic header)."));
    }
    let body: BinaryBody =
        bincode::deserialize_from(source).map_err(|e| AppError::input(format!("Corrupt pairs database: {e}")))?;
    if body.version != FORMAT_VERSION {
        return Err(AppError::input(format!(
            "Unsupported pairs database version {} (expected {FORMAT_VERSION}).",
            body.version
        )));
    }
    body.rows
        .into_iter()
        .enumerate()
        .map(|(i, row)| PairRecord::try_from(row).map_err(|e| AppError::input(format!("pairs row {}: {e}", i + 1))))
        .collect()
}

pub fn write_pairs_binary<W: Write>(mut sink: W, pairs: &[PairRecord]) -> Result<(), AppError> {
    let body = BinaryBody {
        version: FORMAT_VERSION,
        rows: pairs.iter().map(PairRow::from).collect(),
    };
    sink.write_all(MAGIC)
        .map_err(|e| AppError::input(format!("Failed to write pairs database: {e}")))?;
    bincode::serialize_into(&mut sink, &body)
        .map_err(|e| AppError::input(format!("Failed to write pairs database: {e}")))?;
    sink.flush()
        .map_err(|e| AppError::input(format!("Failed to write pairs database: {e}")))
}
