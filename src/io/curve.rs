//! Read/write calibration model JSON and the evaluation curve CSVs.
//!
//! Model JSON is the portable representation of a fitted calibration:
//! - feature and score direction
//! - LR bounds and training class sizes
//! - the breakpoints of the step function
//!
//! The PAV and histogram CSVs hold the data behind the plots.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::eval::{HistogramBin, PavPoint};
use crate::models::CalibrationModel;

const TOOL: &str = "coloc";

/// On-disk wrapper around a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFile {
    pub tool: String,
    pub model: CalibrationModel,
}

/// Write a model JSON file.
pub fn write_model_json(path: &Path, model: &CalibrationModel) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::input(format!("Failed to create model JSON '{}': {e}", path.display())))?;

    let doc = ModelFile {
        tool: TOOL.to_string(),
        model: model.clone(),
    };
    serde_json::to_writer_pretty(BufWriter::new(file), &doc)
        .map_err(|e| AppError::input(format!("Failed to write model JSON: {e}")))?;

    tracing::info!(path = %path.display(), breakpoints = model.breakpoints.len(), "wrote model");
    Ok(())
}

/// Read and validate a model JSON file.
pub fn read_model_json(path: &Path) -> Result<CalibrationModel, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::input(format!("Failed to open model JSON '{}': {e}", path.display())))?;
    let doc: ModelFile =
        serde_json::from_reader(file).map_err(|e| AppError::input(format!("Invalid model JSON: {e}")))?;
    doc.model.validate()?;
    Ok(doc.model)
}

#[derive(Debug, Serialize)]
struct PavRow {
    score: f64,
    lr: String,
    log10_lr: String,
    pav_lr: Option<String>,
    label: Option<&'static str>,
}

impl From<&PavPoint> for PavRow {
    fn from(p: &PavPoint) -> Self {
        Self {
            score: p.score,
            lr: format!("{:e}", p.lr),
            log10_lr: format!("{:.6}", p.lr.log10()),
            pav_lr: p.pav_lr.map(|v| format!("{v:e}")),
            label: p.label.map(|l| l.as_str()),
        }
    }
}

#[derive(Debug, Serialize)]
struct HistogramRow {
    log10_lr_lower: String,
    log10_lr_upper: String,
    colocated: usize,
    dislocated: usize,
}

impl From<&HistogramBin> for HistogramRow {
    fn from(b: &HistogramBin) -> Self {
        Self {
            log10_lr_lower: format!("{:.4}", b.log10_lower),
            log10_lr_upper: format!("{:.4}", b.log10_upper),
            colocated: b.colocated,
            dislocated: b.dislocated,
        }
    }
}

/// Write the ordered (score, LR) curve with its post-hoc PAV values.
pub fn write_pav_csv(path: &Path, curve: &[PavPoint]) -> Result<(), AppError> {
    write_csv(path, "PAV CSV", &["score", "lr", "log10_lr", "pav_lr", "label"], curve.iter().map(PavRow::from))
}

pub fn write_histogram_csv(path: &Path, bins: &[HistogramBin]) -> Result<(), AppError> {
    write_csv(
        path,
        "histogram CSV",
        &["log10_lr_lower", "log10_lr_upper", "colocated", "dislocated"],
        bins.iter().map(HistogramRow::from),
    )
}

/// `header` is only written by hand when there are no rows to carry it.
fn write_csv<T: Serialize>(
    path: &Path,
    what: &str,
    header: &[&str],
    rows: impl Iterator<Item = T>,
) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::input(format!("Failed to create {what} '{}': {e}", path.display())))?;
    let failed = |e: csv::Error| AppError::input(format!("Failed to write {what} '{}': {e}", path.display()));
    let mut writer = csv::Writer::from_writer(BufWriter::new(file));
    let mut rows = rows.peekable();
    if rows.peek().is_none() {
        writer.write_record(header).map_err(failed)?;
    }
    for row in rows {
        writer.serialize(row).map_err(failed)?;
    }
    writer.flush().map_err(|e| failed(e.into()))
}
