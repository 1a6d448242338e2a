//! Export per-pair evaluation results to CSV.
//!
//! One row per evaluated pair, easy to consume in spreadsheets or downstream
//! scripts. Unlabeled pairs have empty `label` and `cllr_contribution` fields.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::error::AppError;
use crate::eval::PairLr;

pub const RESULTS_HEADER: &str = "left_id,left_device,left_timestamp,right_id,right_device,right_timestamp,\
                                  delay_seconds,score,lr,log10_lr,cllr_contribution,label";

/// One results row. Field order is the column order.
#[derive(Debug, Serialize)]
struct ResultRow<'a> {
    left_id: u64,
    left_device: &'a str,
    left_timestamp: String,
    right_id: u64,
    right_device: &'a str,
    right_timestamp: String,
    delay_seconds: f64,
    score: f64,
    lr: String,
    log10_lr: String,
    cllr_contribution: Option<String>,
    label: Option<&'static str>,
}

impl<'a> From<&'a PairLr<'a>> for ResultRow<'a> {
    fn from(r: &'a PairLr<'a>) -> Self {
        let (left, right) = (&r.pair.left, &r.pair.right);
        Self {
            left_id: left.id.0,
            left_device: &left.device,
            left_timestamp: left.timestamp.to_rfc3339(),
            right_id: right.id.0,
            right_device: &right.device,
            right_timestamp: right.timestamp.to_rfc3339(),
            delay_seconds: r.pair.delay_secs,
            score: r.score,
            lr: format!("{:e}", r.lr),
            log10_lr: format!("{:.6}", r.log10_lr()),
            cllr_contribution: r.cllr_contribution().map(|c| format!("{c:.6}")),
            label: r.pair.label.map(|l| l.as_str()),
        }
    }
}

/// Write per-pair results to a CSV file.
pub fn write_results_csv(path: &Path, results: &[PairLr<'_>]) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::input(format!("Failed to create results CSV '{}': {e}", path.display())))?;
    write_results(BufWriter::new(file), results)
        .map_err(|e| AppError::input(format!("Failed to write results CSV '{}': {e}", path.display())))?;
    tracing::info!(path = %path.display(), rows = results.len(), "wrote results");
    Ok(())
}

pub fn write_results<W: Write>(sink: W, results: &[PairLr<'_>]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(sink);
    if results.is_empty() {
        // Serialized rows carry the header; an empty export still gets one.
        writer.write_record(RESULTS_HEADER.split(','))?;
    }
    for r in results {
        writer.serialize(ResultRow::from(r))?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CellIdentity, Label, MeasurementId, MeasurementRef, PairRecord, Radio};
    use chrono::{TimeZone, Utc};

    fn pair(label: Option<Label>, device: &str) -> PairRecord {
        let t = Utc.with_ymd_and_hms(2023, 5, 1, 10, 0, 0).unwrap();
        let side = |id: u64| MeasurementRef {
            id: MeasurementId(id),
            device: device.to_string(),
            timestamp: t,
            cell: CellIdentity::eci(Radio::Lte, 204, 8, id).unwrap(),
            site: None,
        };
        PairRecord {
            left: side(1),
            right: side(2),
            label,
            delay_secs: 30.0,
            score: None,
        }
    }

    #[test]
    fn rows_carry_lr_and_cost() {
        let p = pair(Some(Label::Colocated), "phone");
        let results = vec![PairLr {
            pair: &p,
            score: 12.5,
            lr: 100.0,
        }];
        let mut buf = Vec::new();
        write_results(&mut buf, &results).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(RESULTS_HEADER));
        let row: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(row.len(), 12);
        assert_eq!(row[0], "1");
        assert_eq!(row[1], "phone");
        assert_eq!(row[6].parse::<f64>().unwrap(), 30.0);
        assert_eq!(row[7], "12.5");
        assert_eq!(row[8].parse::<f64>().unwrap(), 100.0);
        assert_eq!(row[9], "2.000000");
        assert_eq!(row[11], "colocated");
    }

    #[test]
    fn unlabeled_rows_leave_cost_empty_and_quote_devices() {
        let p = pair(None, "a,b");
        let results = vec![PairLr {
            pair: &p,
            score: 1.0,
            lr: 1.0,
        }];
        let mut buf = Vec::new();
        write_results(&mut buf, &results).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let row = text.lines().nth(1).unwrap();
        assert!(row.contains("\"a,b\""));
        assert!(row.ends_with(",,"));

        // Quoted devices read back intact.
        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let record = reader.records().next().unwrap().unwrap();
        assert_eq!(&record[1], "a,b");
        assert_eq!(&record[4], "a,b");
    }

    #[test]
    fn empty_export_still_has_a_header() {
        let mut buf = Vec::new();
        write_results(&mut buf, &[]).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), format!("{RESULTS_HEADER}\n"));
    }
}
