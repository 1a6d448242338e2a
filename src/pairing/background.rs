//! Dislocated training pairs built from background measurements.
//!
//! For one test pair, the left measurement is paired with every background
//! measurement of the same device (and the same track, when the background
//! knows the left measurement's track) taken at least `min_gap` away from it.
//! Each background measurement is moved to the left timestamp plus a delay
//! drawn from the colocated training pairs, so both labels share one delay
//! profile.

use chrono::Duration;
use rand::Rng;

use crate::domain::{Label, MeasurementRef, PairRecord, secs_duration};
use crate::error::{AppError, ErrorKind};
use crate::store::MeasurementStore;

/// Background measurements closer than this to the reference are skipped.
pub const DEFAULT_MIN_BACKGROUND_GAP_SECS: u64 = 24 * 3600;

/// Counters of an evaluation against background measurements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackgroundStats {
    pub colocated_training: usize,
    /// Dislocated training pairs built over all test pairs.
    pub dislocated_built: usize,
    /// Dislocated training pairs without a computable score.
    pub dislocated_unresolvable: usize,
    /// Test pairs for which no model could be fitted (no usable background).
    pub without_model: usize,
}

pub struct BackgroundSampler<'a> {
    background: &'a MeasurementStore,
    delays: Vec<f64>,
    min_gap: Duration,
}

impl<'a> BackgroundSampler<'a> {
    /// `colocated` supplies the delay distribution; other labels are ignored.
    pub fn new(background: &'a MeasurementStore, colocated: &[PairRecord], min_gap_secs: u64) -> Result<Self, AppError> {
        let delays: Vec<f64> = colocated
            .iter()
            .filter(|p| p.label == Some(Label::Colocated))
            .map(|p| p.delay_secs)
            .collect();
        if delays.is_empty() {
            return Err(AppError::new(
                ErrorKind::InsufficientTrainingData,
                "Background evaluation needs at least one colocated training pair.",
            ));
        }
        Ok(Self {
            background,
            delays,
            min_gap: Duration::seconds(min_gap_secs.min(i64::MAX as u64 / 1000) as i64),
        })
    }

    /// Dislocated pairs for `reference`, in background order.
    ///
    /// A device absent from the background yields no pairs.
    pub fn dislocated_for<R: Rng>(&self, reference: &MeasurementRef, rng: &mut R) -> Vec<PairRecord> {
        let Ok(own) = self.background.get_by_device(&reference.device) else {
            return Vec::new();
        };
        let track = own
            .iter()
            .find(|m| m.timestamp == reference.timestamp && m.cell == reference.cell)
            .and_then(|m| m.track.as_deref());

        own.iter()
            .filter(|m| track.is_none_or(|t| m.track.as_deref() == Some(t)))
            .filter(|m| (m.timestamp - reference.timestamp).abs() >= self.min_gap)
            .filter_map(|m| {
                let delay_secs = self.delays[rng.gen_range(0..self.delays.len())];
                let mut right = MeasurementRef::from_measurement(m, None);
                right.timestamp = reference.timestamp.checked_add_signed(secs_duration(delay_secs))?;
                Some(PairRecord {
                    left: reference.clone(),
                    right,
                    label: Some(Label::Dislocated),
                    delay_secs,
                    score: None,
                })
            })
            .collect()
    }
}
