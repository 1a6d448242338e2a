//! Seeded train/test split of a labeled pair set.

use rand::prelude::*;
use rand::rngs::StdRng;

use crate::domain::{Label, PairRecord};
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct TrainTest {
    pub train: Vec<PairRecord>,
    pub test: Vec<PairRecord>,
}

/// Hold out `fraction` of the pairs of each label for testing.
///
/// The split is stratified so the training part keeps both labels whenever the
/// input has them, and reproducible for a given `seed`. Both parts keep the input order.
pub fn holdout_split(pairs: Vec<PairRecord>, fraction: f64, seed: u64) -> Result<TrainTest, AppError> {
    if !(fraction > 0.0 && fraction < 1.0) {
        return Err(AppError::input(format!(
            "Holdout fraction must be strictly between 0 and 1 (got {fraction})."
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut is_test = vec![false; pairs.len()];
    for label in [Some(Label::Colocated), Some(Label::Dislocated), None] {
        let mut idx: Vec<usize> = (0..pairs.len()).filter(|&i| pairs[i].label == label).collect();
        if idx.len() < 2 {
            continue;
        }
        let n_test = ((idx.len() as f64 * fraction).round() as usize).clamp(1, idx.len() - 1);
        idx.shuffle(&mut rng);
        for &i in &idx[..n_test] {
            is_test[i] = true;
        }
    }

    let (test, train): (Vec<_>, Vec<_>) = pairs
        .into_iter()
        .zip(is_test)
        .partition(|(_, test)| *test);
    Ok(TrainTest {
        train: train.into_iter().map(|(p, _)| p).collect(),
        test: test.into_iter().map(|(p, _)| p).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CellIdentity, MeasurementId, MeasurementRef, Radio};
    use chrono::{TimeZone, Utc};

    fn pairs(n: usize) -> Vec<PairRecord> {
        let side = |id: u64| MeasurementRef {
            id: MeasurementId(id),
            device: "d".to_string(),
            timestamp: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            cell: CellIdentity::eci(Radio::Lte, 204, 8, 1).unwrap(),
            site: None,
        };
        (0..n)
            .map(|i| PairRecord {
                left: side(i as u64),
                right: side(i as u64 + 1_000),
                label: Some(if i % 2 == 0 { Label::Colocated } else { Label::Dislocated }),
                delay_secs: 0.0,
                score: Some(i as f64),
            })
            .collect()
    }

    #[test]
    fn split_is_stratified_and_reproducible() {
        let a = holdout_split(pairs(40), 0.25, 7).unwrap();
        let b = holdout_split(pairs(40), 0.25, 7).unwrap();
        assert_eq!(a.test, b.test);
        assert_eq!(a.test.len(), 10);
        assert_eq!(a.train.len(), 30);
        let test_colocated = a.test.iter().filter(|p| p.label == Some(Label::Colocated)).count();
        assert_eq!(test_colocated, 5);
    }

    #[test]
    fn training_part_keeps_both_labels() {
        let split = holdout_split(pairs(4), 0.9, 1).unwrap();
        assert!(split.train.iter().any(|p| p.label == Some(Label::Colocated)));
        assert!(split.train.iter().any(|p| p.label == Some(Label::Dislocated)));
    }

    #[test]
    fn fraction_must_be_a_proper_fraction() {
        assert!(holdout_split(pairs(4), 0.0, 1).is_err());
        assert!(holdout_split(pairs(4), 1.0, 1).is_err());
    }
}
