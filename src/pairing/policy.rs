//! Labeling rules for candidate pairs.
//!
//! Exactly one policy is configured per run; it is the single source of truth
//! for "colocated" vs "dislocated". A policy may decline to label a pair
//! (`None`), in which case the pair is excluded and counted as ambiguous.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::domain::{Label, Measurement, RunConfig};
use crate::error::AppError;
use crate::math::haversine_m;

pub trait PairingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn label(&self, left: &Measurement, right: &Measurement) -> Option<Label>;
}

/// Ground truth from the `track` column: devices carried together share a track.
///
/// Measurements without a track cannot be labeled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackPolicy;

impl PairingPolicy for TrackPolicy {
    fn name(&self) -> &'static str {
        "track"
    }

    fn label(&self, left: &Measurement, right: &Measurement) -> Option<Label> {
        let (a, b) = (left.track.as_ref()?, right.track.as_ref()?);
        Some(if a == b { Label::Colocated } else { Label::Dislocated })
    }
}

/// Known co-present device sets. Devices outside every group form a group of their own.
#[derive(Debug, Clone, Default)]
pub struct DeviceGroups {
    group_of: HashMap<String, usize>,
    group_count: usize,
}

#[derive(Debug, Deserialize)]
struct GroupsFile {
    groups: Vec<Vec<String>>,
}

impl DeviceGroups {
    pub fn new(groups: Vec<Vec<String>>) -> Result<Self, AppError> {
        let mut group_of = HashMap::new();
        for (idx, group) in groups.iter().enumerate() {
            for device in group {
                match group_of.insert(device.clone(), idx) {
                    Some(prev) if prev != idx => {
                        return Err(AppError::input(format!(
                            "Device '{device}' appears in colocation groups {} and {}.",
                            prev + 1,
                            idx + 1
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(Self {
            group_of,
            group_count: groups.len(),
        })
    }

    /// Read `groups = [["a", "b"], ...]` from a TOML file.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::input(format!("Failed to read '{}': {e}", path.display())))?;
        Self::from_toml(&text)
            .map_err(|e| AppError::input(format!("Invalid colocation groups in '{}': {e}", path.display())))
    }

    pub fn from_toml(text: &str) -> Result<Self, AppError> {
        let parsed: GroupsFile = toml::from_str(text).map_err(|e| AppError::input(e.to_string()))?;
        Self::new(parsed.groups)
    }

    pub fn group_count(&self) -> usize {
        self.group_count
    }
}

impl PairingPolicy for DeviceGroups {
    fn name(&self) -> &'static str {
        "device-groups"
    }

    fn label(&self, left: &Measurement, right: &Measurement) -> Option<Label> {
        let same = match (self.group_of.get(&left.device), self.group_of.get(&right.device)) {
            (Some(a), Some(b)) => a == b,
            _ => left.device == right.device,
        };
        Some(if same { Label::Colocated } else { Label::Dislocated })
    }
}

/// Label by GPS distance between the two device positions.
///
/// `distance <= colocated_radius_m` is colocated, `distance >= dislocated_min_distance_m`
/// is dislocated; anything in between, or a pair missing a position, is ambiguous.
#[derive(Debug, Clone, Copy)]
pub struct ProximityPolicy {
    colocated_radius_m: f64,
    dislocated_min_distance_m: f64,
}

impl ProximityPolicy {
    pub fn new(config: &RunConfig) -> Result<Self, AppError> {
        let (near, far) = (config.colocated_radius_m, config.dislocated_min_distance_m);
        if !(near.is_finite() && far.is_finite() && near >= 0.0) {
            return Err(AppError::input("Proximity thresholds must be finite and non-negative."));
        }
        if near >= far {
            return Err(AppError::input(format!(
                "Colocated radius ({near} m) must be smaller than the dislocated minimum distance ({far} m)."
            )));
        }
        Ok(Self {
            colocated_radius_m: near,
            dislocated_min_distance_m: far,
        })
    }
}

impl PairingPolicy for ProximityPolicy {
    fn name(&self) -> &'static str {
        "proximity"
    }

    fn label(&self, left: &Measurement, right: &Measurement) -> Option<Label> {
        let d = haversine_m(left.position?, right.position?);
        if d <= self.colocated_radius_m {
            Some(Label::Colocated)
        } else if d >= self.dislocated_min_distance_m {
            Some(Label::Dislocated)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CellIdentity, GeoPoint, MeasurementId, Radio};
    use crate::error::ErrorKind;
    use chrono::{TimeZone, Utc};

    fn m(device: &str, track: Option<&str>, position: Option<GeoPoint>) -> Measurement {
        Measurement {
            id: MeasurementId(1),
            device: device.to_string(),
            track: track.map(str::to_string),
            timestamp: Utc.with_ymd_and_hms(2023, 5, 1, 10, 0, 0).unwrap(),
            cell: CellIdentity::eci(Radio::Lte, 204, 8, 1).unwrap(),
            position,
        }
    }

    #[test]
    fn track_policy_requires_both_tracks() {
        let p = TrackPolicy;
        assert_eq!(p.label(&m("a", Some("car"), None), &m("b", Some("car"), None)), Some(Label::Colocated));
        assert_eq!(p.label(&m("a", Some("car"), None), &m("b", Some("bike"), None)), Some(Label::Dislocated));
        assert_eq!(p.label(&m("a", None, None), &m("b", Some("bike"), None)), None);
    }

    #[test]
    fn device_groups_from_toml() {
        let groups = DeviceGroups::from_toml("groups = [[\"a\", \"b\"], [\"c\"]]").unwrap();
        assert_eq!(groups.group_count(), 2);
        assert_eq!(groups.label(&m("a", None, None), &m("b", None, None)), Some(Label::Colocated));
        assert_eq!(groups.label(&m("a", None, None), &m("c", None, None)), Some(Label::Dislocated));
        assert_eq!(groups.label(&m("x", None, None), &m("y", None, None)), Some(Label::Dislocated));
    }

    #[test]
    fn device_in_two_groups_is_rejected() {
        let err = DeviceGroups::from_toml("groups = [[\"a\", \"b\"], [\"b\", \"c\"]]").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[test]
    fn proximity_policy_has_an_ambiguous_band() {
        let config = RunConfig {
            colocated_radius_m: 100.0,
            dislocated_min_distance_m: 1_000.0,
            ..RunConfig::default()
        };
        let p = ProximityPolicy::new(&config).unwrap();
        let here = Some(GeoPoint::new(5.0, 52.0));
        // ~0.0009 deg latitude is ~100 m; use clear margins on either side.
        let near = Some(GeoPoint::new(5.0, 52.0005));
        let mid = Some(GeoPoint::new(5.0, 52.004));
        let far = Some(GeoPoint::new(5.0, 52.02));
        assert_eq!(p.label(&m("a", None, here), &m("b", None, near)), Some(Label::Colocated));
        assert_eq!(p.label(&m("a", None, here), &m("b", None, mid)), None);
        assert_eq!(p.label(&m("a", None, here), &m("b", None, far)), Some(Label::Dislocated));
        assert_eq!(p.label(&m("a", None, here), &m("b", None, None)), None);
    }

    #[test]
    fn proximity_thresholds_must_not_overlap() {
        let config = RunConfig {
            colocated_radius_m: 500.0,
            dislocated_min_distance_m: 500.0,
            ..RunConfig::default()
        };
        assert!(ProximityPolicy::new(&config).is_err());
    }
}
