//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - used in-memory during pairing and calibration
//! - exported to CSV / binary pair stores and result files
//! - reloaded later for evaluation

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Radio access technology of a serving cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Radio {
    Gsm,
    Umts,
    Lte,
    Nr,
}

impl Radio {
    pub fn as_str(self) -> &'static str {
        match self {
            Radio::Gsm => "GSM",
            Radio::Umts => "UMTS",
            Radio::Lte => "LTE",
            Radio::Nr => "NR",
        }
    }

    /// GSM and UMTS cells are addressed by (LAC, CI); LTE and NR by ECI.
    pub fn uses_eci(self) -> bool {
        matches!(self, Radio::Lte | Radio::Nr)
    }
}

impl fmt::Display for Radio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Radio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GSM" => Ok(Radio::Gsm),
            "UMTS" => Ok(Radio::Umts),
            "LTE" => Ok(Radio::Lte),
            "NR" => Ok(Radio::Nr),
            other => Err(format!("Unrecognized radio type '{other}'. Expected GSM, UMTS, LTE or NR.")),
        }
    }
}

/// Technology-specific part of a cell identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CellKey {
    Cgi { lac: u32, ci: u32 },
    Eci { eci: u64 },
}

/// Structured key of a physical antenna sector.
///
/// Equality is structural: two identities with the same fields refer to the same cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CellIdentity {
    radio: Radio,
    mcc: u16,
    mnc: u16,
    key: CellKey,
}

impl CellIdentity {
    /// Build a GSM/UMTS identity.
    pub fn cgi(radio: Radio, mcc: u16, mnc: u16, lac: u32, ci: u32) -> Result<Self, String> {
        if radio.uses_eci() {
            return Err(format!("{radio} cells are identified by `eci`, not `lac`/`ci`."));
        }
        Ok(Self {
            radio,
            mcc,
            mnc,
            key: CellKey::Cgi { lac, ci },
        })
    }

    /// Build an LTE/NR identity.
    pub fn eci(radio: Radio, mcc: u16, mnc: u16, eci: u64) -> Result<Self, String> {
        if !radio.uses_eci() {
            return Err(format!("{radio} cells are identified by `lac`/`ci`, not `eci`."));
        }
        Ok(Self {
            radio,
            mcc,
            mnc,
            key: CellKey::Eci { eci },
        })
    }

    /// Build an identity from loosely typed columns, picking the fields the radio needs.
    pub fn from_parts(
        radio: Radio,
        mcc: u16,
        mnc: u16,
        lac: Option<u32>,
        ci: Option<u32>,
        eci: Option<u64>,
    ) -> Result<Self, String> {
        if radio.uses_eci() {
            let eci = eci.ok_or_else(|| format!("{radio} cell requires an `eci` value."))?;
            Self::eci(radio, mcc, mnc, eci)
        } else {
            let lac = lac.ok_or_else(|| format!("{radio} cell requires a `lac` value."))?;
            let ci = ci.ok_or_else(|| format!("{radio} cell requires a `ci` value."))?;
            Self::cgi(radio, mcc, mnc, lac, ci)
        }
    }

    pub fn radio(&self) -> Radio {
        self.radio
    }

    pub fn mcc(&self) -> u16 {
        self.mcc
    }

    pub fn mnc(&self) -> u16 {
        self.mnc
    }

    pub fn key(&self) -> CellKey {
        self.key
    }
}

impl fmt::Display for CellIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key {
            CellKey::Cgi { lac, ci } => write!(f, "{}:{}-{}-{}-{}", self.radio, self.mcc, self.mnc, lac, ci),
            CellKey::Eci { eci } => write!(f, "{}:{}-{}-{}", self.radio, self.mcc, self.mnc, eci),
        }
    }
}

impl FromStr for CellIdentity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (radio, rest) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("Invalid cell identity '{s}': missing `<RADIO>:` prefix."))?;
        let radio: Radio = radio.parse()?;
        let parts: Vec<&str> = rest.split('-').collect();
        let bad = |what: &str| format!("Invalid cell identity '{s}': bad {what}.");

        match (radio.uses_eci(), parts.as_slice()) {
            (true, [mcc, mnc, eci]) => Self::eci(
                radio,
                mcc.parse().map_err(|_| bad("mcc"))?,
                mnc.parse().map_err(|_| bad("mnc"))?,
                eci.parse().map_err(|_| bad("eci"))?,
            ),
            (false, [mcc, mnc, lac, ci]) => Self::cgi(
                radio,
                mcc.parse().map_err(|_| bad("mcc"))?,
                mnc.parse().map_err(|_| bad("mnc"))?,
                lac.parse().map_err(|_| bad("lac"))?,
                ci.parse().map_err(|_| bad("ci"))?,
            ),
            _ => Err(bad("number of fields")),
        }
    }
}

impl TryFrom<String> for CellIdentity {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CellIdentity> for String {
    fn from(value: CellIdentity) -> Self {
        value.to_string()
    }
}

/// WGS84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
}

impl GeoPoint {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    pub fn is_valid(&self) -> bool {
        self.lon.is_finite()
            && self.lat.is_finite()
            && (-180.0..=180.0).contains(&self.lon)
            && (-90.0..=90.0).contains(&self.lat)
    }
}

/// Stable identifier of a measurement within one measurement file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeasurementId(pub u64);

impl fmt::Display for MeasurementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single serving-cell observation of a device. Immutable once recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub id: MeasurementId,
    pub device: String,
    /// Ground-truth co-presence group (e.g. a vehicle carrying several phones).
    pub track: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub cell: CellIdentity,
    /// Device GPS position, if recorded.
    pub position: Option<GeoPoint>,
}

/// Ground-truth (training) or hypothesized (test) relation of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Colocated,
    Dislocated,
}

impl Label {
    pub fn as_str(self) -> &'static str {
        match self {
            Label::Colocated => "colocated",
            Label::Dislocated => "dislocated",
        }
    }

    pub fn is_colocated(self) -> bool {
        self == Label::Colocated
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A labeled pair of measurements borrowed from a `MeasurementStore`.
#[derive(Debug, Clone, Copy)]
pub struct Pair<'a> {
    pub left: &'a Measurement,
    pub right: &'a Measurement,
    pub label: Label,
}

impl Pair<'_> {
    /// Absolute time between the two measurements.
    pub fn delay(&self) -> Duration {
        (self.right.timestamp - self.left.timestamp).abs()
    }
}

/// Convert a duration to fractional seconds.
pub fn duration_secs(d: Duration) -> f64 {
    d.as_seconds_f64()
}

/// Inverse of `duration_secs`, at microsecond resolution.
pub fn secs_duration(secs: f64) -> Duration {
    Duration::microseconds((secs * 1e6).round() as i64)
}

/// One side of a persisted pair: enough of the measurement to identify it and
/// to recompute features without the original measurement file.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRef {
    pub id: MeasurementId,
    pub device: String,
    pub timestamp: DateTime<Utc>,
    pub cell: CellIdentity,
    /// Resolved antenna position of `cell`, if known.
    pub site: Option<GeoPoint>,
}

impl MeasurementRef {
    pub fn from_measurement(m: &Measurement, site: Option<GeoPoint>) -> Self {
        Self {
            id: m.id,
            device: m.device.clone(),
            timestamp: m.timestamp,
            cell: m.cell.clone(),
            site,
        }
    }
}

/// An owned pair as stored in a pairs file.
#[derive(Debug, Clone, PartialEq)]
pub struct PairRecord {
    pub left: MeasurementRef,
    pub right: MeasurementRef,
    pub label: Option<Label>,
    pub delay_secs: f64,
    pub score: Option<f64>,
}

impl PairRecord {
    pub fn from_pair(pair: &Pair<'_>, left_site: Option<GeoPoint>, right_site: Option<GeoPoint>) -> Self {
        Self {
            left: MeasurementRef::from_measurement(pair.left, left_site),
            right: MeasurementRef::from_measurement(pair.right, right_site),
            label: Some(pair.label),
            delay_secs: duration_secs(pair.delay()),
            score: None,
        }
    }
}

/// An antenna record from the cell database.
#[derive(Debug, Clone, PartialEq)]
pub struct CellSite {
    pub cell: CellIdentity,
    pub position: GeoPoint,
    /// Main beam direction in degrees clockwise from north, if known.
    pub azimuth: Option<f64>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
}

impl CellSite {
    /// `valid_from` is inclusive, `valid_to` exclusive; missing bounds are open.
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from.is_none_or(|from| at >= from) && self.valid_to.is_none_or(|to| at < to)
    }
}

/// What to do when the cell database returns several records for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Keep the first record in database order.
    #[value(alias = "take_first")]
    TakeFirst,
    /// Keep the last record in database order.
    #[value(alias = "take_last")]
    TakeLast,
    /// Abort with a duplicate-cell error.
    Error,
    /// Treat the cell as unresolvable.
    Drop,
}

/// Sense of the score → LR relation.
///
/// `Increasing` means a higher score implies a higher LR (e.g. a match
/// probability); `Decreasing` means the opposite (e.g. a distance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScoreDirection {
    Increasing,
    Decreasing,
}

/// Which scalar is derived from a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// Haversine distance (m) between the resolved antenna positions.
    Distance,
    /// Time between the two measurements (s).
    Delay,
    /// Number of other antennas closer to the left antenna than the right one.
    CountCloser,
    /// How far both antennas point away from each other (degrees, 0..=360).
    Angle,
    /// Externally computed score read from the pairs store.
    Stored,
}

impl FeatureKind {
    pub fn default_direction(self) -> ScoreDirection {
        match self {
            FeatureKind::Distance | FeatureKind::Delay | FeatureKind::CountCloser | FeatureKind::Angle => {
                ScoreDirection::Decreasing
            }
            FeatureKind::Stored => ScoreDirection::Increasing,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FeatureKind::Distance => "distance_m",
            FeatureKind::Delay => "delay_s",
            FeatureKind::CountCloser => "n_closer",
            FeatureKind::Angle => "angle_deg",
            FeatureKind::Stored => "score",
        }
    }
}

/// A full run's configuration as understood by the pipeline.
///
/// This is derived from CLI flags (plus defaults) and passed by reference into
/// every component constructor.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub max_delay_secs: u64,
    pub limit_colocated: Option<usize>,
    pub limit_dislocated: Option<usize>,
    /// Allow pairs between two measurements of the same device (self-consistency runs).
    pub allow_same_device: bool,
    /// Drop exact repeats (same device, timestamp and cell) when loading measurements.
    pub drop_repeated_measurements: bool,
    pub parallel: bool,
    pub on_duplicate_cell: DuplicatePolicy,

    /// Device positions at most this far apart (m) make a colocated training pair.
    pub colocated_radius_m: f64,
    /// Device positions at least this far apart (m) make a dislocated training pair.
    pub dislocated_min_distance_m: f64,

    pub feature: FeatureKind,
    /// Overrides `feature.default_direction()` when set.
    pub direction: Option<ScoreDirection>,
    pub min_lr: f64,
    pub max_lr: f64,
    pub histogram_bins: usize,
}

impl RunConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::seconds(self.max_delay_secs.min(i64::MAX as u64 / 1000) as i64)
    }

    pub fn score_direction(&self) -> ScoreDirection {
        self.direction.unwrap_or_else(|| self.feature.default_direction())
    }

    pub fn limit_for(&self, label: Label) -> Option<usize> {
        match label {
            Label::Colocated => self.limit_colocated,
            Label::Dislocated => self.limit_dislocated,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_delay_secs: 0,
            limit_colocated: None,
            limit_dislocated: None,
            allow_same_device: false,
            drop_repeated_measurements: true,
            parallel: false,
            on_duplicate_cell: DuplicatePolicy::TakeFirst,
            colocated_radius_m: 50.0,
            dislocated_min_distance_m: 5_000.0,
            feature: FeatureKind::Distance,
            direction: None,
            min_lr: 1e-4,
            max_lr: 1e4,
            histogram_bins: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_identity_text_form_parses_back() {
        let lte = CellIdentity::eci(Radio::Lte, 204, 8, 123_456).unwrap();
        assert_eq!(lte.to_string(), "LTE:204-8-123456");
        assert_eq!("LTE:204-8-123456".parse::<CellIdentity>().unwrap(), lte);

        let gsm = CellIdentity::cgi(Radio::Gsm, 204, 16, 1200, 33).unwrap();
        assert_eq!(gsm.to_string(), "GSM:204-16-1200-33");
        assert_eq!("gsm:204-16-1200-33".parse::<CellIdentity>().unwrap(), gsm);
    }

    #[test]
    fn cell_identity_rejects_mismatched_key() {
        assert!(CellIdentity::cgi(Radio::Lte, 204, 8, 1, 2).is_err());
        assert!(CellIdentity::eci(Radio::Umts, 204, 8, 1).is_err());
        assert!("LTE:204-8-1-2".parse::<CellIdentity>().is_err());
        assert!(CellIdentity::from_parts(Radio::Gsm, 204, 8, Some(1), None, None).is_err());
    }

    #[test]
    fn cell_site_activity_window() {
        let t = |s: &str| DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc);
        let site = CellSite {
            cell: CellIdentity::eci(Radio::Lte, 204, 8, 1).unwrap(),
            position: GeoPoint::new(5.0, 52.0),
            azimuth: None,
            valid_from: Some(t("2023-01-01T00:00:00Z")),
            valid_to: Some(t("2024-01-01T00:00:00Z")),
        };
        assert!(site.is_active_at(t("2023-01-01T00:00:00Z")));
        assert!(site.is_active_at(t("2023-06-01T00:00:00Z")));
        assert!(!site.is_active_at(t("2024-01-01T00:00:00Z")));
        assert!(!site.is_active_at(t("2022-12-31T23:59:59Z")));
    }

    #[test]
    fn delays_keep_sub_millisecond_precision() {
        let d = Duration::microseconds(1_500_250);
        assert!((duration_secs(d) - 1.50025).abs() < 1e-12);
        assert_eq!(secs_duration(duration_secs(d)), d);
        assert_eq!(duration_secs(Duration::nanoseconds(400)), 4e-7);
    }
}
