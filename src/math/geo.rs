//! Great-circle geometry on WGS84 coordinates.
//!
//! A spherical earth is accurate to ~0.5% which is far below the spread of
//! antenna-to-antenna distances this tool works with.

use crate::domain::GeoPoint;

/// Mean earth radius (m), IUGG.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Haversine distance in meters.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    // Clamp guards against h drifting slightly above 1 for antipodal points.
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Initial great-circle bearing from `a` to `b`, degrees clockwise from north
/// in `[0, 360)`. `None` when the points coincide.
pub fn initial_bearing_deg(a: GeoPoint, b: GeoPoint) -> Option<f64> {
    if a == b {
        return None;
    }
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlon = (b.lon - a.lon).to_radians();
    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    Some(y.atan2(x).to_degrees().rem_euclid(360.0))
}

/// Wrap an angle into `(-180, 180]` degrees.
pub fn normalize_deg(angle: f64) -> f64 {
    let a = angle.rem_euclid(360.0);
    if a > 180.0 { a - 360.0 } else { a }
}

/// Sum of how far each antenna's beam turns away from the line to the other
/// antenna, in `[0, 360]` degrees. Zero when both point straight at each other
/// or share a position.
pub fn facing_angle_deg(a: GeoPoint, azimuth_a: f64, b: GeoPoint, azimuth_b: f64) -> f64 {
    let Some(bearing) = initial_bearing_deg(a, b) else {
        return 0.0;
    };
    let from_a = normalize_deg(azimuth_a - bearing);
    let from_b = normalize_deg(bearing + 180.0 - azimuth_b);
    from_a.abs() + from_b.abs()
}
