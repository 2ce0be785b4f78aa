//! Great-circle helpers on a spherical Earth.

use crate::types::GeoPoint;

/// Mean Earth radius in meters (IUGG).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Haversine distance between two points in meters.
pub fn haversine_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = lat2 - lat1;
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Latitude span in degrees covered by `meters` along a meridian.
pub fn meters_to_lat_deg(meters: f64) -> f64 {
    (meters / EARTH_RADIUS_M).to_degrees()
}

/// Largest longitude offset in degrees of any point within `meters` of a
/// point at latitude `lat`.
///
/// Returns `None` when the circle reaches a pole or otherwise spans every
/// longitude.
pub fn meters_to_lng_deg(meters: f64, lat: f64) -> Option<f64> {
    let delta = meters / EARTH_RADIUS_M;
    if lat.abs() + delta.to_degrees() >= 90.0 {
        return None;
    }
    let ratio = delta.sin() / lat.to_radians().cos();
    if !(ratio < 1.0) {
        return None;
    }
    Some(ratio.asin().to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(lat: f64, lng: f64) -> GeoPoint {
        GeoPoint { lat, lng }
    }

    #[test]
    fn test_haversine_zero() {
        assert_eq!(haversine_m(&p(10.0, 10.0), &p(10.0, 10.0)), 0.0);
    }

    #[test]
    fn test_haversine_one_degree_latitude() {
        let d = haversine_m(&p(0.0, 0.0), &p(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 10.0, "got {}", d);
    }

    #[test]
    fn test_haversine_nearby_manhattan_points() {
        let a = p(40.7128, -74.0060);
        let b = p(40.7129, -74.0061);
        let d = haversine_m(&a, &b);
        assert!(d > 10.0 && d < 20.0, "got {}", d);
        assert!((haversine_m(&b, &a) - d).abs() < 1e-9);
    }

    #[test]
    fn test_haversine_across_antimeridian() {
        let d = haversine_m(&p(0.0, 179.9999), &p(0.0, -179.9999));
        assert!(d < 30.0, "got {}", d);
    }

    #[test]
    fn test_lng_span_widens_with_latitude() {
        let equator = meters_to_lng_deg(1_000.0, 0.0).unwrap();
        let north = meters_to_lng_deg(1_000.0, 60.0).unwrap();
        assert!((equator - meters_to_lat_deg(1_000.0)).abs() < 1e-9);
        assert!(north > equator * 1.9);
    }

    #[test]
    fn test_lng_span_none_near_pole() {
        assert!(meters_to_lng_deg(10_000.0, 89.95).is_none());
        assert!(meters_to_lng_deg(30_000_000.0, 0.0).is_none());
    }
}
