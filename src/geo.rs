//! Great-circle distance (C4 movement detection input).
//!
//! Grounded in `original_source/src/mqtt_handler.py::_haversine_m` and spec §9.

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Distance in meters between two lat/lon points, or `None` if any input is
/// non-finite.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> Option<f64> {
    if ![lat1, lon1, lat2, lon2].iter().all(|v| v.is_finite()) {
        return None;
    }

    let (lat1r, lat2r) = (lat1.to_radians(), lat2.to_radians());
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1r.cos() * lat2r.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    Some(EARTH_RADIUS_M * c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_s2_distance() {
        let d = haversine_m(37.5637125, -122.2189855, 37.5800000, -122.2200000).unwrap();
        assert!((d - 1813.0).abs() <= 2.0, "expected ~1813m, got {d}");
    }

    #[test]
    fn zero_distance_for_identical_points() {
        let d = haversine_m(10.0, 20.0, 10.0, 20.0).unwrap();
        assert!(d.abs() < 1e-6);
    }

    #[test]
    fn non_finite_input_returns_none() {
        assert!(haversine_m(f64::NAN, 0.0, 0.0, 0.0).is_none());
        assert!(haversine_m(0.0, f64::INFINITY, 0.0, 0.0).is_none());
    }
}
