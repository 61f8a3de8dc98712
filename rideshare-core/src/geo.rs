//! Great-circle distance on a spherical Earth.

use rideshare_shared::Coordinates;

/// Mean Earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance in kilometres between two points given in decimal
/// degrees.
pub fn distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    // Rounding can push `a` a hair outside [0, 1] for antipodal points.
    let a = a.clamp(0.0, 1.0);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

pub fn distance_between(a: &Coordinates, b: &Coordinates) -> f64 {
    distance_km(a.latitude, a.longitude, b.latitude, b.longitude)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MADRID: Coordinates = Coordinates { latitude: 40.4168, longitude: -3.7038 };
    const BARCELONA: Coordinates = Coordinates { latitude: 41.3851, longitude: 2.1734 };

    #[test]
    fn test_identical_points_are_zero() {
        assert!(distance_between(&MADRID, &MADRID).abs() < 1e-9);
        assert!(distance_km(-33.8688, 151.2093, -33.8688, 151.2093).abs() < 1e-9);
    }

    #[test]
    fn test_symmetric() {
        let there = distance_between(&MADRID, &BARCELONA);
        let back = distance_between(&BARCELONA, &MADRID);
        assert!((there - back).abs() < 1e-9);
    }

    #[test]
    fn test_known_distance() {
        // Madrid to Barcelona is roughly 505 km as the crow flies.
        let d = distance_between(&MADRID, &BARCELONA);
        assert!((d - 505.0).abs() < 5.0, "got {d}");
    }

    #[test]
    fn test_antipodes_are_half_circumference() {
        let d = distance_km(0.0, 0.0, 0.0, 180.0);
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_KM).abs() < 1e-6);
    }
}
