use rideshare_shared::Coordinates;
use serde::{Deserialize, Serialize};

use crate::geo::distance_between;

/// Search radius used when the caller does not supply one (500 m).
pub const DEFAULT_SEARCH_RADIUS_KM: f64 = 0.5;

fn default_radius() -> f64 {
    DEFAULT_SEARCH_RADIUS_KM
}

/// Proximity query: a trip matches when both its origin and its
/// destination lie within `max_distance_km` of the requested points.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripSearchQuery {
    pub origin: Coordinates,
    pub destination: Coordinates,
    #[serde(default = "default_radius")]
    pub max_distance_km: f64,
}

impl TripSearchQuery {
    pub fn new(origin: Coordinates, destination: Coordinates, max_distance_km: f64) -> Self {
        Self {
            origin,
            destination,
            max_distance_km,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.origin.is_valid()
            && self.destination.is_valid()
            && self.max_distance_km.is_finite()
            && self.max_distance_km >= 0.0
    }

    pub fn matches(&self, origin: &Coordinates, destination: &Coordinates) -> bool {
        distance_between(&self.origin, origin) <= self.max_distance_km
            && distance_between(&self.destination, destination) <= self.max_distance_km
    }
}
