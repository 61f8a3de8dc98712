use serde::{Deserialize, Serialize};

/// A bare latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// True when both components are finite and inside the WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A structured place: caller-supplied coordinates plus the opaque address
/// strings shown to riders. Addresses are never geocoded here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub address: String,
    #[serde(default)]
    pub city: String,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64, address: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            latitude,
            longitude,
            address: address.into(),
            city: city.into(),
        }
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}
