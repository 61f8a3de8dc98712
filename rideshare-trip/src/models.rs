use chrono::{DateTime, Utc};
use rideshare_shared::Location;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::Scheduled => "scheduled",
            TripStatus::InProgress => "in_progress",
            TripStatus::Completed => "completed",
            TripStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TripStatus::Completed | TripStatus::Cancelled)
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversationLevel {
    Low,
    #[default]
    Medium,
    High,
}

/// Informational ride preferences shown to passengers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub pets_allowed: bool,
    pub music_allowed: bool,
    pub conversation_level: ConversationLevel,
    pub smoking_allowed: bool,
    pub stops: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            pets_allowed: true,
            music_allowed: true,
            conversation_level: ConversationLevel::Medium,
            smoking_allowed: false,
            stops: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Car {
    pub model: String,
    pub color: String,
    pub license_plate: Option<String>,
    pub year: Option<i32>,
}

/// Passenger entries only exist once confirmed; there is no tentative hold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PassengerStatus {
    Confirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PassengerEntry {
    pub status: PassengerStatus,
    pub pickup_location: Location,
    pub seats_reserved: u32,
    pub joined_at: DateTime<Utc>,
}

/// A ride published by a driver.
///
/// Seat ledger: `available_seats + held_seats + Σ seats_reserved == total_seats`.
/// `held_seats` are seats the driver keeps off the market.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: String,
    pub driver_id: String,
    pub status: TripStatus,
    pub origin: Location,
    pub destination: Location,
    pub departure_time: DateTime<Utc>,
    pub estimated_arrival: DateTime<Utc>,
    pub available_seats: u32,
    pub total_seats: u32,
    #[serde(default)]
    pub held_seats: u32,
    pub price: f64,
    #[serde(default)]
    pub preferences: Preferences,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub car: Option<Car>,
    #[serde(default)]
    pub passengers: BTreeMap<String, PassengerEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_at: Option<DateTime<Utc>>,
}

impl Trip {
    pub fn seats_reserved(&self) -> u32 {
        self.passengers.values().map(|p| p.seats_reserved).sum()
    }

    pub fn is_balanced(&self) -> bool {
        self.available_seats + self.held_seats + self.seats_reserved() == self.total_seats
    }

    /// Open for booking: scheduled with at least one free seat.
    pub fn is_bookable(&self) -> bool {
        self.status == TripStatus::Scheduled && self.available_seats > 0 && !self.is_removed()
    }

    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }

    /// Refreshes `updated_at` without ever moving it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

/// What a driver submits to publish a trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripSpec {
    pub origin: Location,
    pub destination: Location,
    pub departure_time: DateTime<Utc>,
    pub estimated_arrival: DateTime<Utc>,
    pub total_seats: u32,
    /// Defaults to `total_seats`.
    #[serde(default)]
    pub available_seats: Option<u32>,
    pub price: f64,
    #[serde(default)]
    pub preferences: Preferences,
    #[serde(default)]
    pub car: Option<Car>,
}

/// Partial trip update. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripPatch {
    pub status: Option<TripStatus>,
    pub origin: Option<Location>,
    pub destination: Option<Location>,
    pub departure_time: Option<DateTime<Utc>>,
    pub estimated_arrival: Option<DateTime<Utc>>,
    pub available_seats: Option<u32>,
    pub price: Option<f64>,
    pub preferences: Option<Preferences>,
    pub car: Option<Car>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trip_spec_defaults() {
        let json = r#"
            {
                "origin": { "latitude": 40.4168, "longitude": -3.7038, "address": "Madrid", "city": "Madrid" },
                "destination": { "latitude": 41.3851, "longitude": 2.1734, "address": "Barcelona", "city": "Barcelona" },
                "departureTime": "2025-06-01T08:00:00Z",
                "estimatedArrival": "2025-06-01T14:00:00Z",
                "totalSeats": 4,
                "price": 25.5
            }
        "#;
        let spec: TripSpec = serde_json::from_str(json).expect("Failed to deserialize");
        assert_eq!(spec.available_seats, None);
        assert_eq!(spec.preferences, Preferences::default());
        assert!(spec.car.is_none());
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(serde_json::to_string(&TripStatus::InProgress).unwrap(), "\"in_progress\"");
        assert_eq!(TripStatus::Cancelled.to_string(), "cancelled");
        assert!(TripStatus::Completed.is_terminal());
        assert!(!TripStatus::Scheduled.is_terminal());
    }
}
