use chrono::{DateTime, Utc};
use rideshare_core::{CoreError, CoreResult};
use rideshare_shared::{Location, Masked};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pickup request status in the lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PickupStatus {
    Pending,
    /// Pre-resolution state some clients write; never produced here.
    Waiting,
    Accepted,
    Rejected,
}

impl PickupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PickupStatus::Pending => "pending",
            PickupStatus::Waiting => "waiting",
            PickupStatus::Accepted => "accepted",
            PickupStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PickupStatus::Accepted | PickupStatus::Rejected)
    }

    /// Still waiting on the driver.
    pub fn is_actionable(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for PickupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The driver's answer to a pickup request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Accepted,
    Rejected,
}

impl From<Resolution> for PickupStatus {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Accepted => PickupStatus::Accepted,
            Resolution::Rejected => PickupStatus::Rejected,
        }
    }
}

/// A passenger's request to be collected at a location on a trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PickupRequest {
    pub id: String,
    pub trip_id: String,
    pub passenger_id: String,
    pub passenger_name: Masked<String>,
    pub location: Location,
    pub status: PickupStatus,
    #[serde(default)]
    pub estimated_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub actual_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PickupRequest {
    pub fn new(
        id: String,
        trip_id: &str,
        passenger_id: &str,
        passenger_name: &str,
        location: Location,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            trip_id: trip_id.to_string(),
            passenger_id: passenger_id.to_string(),
            passenger_name: Masked::from(passenger_name),
            location,
            status: PickupStatus::Pending,
            estimated_time: None,
            actual_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a driver's answer. Only non-terminal requests move.
    pub fn resolve(
        &mut self,
        resolution: Resolution,
        actual_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let target = PickupStatus::from(resolution);
        if self.status.is_terminal() {
            return Err(CoreError::InvalidTransitionError {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        self.status = target;
        if actual_time.is_some() {
            self.actual_time = actual_time;
        }
        if now > self.updated_at {
            self.updated_at = now;
        }
        Ok(())
    }
}

/// Non-status fields a pickup request may change after creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickupPatch {
    pub passenger_name: Option<Masked<String>>,
    pub location: Option<Location>,
    pub estimated_time: Option<DateTime<Utc>>,
}

impl PickupPatch {
    pub fn is_empty(&self) -> bool {
        self.passenger_name.is_none() && self.location.is_none() && self.estimated_time.is_none()
    }
}
