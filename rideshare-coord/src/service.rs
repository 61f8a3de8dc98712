use chrono::{DateTime, Utc};
use rideshare_core::{RetryPolicy, TripSearchQuery};
use rideshare_pickup::{PickupRequest, PickupStore, Resolution};
use rideshare_shared::Location;
use rideshare_trip::{Trip, TripPatch, TripSpec, TripStatus, TripStore};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{CoordinationError, CoordinationResult};

/// Entry point for driver and passenger commands.
///
/// Reads go through the retry policy. Writes never do: a failed write may
/// or may not have landed, so the error is handed back to the caller.
#[derive(Clone)]
pub struct CoordinationService {
    trips: Arc<TripStore>,
    pickups: Arc<PickupStore>,
    retry: RetryPolicy,
}

impl CoordinationService {
    pub fn new(trips: Arc<TripStore>, pickups: Arc<PickupStore>, retry: RetryPolicy) -> Self {
        Self { trips, pickups, retry }
    }

    pub async fn publish_trip(&self, driver_id: &str, spec: TripSpec) -> CoordinationResult<Trip> {
        Ok(self.trips.create(driver_id, spec).await?)
    }

    pub async fn book_seat(
        &self,
        trip_id: &str,
        passenger_id: &str,
        pickup_location: &Location,
        seats_requested: u32,
    ) -> CoordinationResult<Trip> {
        Ok(self
            .trips
            .reserve_seats(trip_id, passenger_id, pickup_location, seats_requested)
            .await?)
    }

    /// No booking is required first; the trip only has to be visible.
    pub async fn request_pickup(
        &self,
        trip_id: &str,
        passenger_id: &str,
        passenger_name: &str,
        location: Location,
    ) -> CoordinationResult<PickupRequest> {
        let trips = &self.trips;
        self.retry
            .run("request_pickup.trip", move || trips.get_by_id(trip_id))
            .await?;

        Ok(self
            .pickups
            .create(trip_id, passenger_id, passenger_name, location)
            .await?)
    }

    /// Settles a pickup request. The trip itself is left alone.
    pub async fn resolve_pickup(
        &self,
        pickup_id: &str,
        resolution: Resolution,
        actual_time: Option<DateTime<Utc>>,
    ) -> CoordinationResult<PickupRequest> {
        Ok(self.pickups.resolve(pickup_id, resolution, actual_time).await?)
    }

    /// Like `resolve_pickup`, but only for the driver who owns the trip.
    /// Removed trips still count, so their pending requests can be closed.
    pub async fn resolve_pickup_as(
        &self,
        driver_id: &str,
        pickup_id: &str,
        resolution: Resolution,
        actual_time: Option<DateTime<Utc>>,
    ) -> CoordinationResult<PickupRequest> {
        let pickup = self.get_pickup(pickup_id).await?;
        let trips = &self.trips;
        let trip_id = pickup.trip_id.as_str();
        let trip = self
            .retry
            .run("resolve_pickup.trip", move || trips.get_including_removed(trip_id))
            .await?;

        if trip.driver_id != driver_id {
            warn!("Driver {} tried to resolve pickup {} on trip {}", driver_id, pickup_id, trip.id);
            return Err(CoordinationError::Forbidden(format!(
                "pickup {} belongs to another driver's trip",
                pickup_id
            )));
        }

        self.resolve_pickup(pickup_id, resolution, actual_time).await
    }

    /// Pending and waiting requests across every trip the driver owns.
    pub async fn list_actionable_pickups(&self, driver_id: &str) -> CoordinationResult<Vec<PickupRequest>> {
        let trip_ids: Vec<String> = self
            .driver_trips(driver_id)
            .await?
            .into_iter()
            .map(|trip| trip.id)
            .collect();
        if trip_ids.is_empty() {
            return Ok(Vec::new());
        }

        let pickups = &self.pickups;
        let trip_ids = trip_ids.as_slice();
        Ok(self
            .retry
            .run("list_actionable_pickups", move || pickups.pending_for_trips(trip_ids))
            .await?)
    }

    pub async fn get_trip(&self, trip_id: &str) -> CoordinationResult<Trip> {
        let trips = &self.trips;
        Ok(self.retry.run("get_trip", move || trips.get_by_id(trip_id)).await?)
    }

    /// Scheduled trips with at least one seat left.
    pub async fn browse_trips(&self) -> CoordinationResult<Vec<Trip>> {
        let trips = &self.trips;
        Ok(self.retry.run("browse_trips", move || trips.list_bookable()).await?)
    }

    pub async fn search_trips(&self, query: &TripSearchQuery) -> CoordinationResult<Vec<Trip>> {
        let trips = &self.trips;
        Ok(self.retry.run("search_trips", move || trips.search(query)).await?)
    }

    /// The driver's trips, removed ones included.
    pub async fn driver_trips(&self, driver_id: &str) -> CoordinationResult<Vec<Trip>> {
        let trips = &self.trips;
        Ok(self
            .retry
            .run("driver_trips", move || trips.list_by_driver(driver_id))
            .await?)
    }

    pub async fn update_trip(&self, driver_id: &str, trip_id: &str, patch: TripPatch) -> CoordinationResult<Trip> {
        self.owned_trip(driver_id, trip_id).await?;
        Ok(self.trips.update(trip_id, patch).await?)
    }

    pub async fn cancel_trip(&self, driver_id: &str, trip_id: &str) -> CoordinationResult<Trip> {
        let patch = TripPatch {
            status: Some(TripStatus::Cancelled),
            ..Default::default()
        };
        let trip = self.update_trip(driver_id, trip_id, patch).await?;
        info!("Trip {} cancelled by its driver", trip_id);
        Ok(trip)
    }

    /// Logical removal; pickups referencing the trip stay readable.
    pub async fn remove_trip(&self, driver_id: &str, trip_id: &str) -> CoordinationResult<Trip> {
        self.owned_trip(driver_id, trip_id).await?;
        Ok(self.trips.remove(trip_id).await?)
    }

    pub async fn get_pickup(&self, pickup_id: &str) -> CoordinationResult<PickupRequest> {
        let pickups = &self.pickups;
        Ok(self.retry.run("get_pickup", move || pickups.get_by_id(pickup_id)).await?)
    }

    pub async fn pickups_for_trip(&self, trip_id: &str) -> CoordinationResult<Vec<PickupRequest>> {
        let pickups = &self.pickups;
        Ok(self
            .retry
            .run("pickups_for_trip", move || pickups.list_by_trip(trip_id))
            .await?)
    }

    /// Administrative hard delete.
    pub async fn remove_pickup(&self, pickup_id: &str) -> CoordinationResult<()> {
        Ok(self.pickups.remove(pickup_id).await?)
    }

    async fn owned_trip(&self, driver_id: &str, trip_id: &str) -> CoordinationResult<Trip> {
        let trip = self.get_trip(trip_id).await?;
        if trip.driver_id != driver_id {
            warn!("Driver {} tried to modify trip {} owned by {}", driver_id, trip_id, trip.driver_id);
            return Err(CoordinationError::Forbidden(format!("trip {} belongs to another driver", trip_id)));
        }
        Ok(trip)
    }
}
