use chrono::Utc;
use rideshare_core::repository::{decode, encode};
use rideshare_core::{
    CasOutcome, CoreError, CoreResult, KeyLocks, PersistenceError, RecordStore, TripSearchQuery,
};
use rideshare_shared::{Collection, Location};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::inventory;
use crate::models::{Trip, TripPatch, TripSpec};

pub const DEFAULT_CAS_ATTEMPTS: u32 = 5;

/// Trip records and their seat ledger.
///
/// Every mutation runs under the trip's key lock and commits with a version
/// compare-and-swap, so writers in other processes sharing the same record
/// store are serialised too.
pub struct TripStore {
    records: Arc<dyn RecordStore>,
    locks: KeyLocks,
    max_cas_attempts: u32,
}

impl TripStore {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self {
            records,
            locks: KeyLocks::new(),
            max_cas_attempts: DEFAULT_CAS_ATTEMPTS,
        }
    }

    pub fn with_cas_attempts(mut self, attempts: u32) -> Self {
        self.max_cas_attempts = attempts.max(1);
        self
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub async fn create(&self, driver_id: &str, spec: TripSpec) -> CoreResult<Trip> {
        // Validate before burning a key.
        inventory::validate_spec(&spec)?;

        for _ in 0..self.max_cas_attempts {
            let id = self.records.generate_key();
            let trip = inventory::new_trip(id.clone(), driver_id, spec.clone(), Utc::now())?;
            let value = encode(Collection::Trips, &id, &trip)?;

            match self.records.compare_and_put(Collection::Trips, &id, None, value).await? {
                CasOutcome::Committed(_) => {
                    info!(
                        "Trip {} published by driver {} ({}/{} seats on offer)",
                        trip.id, trip.driver_id, trip.available_seats, trip.total_seats
                    );
                    return Ok(trip);
                }
                CasOutcome::Conflict { .. } => {
                    warn!("Generated trip key {} already taken, drawing another", id);
                }
            }
        }

        Err(PersistenceError::Contention {
            collection: Collection::Trips,
            key: "<new>".to_string(),
            attempts: self.max_cas_attempts,
        }
        .into())
    }

    /// Visible trip, or `None` when absent or removed.
    pub async fn find(&self, trip_id: &str) -> CoreResult<Option<Trip>> {
        Ok(self.load(trip_id).await?.filter(|trip| !trip.is_removed()))
    }

    pub async fn get_by_id(&self, trip_id: &str) -> CoreResult<Trip> {
        self.find(trip_id)
            .await?
            .ok_or_else(|| CoreError::not_found("trip", trip_id))
    }

    /// Like `get_by_id` but also returns tombstoned trips.
    pub async fn get_including_removed(&self, trip_id: &str) -> CoreResult<Trip> {
        self.load(trip_id)
            .await?
            .ok_or_else(|| CoreError::not_found("trip", trip_id))
    }

    pub async fn list_all(&self) -> CoreResult<Vec<Trip>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|trip| !trip.is_removed())
            .collect())
    }

    /// All of a driver's trips, tombstoned ones included.
    pub async fn list_by_driver(&self, driver_id: &str) -> CoreResult<Vec<Trip>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|trip| trip.driver_id == driver_id)
            .collect())
    }

    pub async fn list_bookable(&self) -> CoreResult<Vec<Trip>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(Trip::is_bookable)
            .collect())
    }

    pub async fn search(&self, query: &TripSearchQuery) -> CoreResult<Vec<Trip>> {
        if !query.is_valid() {
            return Err(CoreError::ValidationError(format!(
                "invalid search: maxDistanceKm {} with origin ({}, {}) and destination ({}, {})",
                query.max_distance_km,
                query.origin.latitude,
                query.origin.longitude,
                query.destination.latitude,
                query.destination.longitude
            )));
        }

        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|trip| query.matches(&trip.origin.coordinates(), &trip.destination.coordinates()))
            .collect())
    }

    pub async fn reserve_seats(
        &self,
        trip_id: &str,
        passenger_id: &str,
        pickup_location: &Location,
        seats_requested: u32,
    ) -> CoreResult<Trip> {
        let trip = self
            .mutate(trip_id, |trip| {
                inventory::reserve(trip, passenger_id, pickup_location, seats_requested, Utc::now())
            })
            .await?;

        info!(
            "Reserved {} seat(s) on trip {} for passenger {} ({} left)",
            seats_requested, trip_id, passenger_id, trip.available_seats
        );
        Ok(trip)
    }

    pub async fn update(&self, trip_id: &str, patch: TripPatch) -> CoreResult<Trip> {
        let trip = self
            .mutate(trip_id, |trip| inventory::apply_patch(trip, patch.clone(), Utc::now()))
            .await?;
        info!("Trip {} updated (status {})", trip_id, trip.status);
        Ok(trip)
    }

    /// Logical removal. The record is kept as a tombstone.
    pub async fn remove(&self, trip_id: &str) -> CoreResult<Trip> {
        let trip = self
            .mutate(trip_id, |trip| {
                inventory::tombstone(trip, Utc::now());
                Ok(())
            })
            .await?;
        info!("Trip {} removed", trip_id);
        Ok(trip)
    }

    async fn load(&self, trip_id: &str) -> CoreResult<Option<Trip>> {
        match self.records.get(Collection::Trips, trip_id).await? {
            Some(record) => Ok(Some(decode(Collection::Trips, trip_id, record.value)?)),
            None => Ok(None),
        }
    }

    async fn load_all(&self) -> CoreResult<Vec<Trip>> {
        let rows = self.records.list(Collection::Trips).await?;
        let mut trips = Vec::with_capacity(rows.len());
        for (key, record) in rows {
            match decode::<Trip>(Collection::Trips, &key, record.value) {
                Ok(trip) => trips.push(trip),
                Err(e) => warn!("Skipping unreadable trip record: {}", e),
            }
        }
        Ok(trips)
    }

    /// Read, apply, compare-and-swap. A conflict means another writer
    /// committed first, so the change is re-validated against fresh state.
    async fn mutate<F>(&self, trip_id: &str, mut apply: F) -> CoreResult<Trip>
    where
        F: FnMut(&mut Trip) -> CoreResult<()>,
    {
        let _guard = self.locks.acquire(trip_id).await;

        for attempt in 1..=self.max_cas_attempts {
            let Some(current) = self.records.get(Collection::Trips, trip_id).await? else {
                return Err(CoreError::not_found("trip", trip_id));
            };
            let mut trip: Trip = decode(Collection::Trips, trip_id, current.value)?;
            if trip.is_removed() {
                return Err(CoreError::not_found("trip", trip_id));
            }

            if let Err(e) = apply(&mut trip) {
                warn!("Trip {} change rejected: {}", trip_id, e);
                return Err(e);
            }
            let value = encode(Collection::Trips, trip_id, &trip)?;

            match self
                .records
                .compare_and_put(Collection::Trips, trip_id, Some(current.version), value)
                .await?
            {
                CasOutcome::Committed(_) => return Ok(trip),
                CasOutcome::Conflict { current: found } => {
                    debug!(
                        "Trip {} moved from version {} to {:?} under us (attempt {})",
                        trip_id, current.version, found, attempt
                    );
                }
            }
        }

        Err(PersistenceError::Contention {
            collection: Collection::Trips,
            key: trip_id.to_string(),
            attempts: self.max_cas_attempts,
        }
        .into())
    }
}
