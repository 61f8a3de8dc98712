use chrono::{DateTime, Utc};
use rideshare_core::repository::{decode, encode};
use rideshare_core::{CasOutcome, CoreError, CoreResult, KeyLocks, PersistenceError, RecordStore};
use rideshare_shared::{Collection, Location};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::{PickupPatch, PickupRequest, Resolution};

pub const DEFAULT_CAS_ATTEMPTS: u32 = 5;

fn check_location(location: &Location) -> CoreResult<()> {
    if !location.coordinates().is_valid() {
        return Err(CoreError::ValidationError(format!(
            "pickup coordinates out of range: ({}, {})",
            location.latitude, location.longitude
        )));
    }
    Ok(())
}

fn require(field: &str, value: &str) -> CoreResult<()> {
    if value.trim().is_empty() {
        return Err(CoreError::ValidationError(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Manages pickup requests and their state transitions
pub struct PickupStore {
    records: Arc<dyn RecordStore>,
    locks: KeyLocks,
    max_cas_attempts: u32,
}

impl PickupStore {
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

    /// Create a pending request. Callers check that the trip exists.
    pub async fn create(
        &self,
        trip_id: &str,
        passenger_id: &str,
        passenger_name: &str,
        location: Location,
    ) -> CoreResult<PickupRequest> {
        require("tripId", trip_id)?;
        require("passengerId", passenger_id)?;
        check_location(&location)?;

        for _ in 0..self.max_cas_attempts {
            let id = self.records.generate_key();
            let pickup = PickupRequest::new(id.clone(), trip_id, passenger_id, passenger_name, location.clone(), Utc::now());
            let value = encode(Collection::Pickups, &id, &pickup)?;

            match self.records.compare_and_put(Collection::Pickups, &id, None, value).await? {
                CasOutcome::Committed(_) => {
                    info!("Pickup {} requested on trip {} by passenger {}", pickup.id, trip_id, passenger_id);
                    return Ok(pickup);
                }
                CasOutcome::Conflict { .. } => {
                    warn!("Generated pickup key {} already taken, drawing another", id);
                }
            }
        }

        Err(PersistenceError::Contention {
            collection: Collection::Pickups,
            key: "<new>".to_string(),
            attempts: self.max_cas_attempts,
        }
        .into())
    }

    pub async fn find(&self, pickup_id: &str) -> CoreResult<Option<PickupRequest>> {
        match self.records.get(Collection::Pickups, pickup_id).await? {
            Some(record) => Ok(Some(decode(Collection::Pickups, pickup_id, record.value)?)),
            None => Ok(None),
        }
    }

    pub async fn get_by_id(&self, pickup_id: &str) -> CoreResult<PickupRequest> {
        self.find(pickup_id)
            .await?
            .ok_or_else(|| CoreError::not_found("pickup", pickup_id))
    }

    /// Every readable request, in insertion order.
    pub async fn list_all(&self) -> CoreResult<Vec<PickupRequest>> {
        let rows = self.records.list(Collection::Pickups).await?;
        let mut pickups = Vec::with_capacity(rows.len());
        for (key, record) in rows {
            match decode::<PickupRequest>(Collection::Pickups, &key, record.value) {
                Ok(pickup) => pickups.push(pickup),
                Err(e) => warn!("Skipping unreadable pickup record: {}", e),
            }
        }
        Ok(pickups)
    }

    pub async fn list_by_trip(&self, trip_id: &str) -> CoreResult<Vec<PickupRequest>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|pickup| pickup.trip_id == trip_id)
            .collect())
    }

    /// Pending and waiting requests of the given trips, grouped in the order
    /// the trips are listed.
    pub async fn pending_for_trips(&self, trip_ids: &[String]) -> CoreResult<Vec<PickupRequest>> {
        if trip_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut by_trip: HashMap<&str, Vec<PickupRequest>> =
            trip_ids.iter().map(|id| (id.as_str(), Vec::new())).collect();
        for pickup in self.list_all().await? {
            if !pickup.status.is_actionable() {
                continue;
            }
            if let Some(bucket) = by_trip.get_mut(pickup.trip_id.as_str()) {
                bucket.push(pickup);
            }
        }

        let mut pending = Vec::new();
        for id in trip_ids {
            if let Some(bucket) = by_trip.remove(id.as_str()) {
                pending.extend(bucket);
            }
        }
        Ok(pending)
    }

    /// Transition: Pending/Waiting → Accepted/Rejected. Of several
    /// concurrent resolutions exactly one commits.
    pub async fn resolve(
        &self,
        pickup_id: &str,
        resolution: Resolution,
        actual_time: Option<DateTime<Utc>>,
    ) -> CoreResult<PickupRequest> {
        let _guard = self.locks.acquire(pickup_id).await;

        for attempt in 1..=self.max_cas_attempts {
            let Some(current) = self.records.get(Collection::Pickups, pickup_id).await? else {
                return Err(CoreError::not_found("pickup", pickup_id));
            };
            let mut pickup: PickupRequest = decode(Collection::Pickups, pickup_id, current.value)?;

            if let Err(e) = pickup.resolve(resolution, actual_time, Utc::now()) {
                warn!("Pickup {} resolution rejected: {}", pickup_id, e);
                return Err(e);
            }
            let value = encode(Collection::Pickups, pickup_id, &pickup)?;

            match self
                .records
                .compare_and_put(Collection::Pickups, pickup_id, Some(current.version), value)
                .await?
            {
                CasOutcome::Committed(_) => {
                    info!("Pickup {} on trip {} {}", pickup_id, pickup.trip_id, pickup.status);
                    return Ok(pickup);
                }
                CasOutcome::Conflict { current: found } => {
                    debug!(
                        "Pickup {} moved from version {} to {:?} under us (attempt {})",
                        pickup_id, current.version, found, attempt
                    );
                }
            }
        }

        Err(PersistenceError::Contention {
            collection: Collection::Pickups,
            key: pickup_id.to_string(),
            attempts: self.max_cas_attempts,
        }
        .into())
    }

    /// Merges non-status fields into the stored request.
    pub async fn update(&self, pickup_id: &str, patch: PickupPatch) -> CoreResult<PickupRequest> {
        let mut fields = Map::new();
        if let Some(name) = &patch.passenger_name {
            fields.insert("passengerName".to_string(), Value::String(name.expose().clone()));
        }
        if let Some(location) = &patch.location {
            check_location(location)?;
            fields.insert("location".to_string(), encode(Collection::Pickups, pickup_id, location)?);
        }
        if let Some(estimated) = &patch.estimated_time {
            fields.insert("estimatedTime".to_string(), encode(Collection::Pickups, pickup_id, estimated)?);
        }
        if patch.is_empty() {
            return self.get_by_id(pickup_id).await;
        }
        fields.insert("updatedAt".to_string(), encode(Collection::Pickups, pickup_id, &Utc::now())?);

        let merged = self
            .records
            .merge(Collection::Pickups, pickup_id, Value::Object(fields))
            .await?
            .ok_or_else(|| CoreError::not_found("pickup", pickup_id))?;

        info!("Pickup {} updated", pickup_id);
        Ok(decode(Collection::Pickups, pickup_id, merged.value)?)
    }

    /// Physical deletion; administrative only.
    pub async fn remove(&self, pickup_id: &str) -> CoreResult<()> {
        let _guard = self.locks.acquire(pickup_id).await;
        if !self.records.delete(Collection::Pickups, pickup_id).await? {
            return Err(CoreError::not_found("pickup", pickup_id));
        }
        info!("Pickup {} deleted", pickup_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PickupStatus;
    use chrono::Duration;
    use rideshare_shared::Masked;
    use rideshare_store::memory::MemoryRecordStore;

    fn stop() -> Location {
        Location::new(40.4168, -3.7038, "Puerta del Sol", "Madrid")
    }

    fn store() -> (Arc<MemoryRecordStore>, PickupStore) {
        let records = Arc::new(MemoryRecordStore::new());
        let store = PickupStore::new(records.clone());
        (records, store)
    }

    #[tokio::test]
    async fn test_create_starts_pending() {
        let (_, store) = store();
        let pickup = store.create("trip-1", "p1", "Ana", stop()).await.unwrap();
        assert_eq!(pickup.status, PickupStatus::Pending);
        assert!(pickup.estimated_time.is_none());
        assert!(pickup.actual_time.is_none());
        assert_eq!(store.get_by_id(&pickup.id).await.unwrap(), pickup);

        let bad = Location::new(120.0, 0.0, "nowhere", "");
        assert!(matches!(store.create("trip-1", "p1", "Ana", bad).await, Err(CoreError::ValidationError(_))));
        assert!(matches!(store.create("", "p1", "Ana", stop()).await, Err(CoreError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_accept_then_reject_keeps_accepted() {
        let (_, store) = store();
        let pickup = store.create("trip-1", "p1", "Ana", stop()).await.unwrap();
        let at = Utc::now() + Duration::minutes(10);

        let accepted = store.resolve(&pickup.id, Resolution::Accepted, Some(at)).await.unwrap();
        assert_eq!(accepted.status, PickupStatus::Accepted);
        assert_eq!(accepted.actual_time, Some(at));

        let err = store.resolve(&pickup.id, Resolution::Rejected, None).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransitionError { .. }));
        assert_eq!(store.get_by_id(&pickup.id).await.unwrap().status, PickupStatus::Accepted);
    }

    #[tokio::test]
    async fn test_waiting_written_by_another_client() {
        let (records, store) = store();
        let mut pickup = store.create("trip-1", "p1", "Ana", stop()).await.unwrap();
        pickup.status = PickupStatus::Waiting;
        records
            .put(Collection::Pickups, &pickup.id, serde_json::to_value(&pickup).unwrap())
            .await
            .unwrap();

        let pending = store.pending_for_trips(&["trip-1".to_string()]).await.unwrap();
        assert_eq!(pending.len(), 1);

        let rejected = store.resolve(&pickup.id, Resolution::Rejected, None).await.unwrap();
        assert_eq!(rejected.status, PickupStatus::Rejected);
    }

    #[tokio::test]
    async fn test_pending_grouped_by_trip_order() {
        let (_, store) = store();
        let a1 = store.create("trip-a", "p1", "Ana", stop()).await.unwrap();
        let b1 = store.create("trip-b", "p2", "Luis", stop()).await.unwrap();
        let a2 = store.create("trip-a", "p3", "Marta", stop()).await.unwrap();
        let done = store.create("trip-b", "p4", "Pablo", stop()).await.unwrap();
        store.create("trip-c", "p5", "Sara", stop()).await.unwrap();
        store.resolve(&done.id, Resolution::Accepted, None).await.unwrap();

        let ids: Vec<String> = store
            .pending_for_trips(&["trip-b".to_string(), "trip-a".to_string()])
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![b1.id, a1.id, a2.id]);

        assert!(store.pending_for_trips(&[]).await.unwrap().is_empty());
        assert_eq!(store.list_by_trip("trip-b").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_never_touches_status() {
        let (_, store) = store();
        let pickup = store.create("trip-1", "p1", "Ana", stop()).await.unwrap();
        let eta = Utc::now() + Duration::minutes(15);

        let patch = PickupPatch {
            passenger_name: Some(Masked::from("Ana María")),
            estimated_time: Some(eta),
            ..Default::default()
        };
        let updated = store.update(&pickup.id, patch).await.unwrap();
        assert_eq!(updated.passenger_name.expose(), "Ana María");
        assert_eq!(updated.estimated_time, Some(eta));
        assert_eq!(updated.status, PickupStatus::Pending);
        assert!(updated.updated_at >= pickup.updated_at);

        let missing = store.update("nope", PickupPatch { estimated_time: Some(eta), ..Default::default() }).await;
        assert!(matches!(missing, Err(CoreError::NotFoundError(_))));
    }

    #[tokio::test]
    async fn test_failed_resolution_write_surfaces_without_retry() {
        let (records, store) = store();
        let pickup = store.create("trip-1", "p1", "Ana", stop()).await.unwrap();

        records.fail_next_writes(1);
        let err = store.resolve(&pickup.id, Resolution::Accepted, None).await.unwrap_err();
        assert!(matches!(err, CoreError::PersistenceError(_)));
        assert!(err.is_retryable());
        assert_eq!(store.get_by_id(&pickup.id).await.unwrap().status, PickupStatus::Pending);

        // The store is healthy again and nothing was half-applied.
        let accepted = store.resolve(&pickup.id, Resolution::Accepted, None).await.unwrap();
        assert_eq!(accepted.status, PickupStatus::Accepted);
    }

    #[tokio::test]
    async fn test_remove() {
        let (_, store) = store();
        let pickup = store.create("trip-1", "p1", "Ana", stop()).await.unwrap();
        store.remove(&pickup.id).await.unwrap();
        assert!(store.find(&pickup.id).await.unwrap().is_none());
        assert!(matches!(store.remove(&pickup.id).await, Err(CoreError::NotFoundError(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolutions_commit_once() {
        let records = Arc::new(MemoryRecordStore::new());
        // Separate stores share only the record store, so the version check
        // is what decides the race.
        let stores: Vec<Arc<PickupStore>> = (0..4)
            .map(|_| Arc::new(PickupStore::new(records.clone()).with_cas_attempts(16)))
            .collect();
        let pickup = stores[0].create("trip-1", "p1", "Ana", stop()).await.unwrap();

        let mut handles = Vec::new();
        for (i, store) in stores.iter().enumerate() {
            let store = store.clone();
            let id = pickup.id.clone();
            let resolution = if i % 2 == 0 { Resolution::Accepted } else { Resolution::Rejected };
            handles.push(tokio::spawn(async move { store.resolve(&id, resolution, None).await }));
        }

        let mut committed = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(pickup) => committed.push(pickup.status),
                Err(CoreError::InvalidTransitionError { .. }) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(committed.len(), 1);
        assert_eq!(stores[0].get_by_id(&pickup.id).await.unwrap().status, committed[0]);
    }
}
