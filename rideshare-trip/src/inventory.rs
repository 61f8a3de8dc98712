//! Seat inventory rules for a single trip. Everything here is pure: it
//! validates and mutates an in-memory `Trip`, and the store decides when the
//! result is committed.

use chrono::{DateTime, Utc};
use rideshare_core::{CoreError, CoreResult};
use rideshare_shared::Location;
use std::collections::BTreeMap;

use crate::models::{PassengerEntry, PassengerStatus, Trip, TripPatch, TripSpec, TripStatus};

fn check_location(field: &str, location: &Location) -> CoreResult<()> {
    if !location.coordinates().is_valid() {
        return Err(CoreError::ValidationError(format!(
            "{} coordinates out of range: ({}, {})",
            field, location.latitude, location.longitude
        )));
    }
    Ok(())
}

fn check_price(price: f64) -> CoreResult<()> {
    if !price.is_finite() || price < 0.0 {
        return Err(CoreError::ValidationError(format!("price must be a non-negative amount, got {}", price)));
    }
    Ok(())
}

fn check_schedule(departure: DateTime<Utc>, arrival: DateTime<Utc>) -> CoreResult<()> {
    if arrival < departure {
        return Err(CoreError::ValidationError(
            "estimatedArrival must not precede departureTime".to_string(),
        ));
    }
    Ok(())
}

/// Checks a publish request and returns the seats initially on offer.
pub fn validate_spec(spec: &TripSpec) -> CoreResult<u32> {
    if spec.total_seats < 1 {
        return Err(CoreError::ValidationError("totalSeats must be at least 1".to_string()));
    }
    let available = spec.available_seats.unwrap_or(spec.total_seats);
    if available > spec.total_seats {
        return Err(CoreError::ValidationError(format!(
            "availableSeats ({}) exceeds totalSeats ({})",
            available, spec.total_seats
        )));
    }
    check_price(spec.price)?;
    check_schedule(spec.departure_time, spec.estimated_arrival)?;
    check_location("origin", &spec.origin)?;
    check_location("destination", &spec.destination)?;
    Ok(available)
}

/// Builds a fresh scheduled trip from a validated spec.
pub fn new_trip(id: String, driver_id: &str, spec: TripSpec, now: DateTime<Utc>) -> CoreResult<Trip> {
    if driver_id.trim().is_empty() {
        return Err(CoreError::ValidationError("driverId must not be empty".to_string()));
    }
    let available = validate_spec(&spec)?;

    Ok(Trip {
        id,
        driver_id: driver_id.to_string(),
        status: TripStatus::Scheduled,
        origin: spec.origin,
        destination: spec.destination,
        departure_time: spec.departure_time,
        estimated_arrival: spec.estimated_arrival,
        available_seats: available,
        total_seats: spec.total_seats,
        held_seats: spec.total_seats - available,
        price: spec.price,
        preferences: spec.preferences,
        car: spec.car,
        passengers: BTreeMap::new(),
        created_at: now,
        updated_at: now,
        removed_at: None,
    })
}

/// Adds a confirmed passenger and takes their seats off the trip in one
/// step. On error the trip is left untouched.
pub fn reserve(
    trip: &mut Trip,
    passenger_id: &str,
    pickup_location: &Location,
    seats_requested: u32,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    if passenger_id.trim().is_empty() {
        return Err(CoreError::ValidationError("passengerId must not be empty".to_string()));
    }
    if seats_requested == 0 {
        return Err(CoreError::ValidationError("seatsRequested must be at least 1".to_string()));
    }
    if trip.status != TripStatus::Scheduled {
        return Err(CoreError::ValidationError(format!(
            "trip {} is {} and no longer takes reservations",
            trip.id, trip.status
        )));
    }
    check_location("pickupLocation", pickup_location)?;

    if trip.passengers.contains_key(passenger_id) {
        return Err(CoreError::AlreadyReservedError {
            trip_id: trip.id.clone(),
            passenger_id: passenger_id.to_string(),
        });
    }
    if seats_requested > trip.available_seats {
        return Err(CoreError::InsufficientCapacityError {
            requested: seats_requested,
            available: trip.available_seats,
        });
    }

    trip.passengers.insert(
        passenger_id.to_string(),
        PassengerEntry {
            status: PassengerStatus::Confirmed,
            pickup_location: pickup_location.clone(),
            seats_reserved: seats_requested,
            joined_at: now,
        },
    );
    trip.available_seats -= seats_requested;
    trip.touch(now);

    Ok(())
}

/// Merges a patch. Validation runs against the patched copy so a rejected
/// patch leaves the trip as it was.
pub fn apply_patch(trip: &mut Trip, patch: TripPatch, now: DateTime<Utc>) -> CoreResult<()> {
    if trip.status.is_terminal() {
        return Err(CoreError::InvalidTransitionError {
            from: trip.status.to_string(),
            to: patch.status.map(|s| s.to_string()).unwrap_or_else(|| "updated".to_string()),
        });
    }

    let mut next = trip.clone();
    if let Some(status) = patch.status {
        next.status = status;
    }
    if let Some(origin) = patch.origin {
        check_location("origin", &origin)?;
        next.origin = origin;
    }
    if let Some(destination) = patch.destination {
        check_location("destination", &destination)?;
        next.destination = destination;
    }
    if let Some(departure) = patch.departure_time {
        next.departure_time = departure;
    }
    if let Some(arrival) = patch.estimated_arrival {
        next.estimated_arrival = arrival;
    }
    check_schedule(next.departure_time, next.estimated_arrival)?;
    if let Some(price) = patch.price {
        check_price(price)?;
        next.price = price;
    }
    if let Some(preferences) = patch.preferences {
        next.preferences = preferences;
    }
    if let Some(car) = patch.car {
        next.car = Some(car);
    }
    if let Some(available) = patch.available_seats {
        // Booked seats are not the driver's to give back; whatever is not
        // offered or booked becomes held.
        let offerable = next.total_seats - next.seats_reserved();
        if available > offerable {
            return Err(CoreError::ValidationError(format!(
                "availableSeats ({}) exceeds the {} seats not already booked (totalSeats {})",
                available, offerable, next.total_seats
            )));
        }
        next.available_seats = available;
        next.held_seats = offerable - available;
    }

    next.touch(now);
    *trip = next;
    Ok(())
}

/// Logical removal: the record stays so pickups referencing it keep
/// resolving.
pub fn tombstone(trip: &mut Trip, now: DateTime<Utc>) {
    trip.status = TripStatus::Cancelled;
    trip.removed_at = Some(now);
    trip.touch(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crate::models::Preferences;

    fn madrid() -> Location {
        Location::new(40.4168, -3.7038, "Puerta del Sol", "Madrid")
    }

    fn spec(total: u32, available: Option<u32>) -> TripSpec {
        let departure = Utc::now() + Duration::hours(2);
        TripSpec {
            origin: madrid(),
            destination: Location::new(41.3851, 2.1734, "Plaça de Catalunya", "Barcelona"),
            departure_time: departure,
            estimated_arrival: departure + Duration::hours(6),
            total_seats: total,
            available_seats: available,
            price: 20.0,
            preferences: Preferences::default(),
            car: None,
        }
    }

    fn trip(total: u32, available: u32) -> Trip {
        new_trip("trip-1".into(), "driver-1", spec(total, Some(available)), Utc::now()).unwrap()
    }

    #[test]
    fn test_spec_validation() {
        assert!(matches!(validate_spec(&spec(0, None)), Err(CoreError::ValidationError(_))));
        assert!(matches!(validate_spec(&spec(2, Some(3))), Err(CoreError::ValidationError(_))));
        assert_eq!(validate_spec(&spec(4, None)).unwrap(), 4);
        assert_eq!(validate_spec(&spec(4, Some(0))).unwrap(), 0);

        let mut negative = spec(4, None);
        negative.price = -1.0;
        assert!(validate_spec(&negative).is_err());

        let mut backwards = spec(4, None);
        backwards.estimated_arrival = backwards.departure_time - Duration::minutes(1);
        assert!(validate_spec(&backwards).is_err());
    }

    #[test]
    fn test_held_seats_balance_the_ledger() {
        let trip = trip(4, 3);
        assert_eq!(trip.held_seats, 1);
        assert!(trip.is_balanced());
    }

    #[test]
    fn test_reserve_lifecycle() {
        let mut trip = trip(4, 3);

        reserve(&mut trip, "p1", &madrid(), 2, Utc::now()).unwrap();
        assert_eq!(trip.available_seats, 1);
        assert!(trip.is_balanced());

        let err = reserve(&mut trip, "p2", &madrid(), 2, Utc::now()).unwrap_err();
        assert!(matches!(err, CoreError::InsufficientCapacityError { requested: 2, available: 1 }));

        reserve(&mut trip, "p2", &madrid(), 1, Utc::now()).unwrap();
        assert_eq!(trip.available_seats, 0);
        assert!(trip.is_balanced());
    }

    #[test]
    fn test_duplicate_reservation_leaves_trip_unchanged() {
        let mut trip = trip(4, 4);
        reserve(&mut trip, "p1", &madrid(), 1, Utc::now()).unwrap();
        let before = trip.clone();

        let err = reserve(&mut trip, "p1", &madrid(), 1, Utc::now()).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyReservedError { .. }));
        assert_eq!(trip, before);
    }

    #[test]
    fn test_zero_seats_and_closed_trips_rejected() {
        let mut trip = trip(4, 4);
        assert!(matches!(
            reserve(&mut trip, "p1", &madrid(), 0, Utc::now()),
            Err(CoreError::ValidationError(_))
        ));

        trip.status = TripStatus::InProgress;
        assert!(matches!(
            reserve(&mut trip, "p1", &madrid(), 1, Utc::now()),
            Err(CoreError::ValidationError(_))
        ));
    }

    #[test]
    fn test_patch_available_seats_bounds() {
        let mut trip = trip(4, 4);
        reserve(&mut trip, "p1", &madrid(), 2, Utc::now()).unwrap();

        let too_many = TripPatch { available_seats: Some(3), ..Default::default() };
        assert!(matches!(apply_patch(&mut trip, too_many, Utc::now()), Err(CoreError::ValidationError(_))));
        assert_eq!(trip.available_seats, 2);

        let fewer = TripPatch { available_seats: Some(1), ..Default::default() };
        apply_patch(&mut trip, fewer, Utc::now()).unwrap();
        assert_eq!(trip.available_seats, 1);
        assert_eq!(trip.held_seats, 1);
        assert!(trip.is_balanced());
    }

    #[test]
    fn test_terminal_trips_reject_patches() {
        let mut trip = trip(4, 4);
        let cancel = TripPatch { status: Some(TripStatus::Cancelled), ..Default::default() };
        apply_patch(&mut trip, cancel, Utc::now()).unwrap();

        let reopen = TripPatch { status: Some(TripStatus::Scheduled), ..Default::default() };
        let err = apply_patch(&mut trip, reopen, Utc::now()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransitionError { .. }));
    }

    #[test]
    fn test_updated_at_never_goes_backwards() {
        let mut trip = trip(4, 4);
        let later = trip.updated_at;
        trip.touch(later - Duration::seconds(30));
        assert_eq!(trip.updated_at, later);
    }
}
