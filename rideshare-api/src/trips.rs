use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use rideshare_core::TripSearchQuery;
use rideshare_shared::{Coordinates, Location};
use rideshare_trip::{Trip, TripPatch, TripSpec};
use serde::Deserialize;

use crate::error::AppError;
use crate::middleware::Identity;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchTripsRequest {
    pub origin: Coordinates,
    pub destination: Coordinates,
    pub max_distance_km: Option<f64>,
}

fn one_seat() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSeatRequest {
    pub pickup_location: Location,
    #[serde(default = "one_seat")]
    pub seats_requested: u32,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /v1/trips
/// Publish a trip; the caller is the driver
pub async fn publish_trip(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(spec): Json<TripSpec>,
) -> Result<(StatusCode, Json<Trip>), AppError> {
    let trip = state.service.publish_trip(&identity.user_id, spec).await?;
    Ok((StatusCode::CREATED, Json(trip)))
}

/// GET /v1/trips
/// Trips open for booking
pub async fn browse_trips(State(state): State<AppState>) -> Result<Json<Vec<Trip>>, AppError> {
    Ok(Json(state.service.browse_trips().await?))
}

/// POST /v1/trips/search
pub async fn search_trips(
    State(state): State<AppState>,
    Json(req): Json<SearchTripsRequest>,
) -> Result<Json<Vec<Trip>>, AppError> {
    let radius = req.max_distance_km.unwrap_or(state.default_search_radius_km);
    let query = TripSearchQuery::new(req.origin, req.destination, radius);
    Ok(Json(state.service.search_trips(&query).await?))
}

/// GET /v1/trips/{id}
pub async fn get_trip(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
) -> Result<Json<Trip>, AppError> {
    Ok(Json(state.service.get_trip(&trip_id).await?))
}

/// PATCH /v1/trips/{id}
/// Driver-only partial update
pub async fn update_trip(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(trip_id): Path<String>,
    Json(patch): Json<TripPatch>,
) -> Result<Json<Trip>, AppError> {
    Ok(Json(state.service.update_trip(&identity.user_id, &trip_id, patch).await?))
}

/// POST /v1/trips/{id}/cancel
pub async fn cancel_trip(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(trip_id): Path<String>,
) -> Result<Json<Trip>, AppError> {
    Ok(Json(state.service.cancel_trip(&identity.user_id, &trip_id).await?))
}

/// DELETE /v1/trips/{id}
/// Logical removal; pickups on the trip remain readable
pub async fn remove_trip(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(trip_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.service.remove_trip(&identity.user_id, &trip_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/trips/{id}/bookings
/// Reserve seats; the caller is the passenger
pub async fn book_seat(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(trip_id): Path<String>,
    Json(req): Json<BookSeatRequest>,
) -> Result<Json<Trip>, AppError> {
    let trip = state
        .service
        .book_seat(&trip_id, &identity.user_id, &req.pickup_location, req.seats_requested)
        .await?;
    Ok(Json(trip))
}

/// GET /v1/drivers/me/trips
pub async fn driver_trips(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<Trip>>, AppError> {
    Ok(Json(state.service.driver_trips(&identity.user_id).await?))
}
