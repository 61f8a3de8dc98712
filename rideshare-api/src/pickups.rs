use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use rideshare_pickup::{PickupRequest, Resolution};
use rideshare_shared::Location;
use serde::Deserialize;

use crate::error::AppError;
use crate::middleware::Identity;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPickupRequest {
    pub location: Location,
    /// Falls back to the name on the caller's token.
    pub passenger_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvePickupRequest {
    pub resolution: Resolution,
    pub actual_time: Option<DateTime<Utc>>,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /v1/trips/{id}/pickups
/// Ask the driver to collect the caller at a location
pub async fn request_pickup(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(trip_id): Path<String>,
    Json(req): Json<RequestPickupRequest>,
) -> Result<(StatusCode, Json<PickupRequest>), AppError> {
    let name = req
        .passenger_name
        .or_else(|| identity.name.clone())
        .unwrap_or_default();
    let pickup = state
        .service
        .request_pickup(&trip_id, &identity.user_id, &name, req.location)
        .await?;
    Ok((StatusCode::CREATED, Json(pickup)))
}

/// GET /v1/trips/{id}/pickups
pub async fn pickups_for_trip(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
) -> Result<Json<Vec<PickupRequest>>, AppError> {
    Ok(Json(state.service.pickups_for_trip(&trip_id).await?))
}

/// GET /v1/drivers/me/pickups
/// Requests still waiting on the calling driver
pub async fn actionable_pickups(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<PickupRequest>>, AppError> {
    Ok(Json(state.service.list_actionable_pickups(&identity.user_id).await?))
}

/// GET /v1/pickups/{id}
pub async fn get_pickup(
    State(state): State<AppState>,
    Path(pickup_id): Path<String>,
) -> Result<Json<PickupRequest>, AppError> {
    Ok(Json(state.service.get_pickup(&pickup_id).await?))
}

/// POST /v1/pickups/{id}/resolve
/// Accept or reject; only the trip's driver may
pub async fn resolve_pickup(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(pickup_id): Path<String>,
    Json(req): Json<ResolvePickupRequest>,
) -> Result<Json<PickupRequest>, AppError> {
    let pickup = state
        .service
        .resolve_pickup_as(&identity.user_id, &pickup_id, req.resolution, req.actual_time)
        .await?;
    Ok(Json(pickup))
}

/// DELETE /v1/pickups/{id}
/// Administrative hard delete
pub async fn remove_pickup(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(pickup_id): Path<String>,
) -> Result<StatusCode, AppError> {
    if !identity.is_admin() {
        return Err(AppError::AuthorizationError("Administrator role required".to_string()));
    }
    state.service.remove_pickup(&pickup_id).await?;
    tracing::info!("Pickup {} deleted by administrator {}", pickup_id, identity.user_id);
    Ok(StatusCode::NO_CONTENT)
}
