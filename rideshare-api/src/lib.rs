use axum::{
    http::Method,
    routing::{get, post},
    Json, Router,
};
use rideshare_coord::{CoordinationService, SubscriptionHub};
use rideshare_core::RecordStore;
use rideshare_pickup::PickupStore;
use rideshare_store::app_config::Config;
use rideshare_trip::TripStore;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod error;
pub mod middleware;
pub mod pickups;
pub mod state;
pub mod stream;
pub mod trips;

pub use state::{AppState, AuthConfig};

/// Wires stores, hub and service over one record store. Needs a running
/// tokio runtime (the hub spawns its dispatcher).
pub fn build_state(config: &Config, records: Arc<dyn RecordStore>) -> AppState {
    let coordination = &config.coordination;
    let trips = Arc::new(TripStore::new(records.clone()).with_cas_attempts(coordination.max_cas_attempts));
    let pickups = Arc::new(PickupStore::new(records).with_cas_attempts(coordination.max_cas_attempts));
    let retry = coordination.retry_policy();

    AppState {
        hub: SubscriptionHub::new(trips.clone(), pickups.clone(), retry.clone()),
        service: CoordinationService::new(trips, pickups, retry),
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
        },
        default_search_radius_km: coordination.default_search_radius_km,
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub fn app(state: AppState) -> Router {
    // CORS Middleware
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::USER_AGENT,
        ]);

    let authenticated = Router::new()
        .route("/v1/trips", post(trips::publish_trip).get(trips::browse_trips))
        .route("/v1/trips/search", post(trips::search_trips))
        .route("/v1/trips/stream", get(stream::watch_bookable_trips))
        .route(
            "/v1/trips/{id}",
            get(trips::get_trip).patch(trips::update_trip).delete(trips::remove_trip),
        )
        .route("/v1/trips/{id}/cancel", post(trips::cancel_trip))
        .route("/v1/trips/{id}/bookings", post(trips::book_seat))
        .route(
            "/v1/trips/{id}/pickups",
            post(pickups::request_pickup).get(pickups::pickups_for_trip),
        )
        .route("/v1/trips/{id}/stream", get(stream::watch_trip))
        .route("/v1/trips/{id}/pickups/stream", get(stream::watch_trip_pickups))
        .route("/v1/drivers/me/trips", get(trips::driver_trips))
        .route("/v1/drivers/me/pickups", get(pickups::actionable_pickups))
        .route("/v1/pickups/{id}", get(pickups::get_pickup).delete(pickups::remove_pickup))
        .route("/v1/pickups/{id}/resolve", post(pickups::resolve_pickup))
        .route("/v1/pickups/{id}/stream", get(stream::watch_pickup))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(authenticated)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
