//! Server-Sent Events over hub subscriptions. Each event carries one full
//! snapshot as JSON; dropping the connection drops the subscription.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::{Stream, StreamExt};
use rideshare_coord::{Subscription, TripFilter};
use rideshare_trip::Trip;
use serde::Serialize;
use std::sync::Arc;

use crate::error::AppError;
use crate::state::AppState;

fn into_sse<T>(subscription: Subscription<T>) -> Sse<impl Stream<Item = Result<Event, axum::Error>>>
where
    T: Serialize + Send + 'static,
{
    let events = subscription.map(|snapshot| Event::default().event("snapshot").json_data(&snapshot));
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// GET /v1/trips/stream
/// Live list of bookable trips
pub async fn watch_bookable_trips(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let bookable: TripFilter = Arc::new(Trip::is_bookable);
    let subscription = state.hub.watch_trips(Some(bookable)).await?;
    Ok(into_sse(subscription))
}

/// GET /v1/trips/{id}/stream
pub async fn watch_trip(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let subscription = state.hub.watch_trip(&trip_id).await?;
    Ok(into_sse(subscription))
}

/// GET /v1/trips/{id}/pickups/stream
pub async fn watch_trip_pickups(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let subscription = state.hub.watch_pickups_for_trip(&trip_id).await?;
    Ok(into_sse(subscription))
}

/// GET /v1/pickups/{id}/stream
pub async fn watch_pickup(
    State(state): State<AppState>,
    Path(pickup_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let subscription = state.hub.watch_pickup(&pickup_id).await?;
    Ok(into_sse(subscription))
}
