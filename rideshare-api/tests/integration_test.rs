use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::StreamExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use rideshare_api::{app, build_state, middleware::Claims};
use rideshare_store::app_config::{AuthConfig, Config, ServerConfig};
use rideshare_store::MemoryRecordStore;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const SECRET: &str = "integration-secret";

fn test_app() -> Router {
    let config = Config {
        server: ServerConfig { port: 0 },
        storage: Default::default(),
        auth: AuthConfig {
            jwt_secret: SECRET.to_string(),
        },
        coordination: Default::default(),
        hub: Default::default(),
    };
    app(build_state(&config, Arc::new(MemoryRecordStore::new())))
}

fn token(user: &str, role: &str) -> String {
    let claims = Claims {
        sub: user.to_string(),
        name: Some(format!("{} (test)", user)),
        role: role.to_string(),
        exp: (Utc::now().timestamp() + 3600) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

fn request(method: Method, uri: &str, bearer: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(bearer) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", bearer));
    }
    let body = match body {
        Some(body) => Body::from(body.to_string()),
        None => Body::empty(),
    };
    builder.body(body).unwrap()
}

async fn send(app: &Router, method: Method, uri: &str, bearer: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request(method, uri, bearer, body)).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn sol() -> Value {
    json!({ "latitude": 40.4168, "longitude": -3.7038, "address": "Puerta del Sol", "city": "Madrid" })
}

fn trip_body(total: u32, available: u32) -> Value {
    let departure = Utc::now() + ChronoDuration::hours(5);
    json!({
        "origin": sol(),
        "destination": { "latitude": 37.3891, "longitude": -5.9845, "address": "Plaza Nueva", "city": "Sevilla" },
        "departureTime": departure.to_rfc3339(),
        "estimatedArrival": (departure + ChronoDuration::hours(5)).to_rfc3339(),
        "totalSeats": total,
        "availableSeats": available,
        "price": 30.0,
        "car": { "model": "Seat León", "color": "grey", "licensePlate": "1234 ABC" }
    })
}

async fn publish(app: &Router, driver: &str, total: u32, available: u32) -> String {
    let (status, trip) = send(app, Method::POST, "/v1/trips", Some(&token(driver, "driver")), Some(trip_body(total, available))).await;
    assert_eq!(status, StatusCode::CREATED);
    trip["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_is_public() {
    let app = test_app();
    let (status, body) = send(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_authentication_required() {
    let app = test_app();
    let (status, body) = send(&app, Method::GET, "/v1/trips", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let (status, _) = send(&app, Method::GET, "/v1/trips", Some("not-a-jwt"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_booking_flow() {
    let app = test_app();
    let trip_id = publish(&app, "driver-1", 4, 3).await;
    let booking = |seats: u32| Some(json!({ "pickupLocation": sol(), "seatsRequested": seats }));
    let uri = format!("/v1/trips/{}/bookings", trip_id);

    let (status, trip) = send(&app, Method::POST, &uri, Some(&token("p1", "passenger")), booking(2)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(trip["availableSeats"], 1);
    assert_eq!(trip["heldSeats"], 1);
    assert_eq!(trip["passengers"]["p1"]["status"], "confirmed");

    let (status, body) = send(&app, Method::POST, &uri, Some(&token("p2", "passenger")), booking(2)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("Only 1 seat(s) left"));

    let (status, _) = send(&app, Method::POST, &uri, Some(&token("p1", "passenger")), booking(1)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, trip) = send(&app, Method::POST, &uri, Some(&token("p2", "passenger")), booking(1)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(trip["availableSeats"], 0);

    // Full trips drop out of the browse list.
    let (status, list) = send(&app, Method::GET, "/v1/trips", Some(&token("p3", "passenger")), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_validation_and_missing_records() {
    let app = test_app();
    let driver = token("driver-1", "driver");

    let (status, _) = send(&app, Method::POST, "/v1/trips", Some(&driver), Some(trip_body(0, 0))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, Method::GET, "/v1/trips/does-not-exist", Some(&driver), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        Method::POST,
        "/v1/trips/does-not-exist/pickups",
        Some(&token("p1", "passenger")),
        Some(json!({ "location": sol() })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_only_the_driver_manages_a_trip() {
    let app = test_app();
    let trip_id = publish(&app, "driver-1", 3, 3).await;
    let uri = format!("/v1/trips/{}", trip_id);

    let patch = Some(json!({ "price": 25.0 }));
    let (status, _) = send(&app, Method::PATCH, &uri, Some(&token("driver-2", "driver")), patch.clone()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, trip) = send(&app, Method::PATCH, &uri, Some(&token("driver-1", "driver")), patch).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(trip["price"], 25.0);

    let cancel = format!("/v1/trips/{}/cancel", trip_id);
    let (status, trip) = send(&app, Method::POST, &cancel, Some(&token("driver-1", "driver")), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(trip["status"], "cancelled");

    // Terminal trips take no further updates.
    let (status, _) = send(&app, Method::PATCH, &uri, Some(&token("driver-1", "driver")), Some(json!({ "price": 1.0 }))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, Method::DELETE, &uri, Some(&token("driver-1", "driver")), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, Method::GET, &uri, Some(&token("driver-1", "driver")), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, trips) = send(&app, Method::GET, "/v1/drivers/me/trips", Some(&token("driver-1", "driver")), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(trips.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_pickup_flow() {
    let app = test_app();
    let trip_id = publish(&app, "driver-1", 4, 4).await;
    let driver = token("driver-1", "driver");

    let (status, pickup) = send(
        &app,
        Method::POST,
        &format!("/v1/trips/{}/pickups", trip_id),
        Some(&token("p1", "passenger")),
        Some(json!({ "location": sol() })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(pickup["status"], "pending");
    assert_eq!(pickup["passengerName"], "p1 (test)");
    let pickup_id = pickup["id"].as_str().unwrap().to_string();

    let (_, actionable) = send(&app, Method::GET, "/v1/drivers/me/pickups", Some(&driver), None).await;
    assert_eq!(actionable.as_array().unwrap().len(), 1);

    let resolve = format!("/v1/pickups/{}/resolve", pickup_id);
    let accepted_at = (Utc::now() + ChronoDuration::minutes(3)).to_rfc3339();
    let body = Some(json!({ "resolution": "accepted", "actualTime": accepted_at }));

    let (status, _) = send(&app, Method::POST, &resolve, Some(&token("driver-2", "driver")), body.clone()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, resolved) = send(&app, Method::POST, &resolve, Some(&driver), body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["status"], "accepted");
    assert!(resolved["actualTime"].is_string());

    let (_, actionable) = send(&app, Method::GET, "/v1/drivers/me/pickups", Some(&driver), None).await;
    assert!(actionable.as_array().unwrap().is_empty());

    let (status, _) = send(&app, Method::POST, &resolve, Some(&driver), Some(json!({ "resolution": "rejected" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, listed) = send(&app, Method::GET, &format!("/v1/trips/{}/pickups", trip_id), Some(&driver), None).await;
    assert_eq!(listed[0]["status"], "accepted");
}

#[tokio::test]
async fn test_pickup_deletion_is_admin_only() {
    let app = test_app();
    let trip_id = publish(&app, "driver-1", 2, 2).await;
    let (_, pickup) = send(
        &app,
        Method::POST,
        &format!("/v1/trips/{}/pickups", trip_id),
        Some(&token("p1", "passenger")),
        Some(json!({ "location": sol(), "passengerName": "Lucía" })),
    )
    .await;
    let uri = format!("/v1/pickups/{}", pickup["id"].as_str().unwrap());

    let (status, _) = send(&app, Method::DELETE, &uri, Some(&token("driver-1", "driver")), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin = token("ops-1", "admin");
    let (status, _) = send(&app, Method::DELETE, &uri, Some(&admin), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, Method::GET, &uri, Some(&admin), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_search_uses_default_radius() {
    let app = test_app();
    let trip_id = publish(&app, "driver-1", 3, 3).await;
    let passenger = token("p1", "passenger");

    let near = json!({
        "origin": { "latitude": 40.4170, "longitude": -3.7040 },
        "destination": { "latitude": 37.3893, "longitude": -5.9843 }
    });
    let (status, found) = send(&app, Method::POST, "/v1/trips/search", Some(&passenger), Some(near)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found[0]["id"], trip_id.as_str());

    // Roughly 1.1 km off: outside 500 m, inside 2 km.
    let off = json!({
        "origin": { "latitude": 40.4268, "longitude": -3.7038 },
        "destination": { "latitude": 37.3891, "longitude": -5.9845 }
    });
    let (_, found) = send(&app, Method::POST, "/v1/trips/search", Some(&passenger), Some(off.clone())).await;
    assert!(found.as_array().unwrap().is_empty());

    let mut wider = off;
    wider["maxDistanceKm"] = json!(2.0);
    let (_, found) = send(&app, Method::POST, "/v1/trips/search", Some(&passenger), Some(wider)).await;
    assert_eq!(found.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_pickup_stream_sends_initial_snapshot() {
    let app = test_app();
    let trip_id = publish(&app, "driver-1", 3, 3).await;

    let response = app
        .clone()
        .oneshot(request(
            Method::GET,
            &format!("/v1/trips/{}/pickups/stream", trip_id),
            Some(&token("driver-1", "driver")),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let mut frames = response.into_body().into_data_stream();
    let first = tokio::time::timeout(Duration::from_secs(2), frames.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = String::from_utf8(first.to_vec()).unwrap();
    assert!(text.contains("event: snapshot"));
    assert!(text.contains("data: []"));
}
