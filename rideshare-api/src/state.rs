use rideshare_coord::{CoordinationService, SubscriptionHub};

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
}

#[derive(Clone)]
pub struct AppState {
    pub service: CoordinationService,
    pub hub: SubscriptionHub,
    pub auth: AuthConfig,
    /// Radius applied to searches that do not name one.
    pub default_search_radius_km: f64,
}
