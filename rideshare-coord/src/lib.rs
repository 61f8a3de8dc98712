pub mod error;
pub mod hub;
pub mod service;

pub use error::CoordinationError;
pub use hub::{Subscription, SubscriptionHub, TripFilter};
pub use service::CoordinationService;
