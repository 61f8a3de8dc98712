pub mod manager;
pub mod models;

pub use manager::PickupStore;
pub use models::{PickupPatch, PickupRequest, PickupStatus, Resolution};
