pub mod inventory;
pub mod models;
pub mod store;

pub use models::{
    Car, ConversationLevel, PassengerEntry, PassengerStatus, Preferences, Trip, TripPatch, TripSpec,
    TripStatus,
};
pub use store::TripStore;
