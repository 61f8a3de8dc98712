pub mod events;
pub mod location;
