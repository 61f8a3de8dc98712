pub mod models;
pub mod pii;

pub use models::events::{ChangeKind, Collection, RecordChange};
pub use models::location::{Coordinates, Location};
pub use pii::Masked;
