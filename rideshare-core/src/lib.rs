pub mod geo;
pub mod lock;
pub mod repository;
pub mod retry;
pub mod search;

pub use lock::KeyLocks;
pub use repository::{CasOutcome, PersistenceError, RecordStore, Versioned};
pub use retry::RetryPolicy;
pub use search::TripSearchQuery;

/// Failure taxonomy shared by the trip and pickup stores.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFoundError(String),

    #[error("Insufficient capacity: requested {requested}, available {available}")]
    InsufficientCapacityError { requested: u32, available: u32 },

    #[error("Passenger {passenger_id} already holds a reservation on trip {trip_id}")]
    AlreadyReservedError { trip_id: String, passenger_id: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransitionError { from: String, to: String },

    #[error(transparent)]
    PersistenceError(#[from] PersistenceError),
}

impl CoreError {
    pub fn not_found(what: &str, id: &str) -> Self {
        CoreError::NotFoundError(format!("{} {}", what, id))
    }

    /// Only collaborator failures are worth retrying; every other kind is a
    /// definite answer about the caller's request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::PersistenceError(e) if e.is_retryable())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
