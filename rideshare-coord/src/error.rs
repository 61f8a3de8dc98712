use rideshare_core::{CoreError, PersistenceError};

/// What callers of the coordination service can observe.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Only {available} seat(s) left, {requested} requested")]
    InsufficientCapacity { requested: u32, available: u32 },

    #[error("Passenger {passenger_id} has already booked trip {trip_id}")]
    AlreadyBooked { trip_id: String, passenger_id: String },

    #[error("Cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Forbidden(String),

    #[error(transparent)]
    Persistence(PersistenceError),
}

impl CoordinationError {
    /// True when repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordinationError::Persistence(e) if e.is_retryable())
    }
}

impl From<CoreError> for CoordinationError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ValidationError(msg) => CoordinationError::Validation(msg),
            CoreError::NotFoundError(msg) => CoordinationError::NotFound(msg),
            CoreError::InsufficientCapacityError { requested, available } => {
                CoordinationError::InsufficientCapacity { requested, available }
            }
            CoreError::AlreadyReservedError { trip_id, passenger_id } => {
                CoordinationError::AlreadyBooked { trip_id, passenger_id }
            }
            CoreError::InvalidTransitionError { from, to } => CoordinationError::InvalidTransition { from, to },
            CoreError::PersistenceError(e) => CoordinationError::Persistence(e),
        }
    }
}

pub type CoordinationResult<T> = Result<T, CoordinationError>;
