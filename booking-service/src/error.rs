use chrono::{DateTime, Utc};
use shared::ErrorKind;
use thiserror::Error;
use uuid::Uuid;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("invalid booking request: {0}")]
    Validation(String),
    #[error("professional {professional_id} is not available at {start_time}")]
    SlotUnavailable {
        professional_id: Uuid,
        start_time: DateTime<Utc>,
    },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("booking {0} is already cancelled")]
    AlreadyCancelled(Uuid),
    #[error("booking {booking_id} starts at {start_time}; cancellations close {window_hours}h before the start")]
    TooLateToCancel {
        booking_id: Uuid,
        start_time: DateTime<Utc>,
        window_hours: i64,
    },
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl BookingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BookingError::Validation(_) => ErrorKind::ValidationError,
            BookingError::SlotUnavailable { .. } => ErrorKind::SlotUnavailable,
            BookingError::NotFound { .. } => ErrorKind::NotFound,
            BookingError::AlreadyCancelled(_) => ErrorKind::AlreadyCancelled,
            BookingError::TooLateToCancel { .. } => ErrorKind::TooLateToCancel,
            BookingError::Persistence(_) => ErrorKind::PersistenceError,
            BookingError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Only infrastructure failures are worth repeating unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BookingError::Persistence(_))
    }
}

impl From<StoreError> for BookingError {
    fn from(err: StoreError) -> Self {
        BookingError::Persistence(err.to_string())
    }
}
