use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The requested stay overlaps an occupying booking.
    Conflict(Ulid),
    InvalidInterval {
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    TooManyGuests {
        requested: u32,
        max: u32,
    },
    HasActiveBookings(Ulid),
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    /// The booking store failed; its message is passed through untouched.
    RetrievalFailed(String),
    WalError(String),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => {
                write!(f, "these dates are unavailable (overlaps booking {id})")
            }
            EngineError::InvalidInterval { check_in, check_out } => write!(
                f,
                "invalid stay: check_in {check_in} must be before check_out {check_out}"
            ),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "booking {id} cannot move from {from} to {to}")
            }
            EngineError::TooManyGuests { requested, max } => {
                write!(f, "{requested} guests requested, property sleeps {max}")
            }
            EngineError::HasActiveBookings(id) => {
                write!(f, "cannot delist property {id}: has active bookings")
            }
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::RetrievalFailed(e) => write!(f, "booking retrieval failed: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
