use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// A unique field (space title, user email) is already taken.
    Duplicate {
        field: &'static str,
        value: String,
    },
    Validation(String),
    /// The requested window overlaps an existing reservation. Carries no detail
    /// about the other reservation.
    Conflict,
    CancellationWindowExpired {
        deadline: Ms,
    },
    HasReservations(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Storage faults are the only errors worth retrying; everything else is
    /// the caller's request being rejected.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Duplicate { field, value } => {
                write!(f, "{field} already in use: {value}")
            }
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Conflict => write!(f, "date already reserved"),
            EngineError::CancellationWindowExpired { deadline } => {
                write!(f, "cancellation window closed at {deadline}")
            }
            EngineError::HasReservations(id) => {
                write!(f, "cannot delete {id}: it still holds reservations")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
