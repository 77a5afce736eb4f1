use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input; surfaced verbatim to the caller.
    Validation(&'static str),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    PastClass(Ulid),
    ClassCancelled(Ulid),
    DuplicateBooking { class_id: Ulid, user_id: Ulid },
    InsufficientCredits(Ulid),
    PackageExpired(Ulid),
    PackageInactive(Ulid),
    CancellationWindowClosed { deadline: Ms },
    LimitExceeded(&'static str),
    /// Journal/storage fault. Retryable; nothing was committed.
    Unavailable(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation: {msg}"),
            EngineError::NotFound(id) => write!(f, "no record for id {id}"),
            EngineError::AlreadyExists(id) => write!(f, "id {id} is already registered"),
            EngineError::PastClass(id) => write!(f, "class {id} already started"),
            EngineError::ClassCancelled(id) => write!(f, "class {id} is cancelled"),
            EngineError::DuplicateBooking { class_id, user_id } => {
                write!(f, "user {user_id} already has an active booking on class {class_id}")
            }
            EngineError::InsufficientCredits(id) => {
                write!(f, "package {id} has insufficient credits")
            }
            EngineError::PackageExpired(id) => write!(f, "package {id} is expired"),
            EngineError::PackageInactive(id) => write!(f, "package {id} is inactive"),
            EngineError::CancellationWindowClosed { deadline } => {
                write!(f, "cancellation window closed at {deadline}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Unavailable(e) => write!(f, "storage unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
