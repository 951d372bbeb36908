use common::EntityId;
use domain::DomainError;
use store::StoreError;
use thiserror::Error;

/// Errors returned to the caller of a command.
#[derive(Debug, Error)]
pub enum AppError {
    /// The command refers to an entity that does not exist (or was deleted).
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: EntityId },

    /// The command would break a uniqueness rule.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A business rule rejected the command.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// The store failed. Nothing the command wrote was persisted.
    #[error("Store error: {0}")]
    Store(StoreError),

    /// No handler is registered for the command kind.
    #[error("No handler registered for {0}")]
    NoHandler(String),

    /// A second handler was registered for the same kind.
    #[error("Handler already registered for {0}")]
    DuplicateHandler(String),

    /// Events were collected before the unit of work committed.
    #[error("Events can only be collected after a successful commit")]
    EventsNotCommitted,

    /// The unit of work ran past its statement deadline and was rolled back.
    #[error("Unit of work timed out")]
    Timeout,

    /// The handler stored under a command kind expects another command type.
    #[error("Handler registered for {0} does not accept this command type")]
    HandlerTypeMismatch(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A handler failed for a reason of its own.
    #[error("Handler error: {0}")]
    Handler(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UniqueViolation { constraint } => {
                AppError::Conflict(format!("unique constraint {constraint} violated"))
            }
            other => AppError::Store(other),
        }
    }
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, AppError>;
