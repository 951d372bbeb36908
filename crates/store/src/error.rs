use thiserror::Error;

/// Errors that can occur when talking to a database backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A write collided with a unique constraint.
    #[error("Unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    /// The transaction could not be committed. Nothing it wrote is persisted.
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// A stored row could not be mapped back into a value.
    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

impl StoreError {
    /// Returns true if this error is a unique constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
