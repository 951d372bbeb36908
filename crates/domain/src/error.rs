//! Business-rule errors.

use common::EntityId;
use thiserror::Error;

/// Errors raised when a business rule rejects a state change.
///
/// These never become events and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// A required text field was blank.
    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },

    #[error("invalid email address: {0}")]
    InvalidEmail(String),

    #[error("invalid price: {0} (must not be negative)")]
    NegativePrice(i64),

    /// The entity is soft-deleted and cannot change any more.
    #[error("{entity} {id} is deleted")]
    Deleted { entity: &'static str, id: EntityId },
}
