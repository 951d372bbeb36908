//! Outbox relay error types.

use thiserror::Error;

/// Errors from a message broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),
}

/// Errors from the search store.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The search store answered with a non-success status.
    #[error("Search store returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Errors that can occur while relaying or consuming outbox records.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A message that parsed but cannot be acted on.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl OutboxError {
    /// Whether trying again may succeed. Bad messages and configuration
    /// never will.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OutboxError::Store(_) | OutboxError::Broker(_) | OutboxError::Search(_)
        )
    }
}

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;
