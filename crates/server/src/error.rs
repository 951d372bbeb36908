//! Startup and wiring errors for the relay service.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// An environment variable held a value that does not parse.
    #[error("Invalid configuration: {key}={value:?}")]
    Config { key: &'static str, value: String },

    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("Bus error: {0}")]
    Bus(#[from] bus::AppError),

    #[error("Outbox error: {0}")]
    Outbox(#[from] outbox::OutboxError),

    #[error("Broker error: {0}")]
    Broker(#[from] outbox::BrokerError),

    #[error("Search error: {0}")]
    Search(#[from] outbox::SearchError),

    #[error("Metrics recorder error: {0}")]
    Metrics(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
