//! Outbox relay and search projection.
//!
//! [`OutboxProcessor`] claims committed outbox records and publishes them to a
//! [`Broker`] with bounded, backed-off retries. [`OutboxConsumer`] subscribes
//! to the product topic and keeps a [`SearchIndex`] in step with the store.

pub mod broker;
pub mod consumer;
pub mod error;
pub mod message;
pub mod nats;
pub mod processor;
pub mod search;

pub use broker::{Broker, BrokerMessage, InMemoryBroker, Subscription};
pub use consumer::{ConsumeOutcome, ConsumerRetry, OutboxConsumer, PRODUCTS_INDEX, ProductDocument};
pub use error::{BrokerError, OutboxError, Result, SearchError};
pub use message::OutboxMessage;
pub use nats::NatsBroker;
pub use processor::{BatchReport, OutboxProcessor, ProcessorConfig};
pub use search::{HttpSearchIndex, InMemorySearchIndex, SearchIndex};
