//! Projects published product records into the search index.

use std::sync::Arc;
use std::time::Duration;

use common::EntityId;
use domain::{Entity, Product};
use serde::{Deserialize, Serialize};
use store::{Database, Session};
use tokio::sync::watch;

use crate::Result;
use crate::broker::{BrokerMessage, Subscription};
use crate::error::OutboxError;
use crate::message::OutboxMessage;
use crate::search::SearchIndex;

pub const PRODUCTS_INDEX: &str = "products";

/// Search document for one live product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDocument {
    pub id: EntityId,
    pub name: String,
    pub description: String,
    pub price_cents: i64,
    pub category_id: EntityId,
    pub category_name: Option<String>,
}

/// What the consumer did with one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Indexed(EntityId),
    Deleted(EntityId),
    Skipped,
}

/// How [`OutboxConsumer::run`] retries a message whose projection failed.
#[derive(Debug, Clone)]
pub struct ConsumerRetry {
    /// Tries per message, the first included.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ConsumerRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl ConsumerRetry {
    /// Wait after failed attempt `attempt` (1-based): doubles from
    /// `base_backoff`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exponent)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

/// Keeps the `products` index in step with the product table.
///
/// Documents are always built from a fresh read of the store, so replays and
/// out-of-order deliveries converge on the current row.
pub struct OutboxConsumer<D: Database> {
    db: D,
    index: Arc<dyn SearchIndex>,
    index_name: String,
    retry: ConsumerRetry,
}

impl<D: Database> OutboxConsumer<D> {
    pub fn new(db: D, index: Arc<dyn SearchIndex>) -> Self {
        Self {
            db,
            index,
            index_name: PRODUCTS_INDEX.to_string(),
            retry: ConsumerRetry::default(),
        }
    }

    pub fn with_retry(mut self, retry: ConsumerRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_index_name(mut self, index_name: impl Into<String>) -> Self {
        self.index_name = index_name.into();
        self
    }

    /// Parses a raw broker message and handles it.
    pub async fn handle_message(&self, message: &BrokerMessage) -> Result<ConsumeOutcome> {
        let envelope = OutboxMessage::from_bytes(&message.payload)?;
        self.handle(&envelope).await
    }

    #[tracing::instrument(skip(self, message), fields(outbox_id = %message.id, event_type = %message.event_type))]
    pub async fn handle(&self, message: &OutboxMessage) -> Result<ConsumeOutcome> {
        let outcome = match message.event_type.as_str() {
            "product.created" | "product.updated" => {
                let id = product_id(message)?;
                self.sync_product(id).await?
            }
            "product.deleted" => {
                let id = product_id(message)?;
                self.index
                    .delete_document(&self.index_name, &id.to_string())
                    .await?;
                ConsumeOutcome::Deleted(id)
            }
            other => {
                tracing::debug!(event_type = other, "skipping unhandled outbox message");
                ConsumeOutcome::Skipped
            }
        };

        if let ConsumeOutcome::Indexed(_) = outcome {
            metrics::counter!("consumer_documents_indexed_total").increment(1);
        }
        Ok(outcome)
    }

    /// Handles `message`, retrying transient failures with backoff.
    ///
    /// Store, broker and search errors are retried up to
    /// `max_attempts` times. Anything else fails at once. The last error is
    /// returned when every attempt failed.
    pub async fn consume(&self, message: &BrokerMessage) -> Result<ConsumeOutcome> {
        let mut attempt = 1;
        loop {
            match self.handle_message(message).await {
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    metrics::counter!("consumer_retries_total").increment(1);
                    tracing::warn!(
                        topic = %message.topic,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "outbox message projection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Consumes `subscription` until it closes or `shutdown` turns true.
    ///
    /// A message still failing after its retries is logged, counted in
    /// `consumer_failures_total` and dropped. The next publish of the same
    /// product repairs its document.
    pub async fn run(self, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(index = %self.index_name, "outbox consumer started");
        loop {
            tokio::select! {
                message = subscription.next() => {
                    let Some(message) = message else { break };
                    if let Err(e) = self.consume(&message).await {
                        metrics::counter!("consumer_failures_total").increment(1);
                        tracing::error!(
                            topic = %message.topic,
                            error = %e,
                            "failed to consume outbox message"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("outbox consumer stopped");
    }

    async fn sync_product(&self, id: EntityId) -> Result<ConsumeOutcome> {
        let session = Session::detached();
        let product = self.db.products(session.clone()).get(id).await?;

        match product {
            Some(product) if !product.is_deleted() => {
                let category_name = self
                    .db
                    .categories(session)
                    .get(product.category_id())
                    .await?
                    .map(|category| category.name().to_string());
                let document = serde_json::to_value(document_for(&product, category_name))?;
                self.index
                    .index_document(&self.index_name, &id.to_string(), document)
                    .await?;
                Ok(ConsumeOutcome::Indexed(id))
            }
            _ => {
                self.index
                    .delete_document(&self.index_name, &id.to_string())
                    .await?;
                Ok(ConsumeOutcome::Deleted(id))
            }
        }
    }
}

fn document_for(product: &Product, category_name: Option<String>) -> ProductDocument {
    ProductDocument {
        id: product.id(),
        name: product.name().to_string(),
        description: product.description().to_string(),
        price_cents: product.price_cents(),
        category_id: product.category_id(),
        category_name,
    }
}

fn product_id(message: &OutboxMessage) -> Result<EntityId> {
    message
        .aggregate_id
        .parse()
        .map_err(|_| OutboxError::InvalidMessage(format!("bad product id {:?}", message.aggregate_id)))
}
