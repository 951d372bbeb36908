//! Relays committed outbox records to the broker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use store::{ClaimToken, OutboxRecord, OutboxStatus, OutboxStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::Result;
use crate::broker::Broker;
use crate::error::OutboxError;
use crate::message::OutboxMessage;

/// Tuning for [`OutboxProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Independent polling loops started by [`OutboxProcessor::spawn`].
    pub workers: usize,
    pub batch_size: usize,
    /// Sleep between polls when a batch came back empty.
    pub poll_interval: Duration,
    pub publish_timeout: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// How long a record may sit in `processing` before it is handed back.
    /// Must exceed the longest a batch can take, `batch_size * publish_timeout`.
    pub stale_lease: Duration,
    /// Completed records older than this are deleted by the first worker.
    pub completed_retention: Duration,
    pub topic_prefix: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            batch_size: 50,
            poll_interval: Duration::from_millis(500),
            publish_timeout: Duration::from_secs(5),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            stale_lease: Duration::from_secs(300),
            completed_retention: Duration::from_secs(24 * 60 * 60),
            topic_prefix: "shop".to_string(),
        }
    }
}

impl ProcessorConfig {
    /// Rejects settings under which a live worker's claims could be
    /// recovered as stale while it is still publishing them.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(OutboxError::Config("batch_size must be at least 1".to_string()));
        }
        let longest_batch = u32::try_from(self.batch_size)
            .ok()
            .and_then(|n| self.publish_timeout.checked_mul(n))
            .unwrap_or(Duration::MAX);
        if self.stale_lease <= longest_batch {
            return Err(OutboxError::Config(format!(
                "stale_lease {:?} must exceed batch_size * publish_timeout ({longest_batch:?})",
                self.stale_lease
            )));
        }
        Ok(())
    }

    /// Topic a record of `aggregate_type` is published to.
    pub fn topic_for(&self, aggregate_type: &str) -> String {
        format!("{}.{}", self.topic_prefix, aggregate_type)
    }

    /// `base_backoff * 2^retry_count`, capped at `max_backoff`.
    pub fn backoff(&self, retry_count: i32) -> Duration {
        let exponent = u32::try_from(retry_count).unwrap_or(0).min(31);
        self.base_backoff
            .checked_mul(1u32 << exponent)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

/// What one call to [`OutboxProcessor::process_batch`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub published: usize,
    /// Failed publishes returned to `pending`.
    pub retried: usize,
    /// Failed publishes that exhausted their retries.
    pub dead_lettered: usize,
    /// Store errors while recording an outcome.
    pub errors: usize,
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        self.claimed == 0
    }
}

/// Polls the outbox and publishes due records.
///
/// Delivery is at-least-once: a crash between publish and `complete` leaves
/// the record in `processing`, and [`OutboxProcessor::recover_stale`] later
/// hands it back for another publish. Outcomes are recorded under the claim
/// token, so once a record is recovered only its new holder can settle it.
#[derive(Clone)]
pub struct OutboxProcessor {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    config: ProcessorConfig,
}

impl OutboxProcessor {
    /// Fails with [`OutboxError::Config`] if `config` does not validate.
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn Broker>,
        config: ProcessorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            broker,
            config,
        })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Claims one batch and publishes every record in it.
    #[tracing::instrument(skip(self))]
    pub async fn process_batch(&self) -> Result<BatchReport> {
        let records = self.store.claim_pending(self.config.batch_size).await?;
        let mut report = BatchReport {
            claimed: records.len(),
            ..BatchReport::default()
        };

        for record in records {
            let Some(token) = record.claim_token else {
                report.errors += 1;
                tracing::error!(outbox_id = %record.id, "claimed record has no claim token");
                continue;
            };
            match self.publish(&record).await {
                Ok(()) => match self.store.complete(record.id, token).await {
                    Ok(true) => {
                        report.published += 1;
                        metrics::counter!("outbox_published_total").increment(1);
                    }
                    Ok(false) => {
                        // Recovered as stale and reclaimed elsewhere.
                        metrics::counter!("outbox_claims_lost_total").increment(1);
                        tracing::warn!(
                            outbox_id = %record.id,
                            "claim lost before publish completed"
                        );
                    }
                    Err(e) => {
                        report.errors += 1;
                        tracing::error!(outbox_id = %record.id, error = %e, "failed to complete outbox record");
                    }
                },
                Err(reason) => self.fail(&record, token, &reason, &mut report).await,
            }
        }

        if !report.is_empty() {
            tracing::debug!(?report, "outbox batch processed");
        }
        Ok(report)
    }

    /// Hands `processing` records older than the stale lease back to `pending`.
    pub async fn recover_stale(&self) -> Result<u64> {
        let recovered = self.store.recover_stale(self.config.stale_lease).await?;
        if recovered > 0 {
            tracing::warn!(recovered, "recovered stale outbox records");
        }
        Ok(recovered)
    }

    /// Deletes completed records older than the retention window.
    pub async fn purge_completed(&self) -> Result<u64> {
        let purged = self
            .store
            .purge_completed(self.config.completed_retention)
            .await?;
        if purged > 0 {
            tracing::info!(purged, "purged completed outbox records");
        }
        Ok(purged)
    }

    /// Starts `workers` polling loops that stop when `shutdown` turns true.
    ///
    /// A worker finishes its current batch before exiting.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|worker| {
                let processor = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { processor.worker_loop(worker, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker, "outbox worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.recover_stale().await {
                tracing::error!(worker, error = %e, "stale outbox recovery failed");
            }

            let idle = match self.process_batch().await {
                Ok(report) => report.is_empty(),
                Err(e) => {
                    tracing::error!(worker, error = %e, "outbox batch failed");
                    true
                }
            };

            if idle {
                if worker == 0
                    && let Err(e) = self.purge_completed().await
                {
                    tracing::error!(worker, error = %e, "outbox purge failed");
                }
                self.record_backlog().await;
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        tracing::info!(worker, "outbox worker stopped");
    }

    async fn publish(&self, record: &OutboxRecord) -> std::result::Result<(), String> {
        let payload = OutboxMessage::from_record(record)
            .to_bytes()
            .map_err(|e| e.to_string())?;
        let topic = self.config.topic_for(&record.aggregate_type);

        match tokio::time::timeout(
            self.config.publish_timeout,
            self.broker.publish(&topic, &record.aggregate_id, payload),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "publish timed out after {:?}",
                self.config.publish_timeout
            )),
        }
    }

    async fn fail(
        &self,
        record: &OutboxRecord,
        token: ClaimToken,
        reason: &str,
        report: &mut BatchReport,
    ) {
        let delay = chrono::Duration::from_std(self.config.backoff(record.retry_count))
            .unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let retry_at = now.checked_add_signed(delay).unwrap_or(now);

        match self
            .store
            .record_failure(record.id, token, reason, retry_at)
            .await
        {
            Ok(Some(OutboxStatus::Failed)) => {
                report.dead_lettered += 1;
                metrics::counter!("outbox_dead_lettered_total").increment(1);
                tracing::error!(
                    outbox_id = %record.id,
                    event_type = %record.event_type,
                    retry_count = record.retry_count + 1,
                    error = reason,
                    "outbox record exhausted its retries"
                );
            }
            Ok(Some(_)) => {
                report.retried += 1;
                metrics::counter!("outbox_retried_total").increment(1);
                tracing::warn!(
                    outbox_id = %record.id,
                    retry_count = record.retry_count + 1,
                    %retry_at,
                    error = reason,
                    "outbox publish failed, will retry"
                );
            }
            Ok(None) => {
                metrics::counter!("outbox_claims_lost_total").increment(1);
                tracing::warn!(
                    outbox_id = %record.id,
                    "claim lost before failed publish was recorded"
                );
            }
            Err(e) => {
                report.errors += 1;
                tracing::error!(outbox_id = %record.id, error = %e, "failed to record outbox failure");
            }
        }
    }

    async fn record_backlog(&self) {
        match self.store.stats().await {
            Ok(stats) => metrics::gauge!("outbox_pending").set(stats.pending as f64),
            Err(e) => tracing::debug!(error = %e, "outbox stats unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ProcessorConfig {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            ..ProcessorConfig::default()
        };

        assert_eq!(config.backoff(0), Duration::from_secs(1));
        assert_eq!(config.backoff(1), Duration::from_secs(2));
        assert_eq!(config.backoff(3), Duration::from_secs(8));
        assert_eq!(config.backoff(4), Duration::from_secs(10));
        assert_eq!(config.backoff(1_000), Duration::from_secs(10));
        assert_eq!(config.backoff(-1), Duration::from_secs(1));
    }

    #[test]
    fn lease_must_outlast_a_full_batch() {
        assert!(ProcessorConfig::default().validate().is_ok());

        let config = ProcessorConfig {
            batch_size: 3,
            publish_timeout: Duration::from_millis(200),
            stale_lease: Duration::from_millis(100),
            ..ProcessorConfig::default()
        };
        assert!(matches!(config.validate(), Err(OutboxError::Config(_))));

        let config = ProcessorConfig {
            stale_lease: Duration::from_millis(600),
            ..config
        };
        assert!(matches!(config.validate(), Err(OutboxError::Config(_))));

        let config = ProcessorConfig {
            stale_lease: Duration::from_millis(601),
            ..config
        };
        assert!(config.validate().is_ok());

        let config = ProcessorConfig {
            batch_size: 0,
            ..ProcessorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn topics_are_prefixed_by_aggregate_type() {
        let config = ProcessorConfig::default();
        assert_eq!(config.topic_for("product"), "shop.product");
    }
}
