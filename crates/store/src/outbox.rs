//! Outbox records and the status machine the processor drives.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, StoreError};

/// Retry budget given to records that do not ask for another one.
pub const DEFAULT_MAX_RETRIES: i32 = 5;

/// Identifier of an outbox row, assigned by the store's sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxId(u64);

impl OutboxId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Sequence values are positive, so the cast is lossless.
    pub fn as_i64(&self) -> i64 {
        self.0 as i64
    }
}

impl From<i64> for OutboxId {
    fn from(value: i64) -> Self {
        Self(value as u64)
    }
}

impl std::fmt::Display for OutboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Marks one claim of a record. A worker completes or fails a record only
/// with the token it claimed it under, so a claim that went stale and was
/// taken over by another worker can no longer change the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimToken(Uuid);

impl ClaimToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ClaimToken {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an outbox record is in its delivery lifecycle.
///
/// ```text
/// pending ──claim──▶ processing ──publish ok──▶ completed
///    ▲                   │
///    └──retry < max──────┤
///                        └──retry >= max──▶ failed (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Completed => "completed",
            OutboxStatus::Failed => "failed",
        }
    }

    /// Terminal records are never claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Completed | OutboxStatus::Failed)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processing" => Ok(OutboxStatus::Processing),
            "completed" => Ok(OutboxStatus::Completed),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(StoreError::CorruptRow(format!(
                "unknown outbox status '{other}'"
            ))),
        }
    }
}

/// An outbox record to be written inside a business transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxRecord {
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub max_retries: i32,
}

impl NewOutboxRecord {
    pub fn new(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl ToString,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.to_string(),
            payload,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A stored outbox record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: OutboxId,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Earliest time a pending record may be claimed again. `None` means now.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Set while the record is `processing`.
    pub claim_token: Option<ClaimToken>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// Builds the initial `pending` row for `new`.
    pub fn pending(id: OutboxId, new: NewOutboxRecord, now: DateTime<Utc>) -> Self {
        Self {
            id,
            event_type: new.event_type,
            aggregate_type: new.aggregate_type,
            aggregate_id: new.aggregate_id,
            payload: new.payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries: new.max_retries,
            error_message: None,
            processed_at: None,
            next_attempt_at: None,
            claim_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a pending record's backoff has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Whether the record is `processing` under `token`.
    pub fn is_held_by(&self, token: ClaimToken) -> bool {
        self.status == OutboxStatus::Processing && self.claim_token == Some(token)
    }
}

/// Row counts per status, for metrics and alerting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

/// Status transitions used by the outbox processor.
///
/// Every method runs on the base connection as one statement conditioned on
/// the record's current status, so two processors racing on the same row
/// can never both win. Outcomes are further conditioned on the claim token.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Moves up to `limit` due `pending` records to `processing`, oldest
    /// first, under one fresh claim token.
    async fn claim_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// Moves one record from `pending` to `processing`.
    ///
    /// Returns `None` if the record was not pending (someone else claimed it).
    async fn claim(&self, id: OutboxId) -> Result<Option<ClaimToken>>;

    /// Moves a `processing` record claimed under `token` to `completed` and
    /// stamps `processed_at`.
    async fn complete(&self, id: OutboxId, token: ClaimToken) -> Result<bool>;

    /// Records a failed publish on a `processing` record claimed under
    /// `token`.
    ///
    /// Increments `retry_count` and stores `error`. The record returns to
    /// `pending` (claimable from `retry_at`) while `retry_count < max_retries`
    /// and becomes terminally `failed` otherwise. Returns the new status, or
    /// `None` if the record is no longer held under `token`.
    async fn record_failure(
        &self,
        id: OutboxId,
        token: ClaimToken,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<OutboxStatus>>;

    /// Returns `processing` records untouched for longer than `lease` to
    /// `pending` and voids their claim. Their retry count is left alone.
    async fn recover_stale(&self, lease: Duration) -> Result<u64>;

    async fn stats(&self) -> Result<OutboxStats>;

    /// Deletes `completed` records processed more than `older_than` ago.
    async fn purge_completed(&self, older_than: Duration) -> Result<u64>;

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>>;
}

/// `now - age`, saturating at the earliest representable time.
pub(crate) fn cutoff(age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|delta| Utc::now().checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
