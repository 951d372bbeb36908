//! The wire envelope published for each outbox record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use store::{OutboxId, OutboxRecord};

use crate::Result;

/// JSON body of a published outbox record.
///
/// Consumers must treat delivery as at-least-once: the same `id` can arrive
/// more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: OutboxId,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl OutboxMessage {
    pub fn from_record(record: &OutboxRecord) -> Self {
        Self {
            id: record.id,
            event_type: record.event_type.clone(),
            aggregate_type: record.aggregate_type.clone(),
            aggregate_id: record.aggregate_id.clone(),
            payload: record.payload.clone(),
            created_at: record.created_at,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use store::NewOutboxRecord;

    use super::*;

    #[test]
    fn envelope_carries_record_identity() {
        let record = OutboxRecord::pending(
            OutboxId::new(42),
            NewOutboxRecord::new(
                "product.created",
                "product",
                "p-1",
                serde_json::json!({ "name": "Dune" }),
            ),
            Utc::now(),
        );

        let bytes = OutboxMessage::from_record(&record).to_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["id"], 42);
        assert_eq!(json["event_type"], "product.created");
        assert_eq!(json["aggregate_id"], "p-1");
        assert_eq!(json["payload"]["name"], "Dune");
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        assert!(matches!(
            OutboxMessage::from_bytes(b"not json"),
            Err(crate::OutboxError::Serialization(_))
        ));
    }
}
