//! NATS broker over core publish/subscribe.

use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::broker::{Broker, BrokerMessage, Subscription};
use crate::error::BrokerError;

/// Header carrying the message key.
pub const KEY_HEADER: &str = "Outbox-Key";

const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Clone)]
pub struct NatsBroker {
    client: Client,
}

impl NatsBroker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        tracing::info!(url, "connected to NATS");
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let mut headers = HeaderMap::new();
        headers.insert(KEY_HEADER, key);

        self.client
            .publish_with_headers(topic.to_string(), headers, payload.into())
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        // Core publish only buffers; flushing surfaces a dead connection.
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        let mut subscriber = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let key = message
                    .headers
                    .as_ref()
                    .and_then(|headers| headers.get(KEY_HEADER))
                    .map(|value| value.as_str().to_string());
                let forwarded = BrokerMessage {
                    topic: message.subject.to_string(),
                    key,
                    payload: message.payload.to_vec(),
                };
                if sender.send(forwarded).await.is_err() {
                    break;
                }
            }
        });
        Ok(Subscription::new(receiver))
    }
}
