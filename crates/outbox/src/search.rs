//! Search store abstraction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tokio::sync::RwLock;

use crate::error::SearchError;

/// Document store the consumer projects into.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Creates or replaces the document `id` in `index`.
    async fn index_document(
        &self,
        index: &str,
        id: &str,
        document: serde_json::Value,
    ) -> Result<(), SearchError>;

    /// Removes the document. Removing a missing document succeeds.
    async fn delete_document(&self, index: &str, id: &str) -> Result<(), SearchError>;
}

/// In-memory search index for tests and local runs.
#[derive(Clone, Default)]
pub struct InMemorySearchIndex {
    documents: Arc<RwLock<HashMap<(String, String), serde_json::Value>>>,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, index: &str, id: &str) -> Option<serde_json::Value> {
        self.documents
            .read()
            .await
            .get(&(index.to_string(), id.to_string()))
            .cloned()
    }

    /// Number of documents in `index`.
    pub async fn len(&self, index: &str) -> usize {
        self.documents
            .read()
            .await
            .keys()
            .filter(|(i, _)| i == index)
            .count()
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn index_document(
        &self,
        index: &str,
        id: &str,
        document: serde_json::Value,
    ) -> Result<(), SearchError> {
        self.documents
            .write()
            .await
            .insert((index.to_string(), id.to_string()), document);
        Ok(())
    }

    async fn delete_document(&self, index: &str, id: &str) -> Result<(), SearchError> {
        self.documents
            .write()
            .await
            .remove(&(index.to_string(), id.to_string()));
        Ok(())
    }
}

/// Elasticsearch-compatible HTTP search index.
#[derive(Clone)]
pub struct HttpSearchIndex {
    client: Client,
    base_url: String,
}

impl HttpSearchIndex {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SearchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn document_url(&self, index: &str, id: &str) -> String {
        format!("{}/{}/_doc/{}", self.base_url, index, id)
    }
}

async fn status_error(response: reqwest::Response) -> SearchError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    SearchError::Status { status, body }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    #[tracing::instrument(skip(self, document))]
    async fn index_document(
        &self,
        index: &str,
        id: &str,
        document: serde_json::Value,
    ) -> Result<(), SearchError> {
        let response = self
            .client
            .put(self.document_url(index, id))
            .json(&document)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_document(&self, index: &str, id: &str) -> Result<(), SearchError> {
        let response = self
            .client
            .delete(self.document_url(index, id))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(status_error(response).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_overwrites_and_delete_is_idempotent() {
        let index = InMemorySearchIndex::new();
        index
            .index_document("products", "1", serde_json::json!({ "price": 1 }))
            .await
            .unwrap();
        index
            .index_document("products", "1", serde_json::json!({ "price": 2 }))
            .await
            .unwrap();

        assert_eq!(index.len("products").await, 1);
        assert_eq!(
            index.get("products", "1").await,
            Some(serde_json::json!({ "price": 2 }))
        );

        index.delete_document("products", "1").await.unwrap();
        index.delete_document("products", "1").await.unwrap();
        assert_eq!(index.len("products").await, 0);
    }

    #[test]
    fn document_url_ignores_trailing_slash() {
        let index = HttpSearchIndex::new("http://search:9200/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            index.document_url("products", "abc"),
            "http://search:9200/products/_doc/abc"
        );
    }
}
