//! Session persistence backends.

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// What the server keeps for one session id.
///
/// The principal is held as raw JSON so it is re-validated on every read rather than trusted
/// because it deserialized once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csrf_secret: Option<String>,
    /// Epoch milliseconds of the last completed login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_auth_at: Option<i64>,
}

#[derive(Error, Debug)]
pub enum SessionStoreError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),

    #[error("session record could not be encoded: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Key-value session backend with expiry.
///
/// Every `save` restarts the record's time-to-live.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<SessionRecord>, SessionStoreError>;

    async fn save(&self, id: &str, record: &SessionRecord) -> Result<(), SessionStoreError>;

    async fn delete(&self, id: &str) -> Result<(), SessionStoreError>;
}

/// In-process store for single-replica deployments and tests.
#[derive(Clone)]
pub struct MemorySessionStore {
    records: Cache<String, SessionRecord>,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        Self {
            records: Cache::builder().max_capacity(max_capacity).time_to_live(ttl).build(),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, id: &str) -> Result<Option<SessionRecord>, SessionStoreError> {
        Ok(self.records.get(id).await)
    }

    async fn save(&self, id: &str, record: &SessionRecord) -> Result<(), SessionStoreError> {
        self.records.insert(id.to_string(), record.clone()).await;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), SessionStoreError> {
        self.records.invalidate(id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_roundtrip_and_delete() {
        let store = MemorySessionStore::new(Duration::from_secs(60), 10);
        let record = SessionRecord {
            user: Some(json!({ "id": "u1" })),
            csrf_secret: Some("secret".to_string()),
            last_auth_at: Some(1),
        };

        store.save("abc", &record).await.unwrap();
        assert_eq!(store.load("abc").await.unwrap(), Some(record));

        store.delete("abc").await.unwrap();
        assert_eq!(store.load("abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_expires_records() {
        let store = MemorySessionStore::new(Duration::from_millis(50), 10);
        store.save("abc", &SessionRecord::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.load("abc").await.unwrap(), None);
    }
}
