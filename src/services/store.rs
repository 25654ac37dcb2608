use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::models::{EntityKey, EntityKind};

/// A versioned entity as held by the backing store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: EntityKey,
    /// Per-key write counter, starting at 1 for the first write
    pub version: u64,
    /// Store-wide commit order
    pub sequence: u64,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| StoreError::Corrupt {
            key: self.key.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Key-value document store with per-key versioned, conditional writes
///
/// Entity keys are `profile/{userId}`, `session/{sessionId}` and the
/// `pair/{lo}|{hi}` guard documents. Writes to one key are serialized by the
/// store; nothing is promised across keys.
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    async fn get(&self, key: &EntityKey) -> Result<Option<Document>, StoreError>;

    async fn list(&self, kind: EntityKind) -> Result<Vec<Document>, StoreError>;

    /// Write `payload` only if the key is currently at `expected_version`
    /// (0 means the key must not exist yet). Returns the committed document.
    async fn put_if_version(
        &self,
        key: &EntityKey,
        expected_version: u64,
        payload: serde_json::Value,
    ) -> Result<Document, StoreError>;

    /// Stream of every committed document, starting from the next commit.
    ///
    /// Lazy: nothing is allocated server-side until first polled. Dropping the
    /// stream releases the subscription.
    fn subscribe(&self) -> BoxStream<'static, Document>;

    /// Cheap reachability check for health checks
    async fn ping(&self) -> Result<(), StoreError>;
}
