use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};

use crate::error::StoreError;
use crate::models::{EntityKey, EntityKind};
use crate::services::store::{BackingStore, Document};

const CHANGE_BUFFER: usize = 1024;

/// In-process backing store
///
/// Used for tests and single-node development. `set_available` and
/// `fail_next` simulate outages so retry and offline paths can be exercised.
pub struct MemoryStore {
    documents: RwLock<HashMap<EntityKey, Document>>,
    sequence: AtomicU64,
    available: AtomicBool,
    failures_left: AtomicU32,
    changes: broadcast::Sender<Document>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            documents: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            available: AtomicBool::new(true),
            failures_left: AtomicU32::new(0),
            changes,
        }
    }

    /// Take the store offline (or bring it back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with `Unavailable`, then recover
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn get(&self, key: &EntityKey) -> Result<Option<Document>, StoreError> {
        self.check_available()?;
        Ok(self.documents.read().await.get(key).cloned())
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Document>, StoreError> {
        self.check_available()?;
        let documents = self.documents.read().await;
        let mut found: Vec<Document> = documents
            .values()
            .filter(|doc| doc.key.kind() == kind)
            .cloned()
            .collect();
        found.sort_by_key(|doc| doc.sequence);
        Ok(found)
    }

    async fn put_if_version(
        &self,
        key: &EntityKey,
        expected_version: u64,
        payload: serde_json::Value,
    ) -> Result<Document, StoreError> {
        self.check_available()?;
        let mut documents = self.documents.write().await;

        let actual = documents.get(key).map(|doc| doc.version).unwrap_or(0);
        if actual != expected_version {
            return Err(StoreError::VersionMismatch {
                key: key.clone(),
                expected: expected_version,
                actual,
            });
        }

        let document = Document {
            key: key.clone(),
            version: expected_version + 1,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            payload,
            updated_at: Utc::now(),
        };
        documents.insert(key.clone(), document.clone());
        drop(documents);

        // No subscribers is fine
        let _ = self.changes.send(document.clone());
        tracing::trace!("Committed {} at version {}", key, document.version);
        Ok(document)
    }

    fn subscribe(&self) -> BoxStream<'static, Document> {
        let receiver = self.changes.subscribe();
        stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(document) => return Some((document, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Change subscriber lagged, skipped {} documents", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> EntityKey {
        EntityKey::Profile("alice".to_string())
    }

    #[tokio::test]
    async fn test_conditional_writes() {
        let store = MemoryStore::new();

        let first = store.put_if_version(&key(), 0, json!({"n": 1})).await.unwrap();
        assert_eq!(first.version, 1);

        let second = store.put_if_version(&key(), 1, json!({"n": 2})).await.unwrap();
        assert_eq!(second.version, 2);
        assert!(second.sequence > first.sequence);

        let stale = store.put_if_version(&key(), 1, json!({"n": 3})).await;
        assert!(matches!(
            stale,
            Err(StoreError::VersionMismatch { expected: 1, actual: 2, .. })
        ));

        let current = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(current.payload, json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_create_requires_absent_key() {
        let store = MemoryStore::new();
        store.put_if_version(&key(), 0, json!({})).await.unwrap();
        assert!(store.put_if_version(&key(), 0, json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_list_by_kind() {
        let store = MemoryStore::new();
        store.put_if_version(&key(), 0, json!({})).await.unwrap();
        store
            .put_if_version(&EntityKey::Session(uuid::Uuid::new_v4()), 0, json!({}))
            .await
            .unwrap();

        assert_eq!(store.list(EntityKind::Profile).await.unwrap().len(), 1);
        assert_eq!(store.list(EntityKind::Session).await.unwrap().len(), 1);
        assert!(store.list(EntityKind::Pair).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_sees_commits() {
        let store = MemoryStore::new();
        let mut changes = store.subscribe();

        store.put_if_version(&key(), 0, json!({"n": 1})).await.unwrap();

        let seen = changes.next().await.unwrap();
        assert_eq!(seen.key, key());
        assert_eq!(seen.version, 1);
    }

    #[tokio::test]
    async fn test_outages() {
        let store = MemoryStore::new();
        store.fail_next(2);
        assert!(store.ping().await.is_err());
        assert!(store.ping().await.is_err());
        assert!(store.ping().await.is_ok());

        store.set_available(false);
        let err = store.get(&key()).await.unwrap_err();
        assert!(err.is_unavailable());
        store.set_available(true);
        assert!(store.get(&key()).await.unwrap().is_none());
    }
}
