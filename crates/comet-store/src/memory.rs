use crate::{MessageLog, MessageStore, Result};
use async_trait::async_trait;
use comet_common::{Message, now_nanos};
use std::collections::HashMap;
use tokio::sync::RwLock;

const DEFAULT_MAX_PER_KEY: usize = 1024;

/// In-process offline store with per-key retention and lazy expiry.
///
/// Stands in for the upstream message service in tests and single-node setups.
///
/// ```
/// use bytes::Bytes;
/// use comet_common::{Message, MessageGroup};
/// use comet_store::{MemoryMessageStore, MessageStore};
///
/// let store = MemoryMessageStore::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let message = Message::new(1, Bytes::from_static(b"v"), MessageGroup::Private, i64::MAX);
///     store.save("k", &message).await.expect("save");
///     assert_eq!(store.get("k", 0).await.expect("get"), vec![message]);
/// });
/// ```
#[derive(Debug)]
pub struct MemoryMessageStore {
    // RwLock allows concurrent readers while saves take exclusive access.
    inner: RwLock<HashMap<String, MessageLog>>,
    max_per_key: usize,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_per_key: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_per_key: max_per_key.max(1),
        }
    }

    pub async fn len(&self, key: &str) -> usize {
        self.inner.read().await.get(key).map_or(0, MessageLog::len)
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_PER_KEY)
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn save(&self, key: &str, message: &Message) -> Result<()> {
        let mut guard = self.inner.write().await;
        let log = guard.entry(key.to_string()).or_default();
        log.insert_bounded(message.clone(), self.max_per_key)?;
        Ok(())
    }

    async fn get(&self, key: &str, since_id: i64) -> Result<Vec<Message>> {
        // Take a write lock so expired entries can be dropped during the scan.
        let mut guard = self.inner.write().await;
        let Some(log) = guard.get_mut(key) else {
            return Ok(Vec::new());
        };
        let now = now_nanos();
        let mut live = Vec::new();
        let mut expired = Vec::new();
        for (id, message) in log.successors_after(since_id) {
            if message.is_expired(now) {
                expired.push(id);
            } else {
                live.push(message.clone());
            }
        }
        for id in expired {
            log.delete(id);
        }
        Ok(live)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreError;
    use bytes::Bytes;
    use comet_common::MessageGroup;

    fn message(id: i64, expire: i64) -> Message {
        Message::new(id, Bytes::from_static(b"m"), MessageGroup::Private, expire)
    }

    #[tokio::test]
    async fn get_returns_messages_after_since_id() {
        let store = MemoryMessageStore::new();
        for id in 1..=4 {
            store.save("k", &message(id, i64::MAX)).await.expect("save");
        }
        let ids: Vec<i64> = store
            .get("k", 2)
            .await
            .expect("get")
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![3, 4]);
        assert!(store.get("other", 0).await.expect("get").is_empty());
    }

    #[tokio::test]
    async fn expired_messages_are_dropped_on_read() {
        let store = MemoryMessageStore::new();
        store.save("k", &message(1, 1)).await.expect("save");
        store.save("k", &message(2, i64::MAX)).await.expect("save");
        let ids: Vec<i64> = store
            .get("k", 0)
            .await
            .expect("get")
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![2]);
        assert_eq!(store.len("k").await, 1);
    }

    #[tokio::test]
    async fn per_key_capacity_evicts_oldest() {
        let store = MemoryMessageStore::with_capacity(2);
        for id in 1..=3 {
            store.save("k", &message(id, i64::MAX)).await.expect("save");
        }
        assert_eq!(store.len("k").await, 2);
        assert_eq!(store.get("k", 0).await.expect("get")[0].id, 2);
    }

    #[tokio::test]
    async fn duplicate_save_is_rejected() {
        let store = MemoryMessageStore::new();
        store.save("k", &message(1, i64::MAX)).await.expect("save");
        let err = store
            .save("k", &message(1, i64::MAX))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, StoreError::Duplicate(1)));
    }

    #[tokio::test]
    async fn delete_clears_key() {
        let store = MemoryMessageStore::new();
        store.save("k", &message(1, i64::MAX)).await.expect("save");
        store.delete("k").await.expect("delete");
        assert_eq!(store.len("k").await, 0);
    }

    #[test]
    fn error_display_mentions_details() {
        assert!(StoreError::Duplicate(9).to_string().contains('9'));
        let err = StoreError::Rejected {
            status: 503,
            message: "busy".to_string(),
        };
        assert!(err.to_string().contains("503"));
        assert!(err.to_string().contains("busy"));
    }
}
