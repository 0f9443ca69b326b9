//! In-memory storage backends for development and testing
//!
//! [`InMemoryKeyValueStore`] and [`InMemoryBlobStore`] implement the storage
//! capabilities with thread-safe maps. Plugged into
//! [`TieredCheckpointSaver`](crate::TieredCheckpointSaver) they give a fully
//! functional, ephemeral checkpoint store.
//!
//! The key-value store enforces a per-item size limit like a real backend
//! would, and can be told to fail the next few calls with a transient error
//! to exercise retry paths.
//!
//! ```rust
//! use langgraph_checkpoint_tiered::backend::{InMemoryBlobStore, InMemoryKeyValueStore};
//!
//! let kv = InMemoryKeyValueStore::new();
//! let blobs = InMemoryBlobStore::new();
//! assert_eq!(kv.max_item_bytes(), 400 * 1024);
//! ```

use super::{
    BlobKey, BlobStore, Direction, Item, ItemKey, KeyValueStore, PutCondition, QueryPage,
    QueryRequest,
};
use crate::config::DEFAULT_MAX_ITEM_BYTES;
use crate::error::{BackendError, BackendResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Decrement a pending-failure counter; true if this call should fail.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Thread-safe in-memory sorted key-value store
#[derive(Debug, Clone)]
pub struct InMemoryKeyValueStore {
    items: Arc<RwLock<BTreeMap<ItemKey, Item>>>,
    max_item_bytes: usize,
    pending_failures: Arc<AtomicUsize>,
}

impl InMemoryKeyValueStore {
    /// Create a store with the default 400 KiB item limit
    pub fn new() -> Self {
        Self::with_max_item_bytes(DEFAULT_MAX_ITEM_BYTES)
    }

    /// Create a store with a custom item limit
    pub fn with_max_item_bytes(max_item_bytes: usize) -> Self {
        Self {
            items: Arc::new(RwLock::new(BTreeMap::new())),
            max_item_bytes,
            pending_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Item size limit
    pub fn max_item_bytes(&self) -> usize {
        self.max_item_bytes
    }

    /// Make the next `count` calls fail with [`BackendError::Transient`]
    pub fn fail_next(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Total number of items across all partitions
    pub async fn item_count(&self) -> usize {
        self.items.read().await.len()
    }

    /// Number of items in one partition
    pub async fn partition_len(&self, partition: &str) -> usize {
        self.items
            .read()
            .await
            .keys()
            .filter(|key| key.partition == partition)
            .count()
    }

    /// Remove everything (useful for testing)
    pub async fn clear(&self) {
        self.items.write().await.clear();
    }

    fn check_failure(&self, operation: &str) -> BackendResult<()> {
        if take_failure(&self.pending_failures) {
            return Err(BackendError::Transient(format!(
                "injected failure during {}",
                operation
            )));
        }
        Ok(())
    }
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn conditional_put(
        &self,
        key: &ItemKey,
        item: Item,
        condition: PutCondition,
    ) -> BackendResult<()> {
        self.check_failure("conditional_put")?;

        let size = item.size(key);
        if size > self.max_item_bytes {
            return Err(BackendError::ItemTooLarge {
                size,
                limit: self.max_item_bytes,
            });
        }

        let mut items = self.items.write().await;
        if condition == PutCondition::MustNotExist && items.contains_key(key) {
            return Err(BackendError::ConditionFailed(format!(
                "{}/{}",
                key.partition, key.sort
            )));
        }
        items.insert(key.clone(), item);
        Ok(())
    }

    async fn get(&self, key: &ItemKey) -> BackendResult<Option<Item>> {
        self.check_failure("get")?;
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn query(&self, request: &QueryRequest) -> BackendResult<QueryPage> {
        self.check_failure("query")?;

        let items = self.items.read().await;
        let start = ItemKey::new(request.partition.clone(), request.sort_prefix.clone());

        let mut matched: Vec<(ItemKey, Item)> = items
            .range(start..)
            .take_while(|(key, _)| {
                key.partition == request.partition && key.sort.starts_with(&request.sort_prefix)
            })
            .filter(|(key, _)| {
                request.lower.as_ref().map_or(true, |lower| key.sort > *lower)
                    && request.upper.as_ref().map_or(true, |upper| key.sort < *upper)
            })
            .map(|(key, item)| (key.clone(), item.clone()))
            .collect();

        if request.direction == Direction::Descending {
            matched.reverse();
        }

        let has_more = matched.len() > request.limit;
        matched.truncate(request.limit);
        let last_evaluated = if has_more {
            matched.last().map(|(key, _)| key.sort.clone())
        } else {
            None
        };

        Ok(QueryPage {
            items: matched,
            last_evaluated,
        })
    }

    async fn batch_delete(&self, keys: &[ItemKey]) -> BackendResult<()> {
        self.check_failure("batch_delete")?;

        let mut items = self.items.write().await;
        for key in keys {
            items.remove(key);
        }
        Ok(())
    }
}

/// Thread-safe in-memory content-addressed object store
#[derive(Debug, Clone, Default)]
pub struct InMemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    puts: Arc<AtomicUsize>,
    pending_failures: Arc<AtomicUsize>,
}

impl InMemoryBlobStore {
    /// Create an empty blob store
    pub fn new() -> Self {
        Self::default()
    }

    /// Location a key maps to
    pub fn location_for(key: &BlobKey) -> String {
        format!("mem://{}/{}", key.scope, key.content_hash)
    }

    /// Number of stored blobs
    pub async fn blob_count(&self) -> usize {
        self.blobs.read().await.len()
    }

    /// Number of `put` calls received, including idempotent repeats
    pub fn put_calls(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Make the next `count` calls fail with [`BackendError::Transient`]
    pub fn fail_next(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Remove everything (useful for testing)
    pub async fn clear(&self) {
        self.blobs.write().await.clear();
    }

    fn check_failure(&self, operation: &str) -> BackendResult<()> {
        if take_failure(&self.pending_failures) {
            return Err(BackendError::Transient(format!(
                "injected failure during {}",
                operation
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &BlobKey, bytes: Vec<u8>) -> BackendResult<String> {
        self.check_failure("put")?;
        self.puts.fetch_add(1, Ordering::SeqCst);

        let location = Self::location_for(key);
        self.blobs
            .write()
            .await
            .entry(location.clone())
            .or_insert(bytes);
        Ok(location)
    }

    async fn get(&self, location: &str) -> BackendResult<Option<Vec<u8>>> {
        self.check_failure("get")?;
        Ok(self.blobs.read().await.get(location).cloned())
    }

    async fn delete(&self, location: &str) -> BackendResult<()> {
        self.check_failure("delete")?;
        self.blobs.write().await.remove(location);
        Ok(())
    }

    async fn delete_scope(&self, scope: &str) -> BackendResult<()> {
        self.check_failure("delete_scope")?;
        let prefix = format!("mem://{}/", scope);
        self.blobs
            .write()
            .await
            .retain(|location, _| !location.starts_with(&prefix));
        Ok(())
    }
}
