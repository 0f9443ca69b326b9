//! Storage capabilities consumed by the checkpoint store
//!
//! Two traits describe what the store needs from the outside world:
//!
//! - [`KeyValueStore`] - a sorted key-value store with conditional writes
//!   (DynamoDB, Bigtable, FoundationDB, ...)
//! - [`BlobStore`] - an object store addressed by content hash (S3, GCS, ...)
//!
//! Implementations translate their SDK errors into [`BackendError`] so that
//! the retry layer can tell a throttled request from a failed condition.
//! In-memory implementations live in [`memory`].

pub mod memory;

use crate::error::BackendResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::{InMemoryBlobStore, InMemoryKeyValueStore};

/// Primary key of an item: partition plus sort key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub partition: String,
    pub sort: String,
}

impl ItemKey {
    pub fn new(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: sort.into(),
        }
    }
}

/// Stored value: format tag plus opaque bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub format: String,
    pub payload: Vec<u8>,
}

impl Item {
    /// Size the backend charges against its item limit
    pub fn size(&self, key: &ItemKey) -> usize {
        key.partition.len() + key.sort.len() + self.format.len() + self.payload.len()
    }
}

/// Precondition for [`KeyValueStore::conditional_put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutCondition {
    /// Fail with `ConditionFailed` if the key holds an item
    MustNotExist,
    /// Unconditional upsert
    Overwrite,
}

/// Scan direction over sort keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Range query within one partition
///
/// Returns items whose sort key starts with `sort_prefix` and lies strictly
/// between `lower` and `upper` when those are set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub partition: String,
    pub sort_prefix: String,
    pub lower: Option<String>,
    pub upper: Option<String>,
    pub direction: Direction,
    pub limit: usize,
}

/// One page of query results in the requested direction
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub items: Vec<(ItemKey, Item)>,
    /// Sort key of the last item when more may follow
    pub last_evaluated: Option<String>,
}

/// Sorted key-value store capability
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Write `item` under `key` if `condition` holds
    async fn conditional_put(
        &self,
        key: &ItemKey,
        item: Item,
        condition: PutCondition,
    ) -> BackendResult<()>;

    /// Point read; `Ok(None)` when absent
    async fn get(&self, key: &ItemKey) -> BackendResult<Option<Item>>;

    /// Ordered range read within one partition
    async fn query(&self, request: &QueryRequest) -> BackendResult<QueryPage>;

    /// Remove keys; absent keys are ignored
    async fn batch_delete(&self, keys: &[ItemKey]) -> BackendResult<()>;
}

/// Content address of a blob, scoped to one thread
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey {
    pub scope: String,
    pub content_hash: String,
}

/// Content-addressed object store capability
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key`, returning its location. Re-putting the
    /// same key is a successful no-op.
    async fn put(&self, key: &BlobKey, bytes: Vec<u8>) -> BackendResult<String>;

    /// Read the blob at `location`; `Ok(None)` when absent
    async fn get(&self, location: &str) -> BackendResult<Option<Vec<u8>>>;

    /// Remove the blob at `location`; absent blobs are ignored
    async fn delete(&self, location: &str) -> BackendResult<()>;

    /// Remove every blob stored under `scope`, including ones no record
    /// points at; an empty scope is not an error
    async fn delete_scope(&self, scope: &str) -> BackendResult<()>;
}
