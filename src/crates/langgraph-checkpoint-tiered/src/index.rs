//! Metadata index over a sorted key-value store
//!
//! Translates `(thread, namespace, checkpoint)` identities into the
//! partition/sort key scheme of a [`KeyValueStore`] and encodes records.
//!
//! # Key layout
//!
//! All records of a thread share one partition, the thread id itself:
//!
//! ```text
//! partition  sort key
//! ---------  ------------------------------------------------------------
//! thread-1   C#{ns}#{checkpoint_id}                             checkpoint
//! thread-1   W#{ns}#{checkpoint_id}#{task_id}#{index}#{channel} pending write
//! ```
//!
//! Namespace, task id and channel are escaped (`%` → `%25`, `#` → `%23`) so a
//! component can never swallow a separator. Checkpoint ids are stored raw and
//! must not contain `#`; they are time-ordered, so a descending range scan
//! over `C#{ns}#` walks history newest first. Indices are mapped onto 16 hex
//! digits in an order-preserving way, so special channels (negative indices)
//! sort before regular writes.
//!
//! Records are encoded with [`BincodeSerializer`]; the format tag is stored on
//! the item and an unknown tag fails with `UnsupportedFormat`.

use crate::backend::{Direction, Item, ItemKey, KeyValueStore, PutCondition, QueryRequest};
use crate::blob::{content_hash, BlobPointer, Segment};
use crate::checkpoint::CheckpointId;
use crate::error::{BackendError, CheckpointError, Result};
use crate::pagination::PageCursor;
use crate::retry::{with_retry, RetryPolicy};
use crate::serializer::{BincodeSerializer, SerializerProtocol, TypedBytes};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const CHECKPOINT_PREFIX: &str = "C#";
pub const WRITE_PREFIX: &str = "W#";
const SEPARATOR: char = '#';

/// Escape a key component so it contains no separator
pub fn escape(component: &str) -> String {
    component.replace('%', "%25").replace(SEPARATOR, "%23")
}

/// Order-preserving fixed-width encoding of a write index
pub fn encode_index(index: i64) -> String {
    format!("{:016x}", (index as u64) ^ (1u64 << 63))
}

/// Reject checkpoint ids that would break the key layout
pub fn validate_checkpoint_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(CheckpointError::Invalid("checkpoint id must not be empty".into()));
    }
    if id.contains(SEPARATOR) {
        return Err(CheckpointError::Invalid(format!(
            "checkpoint id {:?} must not contain '{}'",
            id, SEPARATOR
        )));
    }
    Ok(())
}

/// Sort key prefix of all checkpoints in a namespace
pub fn checkpoint_prefix(checkpoint_ns: &str) -> String {
    format!("{}{}#", CHECKPOINT_PREFIX, escape(checkpoint_ns))
}

/// Key of one checkpoint record
pub fn checkpoint_key(thread_id: &str, checkpoint_ns: &str, checkpoint_id: &str) -> ItemKey {
    ItemKey::new(
        thread_id,
        format!("{}{}", checkpoint_prefix(checkpoint_ns), checkpoint_id),
    )
}

/// Sort key prefix of all writes recorded against one checkpoint
pub fn writes_prefix(checkpoint_ns: &str, checkpoint_id: &str) -> String {
    format!("{}{}#{}#", WRITE_PREFIX, escape(checkpoint_ns), checkpoint_id)
}

/// Key of one pending-write record
pub fn write_key(
    thread_id: &str,
    checkpoint_ns: &str,
    checkpoint_id: &str,
    task_id: &str,
    index: i64,
    channel: &str,
) -> ItemKey {
    ItemKey::new(
        thread_id,
        format!(
            "{}{}#{}#{}",
            writes_prefix(checkpoint_ns, checkpoint_id),
            escape(task_id),
            encode_index(index),
            escape(channel)
        ),
    )
}

/// Stored form of a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub checkpoint_id: CheckpointId,
    pub checkpoint_ns: String,
    pub parent_checkpoint_id: Option<CheckpointId>,
    /// Checkpoint without its channel values
    pub checkpoint: Segment,
    pub metadata: Segment,
    /// One segment per channel value
    pub channels: BTreeMap<String, Segment>,
    /// Hash over all segment hashes; equal content gives equal fingerprints
    pub fingerprint: String,
}

impl CheckpointRecord {
    /// Fingerprint of a record's content, independent of tiering
    pub fn compute_fingerprint(
        parent_checkpoint_id: Option<&str>,
        checkpoint: &Segment,
        metadata: &Segment,
        channels: &BTreeMap<String, Segment>,
    ) -> String {
        let mut parts = Vec::with_capacity(channels.len() + 3);
        parts.push(format!("parent={}", parent_checkpoint_id.unwrap_or("")));
        parts.push(format!("checkpoint={}:{}", checkpoint.format, checkpoint.content_hash()));
        parts.push(format!("metadata={}:{}", metadata.format, metadata.content_hash()));
        for (channel, segment) in channels {
            parts.push(format!(
                "channel:{}={}:{}",
                escape(channel),
                segment.format,
                segment.content_hash()
            ));
        }
        content_hash(parts.join("\n").as_bytes())
    }

    /// Blob pointers referenced by this record
    pub fn pointers(&self) -> Vec<&BlobPointer> {
        std::iter::once(&self.checkpoint)
            .chain(std::iter::once(&self.metadata))
            .chain(self.channels.values())
            .filter_map(Segment::pointer)
            .collect()
    }
}

/// Stored form of a pending write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRecord {
    pub task_id: String,
    pub channel: String,
    pub index: i64,
    pub value: Segment,
}

/// Result of inserting a checkpoint record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Created,
    /// An identical record was already present
    Unchanged,
}

/// Key of a stored item plus the blobs it references
#[derive(Debug, Clone)]
pub struct ThreadEntry {
    pub key: ItemKey,
    pub pointers: Vec<BlobPointer>,
}

/// Adapter mapping checkpoint identities onto a [`KeyValueStore`]
#[derive(Clone)]
pub struct MetadataIndex {
    store: Arc<dyn KeyValueStore>,
    retry: RetryPolicy,
    codec: BincodeSerializer,
}

impl MetadataIndex {
    pub fn new(store: Arc<dyn KeyValueStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            codec: BincodeSerializer::new(),
        }
    }

    fn encode<T: Serialize>(&self, record: &T) -> Result<Item> {
        let typed = self.codec.dumps_typed(record)?;
        Ok(Item {
            format: typed.format,
            payload: typed.data,
        })
    }

    fn decode<T: DeserializeOwned>(&self, item: Item) -> Result<T> {
        self.codec.loads_typed(&TypedBytes {
            format: item.format,
            data: item.payload,
        })
    }

    /// Write a checkpoint record unless its key is taken
    ///
    /// An existing record with the same fingerprint is an idempotent retry
    /// and reported as [`InsertOutcome::Unchanged`]; any other existing
    /// record fails with [`CheckpointError::AlreadyExists`].
    pub async fn insert_checkpoint(
        &self,
        thread_id: &str,
        record: &CheckpointRecord,
    ) -> Result<InsertOutcome> {
        let key = checkpoint_key(thread_id, &record.checkpoint_ns, &record.checkpoint_id);
        let item = self.encode(record)?;

        let outcome = with_retry(&self.retry, "checkpoint_put", || {
            self.store
                .conditional_put(&key, item.clone(), PutCondition::MustNotExist)
        })
        .await;

        match outcome {
            Ok(()) => Ok(InsertOutcome::Created),
            Err(CheckpointError::Backend(BackendError::ConditionFailed(_))) => {
                let existing = self
                    .get_checkpoint(thread_id, &record.checkpoint_ns, &record.checkpoint_id)
                    .await?;
                match existing {
                    Some(existing) if existing.fingerprint == record.fingerprint => {
                        debug!(
                            thread_id,
                            checkpoint_ns = %record.checkpoint_ns,
                            checkpoint_id = %record.checkpoint_id,
                            "Checkpoint already stored with identical content"
                        );
                        Ok(InsertOutcome::Unchanged)
                    }
                    _ => {
                        warn!(
                            thread_id,
                            checkpoint_ns = %record.checkpoint_ns,
                            checkpoint_id = %record.checkpoint_id,
                            "Conflicting checkpoint write rejected"
                        );
                        Err(CheckpointError::AlreadyExists(format!(
                            "{}/{}/{}",
                            thread_id, record.checkpoint_ns, record.checkpoint_id
                        )))
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Point read of a checkpoint record
    pub async fn get_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
    ) -> Result<Option<CheckpointRecord>> {
        let key = checkpoint_key(thread_id, checkpoint_ns, checkpoint_id);
        let item = with_retry(&self.retry, "checkpoint_get", || self.store.get(&key)).await?;
        item.map(|item| self.decode(item)).transpose()
    }

    /// Newest checkpoint records of a namespace strictly below `before`
    pub async fn checkpoint_page(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CheckpointRecord>> {
        let prefix = checkpoint_prefix(checkpoint_ns);
        let request = QueryRequest {
            partition: thread_id.to_string(),
            upper: before.map(|id| format!("{}{}", prefix, id)),
            sort_prefix: prefix,
            lower: None,
            direction: Direction::Descending,
            limit,
        };

        let page = with_retry(&self.retry, "checkpoint_query", || self.store.query(&request)).await?;
        page.items
            .into_iter()
            .map(|(_, item)| self.decode(item))
            .collect()
    }

    /// Latest checkpoint record of a namespace
    pub async fn latest_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
    ) -> Result<Option<CheckpointRecord>> {
        let mut page = self.checkpoint_page(thread_id, checkpoint_ns, None, 1).await?;
        Ok(page.pop())
    }

    /// Upsert a pending-write record
    pub async fn put_write(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
        record: &WriteRecord,
    ) -> Result<()> {
        let key = write_key(
            thread_id,
            checkpoint_ns,
            checkpoint_id,
            &record.task_id,
            record.index,
            &record.channel,
        );
        let item = self.encode(record)?;
        with_retry(&self.retry, "write_put", || {
            self.store
                .conditional_put(&key, item.clone(), PutCondition::Overwrite)
        })
        .await
    }

    /// All write records of one checkpoint
    pub async fn writes_for(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
        page_size: usize,
    ) -> Result<Vec<WriteRecord>> {
        let mut cursor = PageCursor::new(thread_id, writes_prefix(checkpoint_ns, checkpoint_id));
        let mut records = Vec::new();

        while let Some(request) = cursor.next_request(page_size) {
            let page = with_retry(&self.retry, "write_query", || self.store.query(&request)).await?;
            cursor.advance(&page);
            for (_, item) in page.items {
                records.push(self.decode(item)?);
            }
        }
        Ok(records)
    }

    /// Every item of a thread with the blobs it references
    pub async fn scan_thread(&self, thread_id: &str, page_size: usize) -> Result<Vec<ThreadEntry>> {
        let mut cursor = PageCursor::new(thread_id, "");
        let mut entries = Vec::new();

        while let Some(request) = cursor.next_request(page_size) {
            let page = with_retry(&self.retry, "thread_scan", || self.store.query(&request)).await?;
            cursor.advance(&page);
            for (key, item) in page.items {
                let pointers = if key.sort.starts_with(CHECKPOINT_PREFIX) {
                    let record: CheckpointRecord = self.decode(item)?;
                    record.pointers().into_iter().cloned().collect()
                } else if key.sort.starts_with(WRITE_PREFIX) {
                    let record: WriteRecord = self.decode(item)?;
                    record.value.pointer().into_iter().cloned().collect()
                } else {
                    Vec::new()
                };
                entries.push(ThreadEntry { key, pointers });
            }
        }
        Ok(entries)
    }

    /// Remove keys in batches of `batch_size`
    pub async fn delete_keys(&self, keys: &[ItemKey], batch_size: usize) -> Result<()> {
        for batch in keys.chunks(batch_size.max(1)) {
            with_retry(&self.retry, "batch_delete", || self.store.batch_delete(batch)).await?;
        }
        Ok(())
    }
}
