//! Tiered checkpoint saver
//!
//! [`TieredCheckpointSaver`] stores one record per checkpoint in a
//! [`KeyValueStore`] and moves payload segments that would not fit to a
//! [`BlobStore`].
//!
//! # Write path
//!
//! ```text
//! put(checkpoint, metadata)
//!   │
//!   ├─ encode: checkpoint body | metadata | channel 1 | channel 2 | ...
//!   ├─ plan_offload(sizes) ──► oversized segments ──► BlobStore::put
//!   ├─ fingerprint(segment hashes)
//!   └─ KeyValueStore::conditional_put(MustNotExist)
//!          └─ ConditionFailed ──► same fingerprint? Ok : AlreadyExists
//! ```
//!
//! Blobs are written before the record, so a record is never visible with a
//! pointer to a blob that has not been stored. A put that fails after
//! uploading leaves blobs no record references; they are removed with the
//! thread.
//!
//! # Read path
//!
//! Fetch the record (or the newest one in the namespace), resolve pointers,
//! decode, then attach every write recorded against the checkpoint id.

use crate::backend::{BlobStore, InMemoryBlobStore, InMemoryKeyValueStore, ItemKey, KeyValueStore};
use crate::blob::{plan_offload, BlobOffload, Segment};
use crate::checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple, PendingWrite,
};
use crate::config::CheckpointStoreConfig;
use crate::error::{CheckpointError, Result};
use crate::index::{validate_checkpoint_id, CheckpointRecord, InsertOutcome, MetadataIndex, WriteRecord};
use crate::pagination::ListCursor;
use crate::serializer::{JsonSerializer, SerializerProtocol, TypedBytes};
use crate::traits::{CheckpointSaver, CheckpointStream, ListOptions};
use crate::writes::PendingWrites;
use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Checkpoint saver over a key-value store with blob offload
///
/// Application state is encoded with `S` (JSON by default); records are
/// always encoded with bincode. Cloning is cheap and clones share backends.
pub struct TieredCheckpointSaver<S: SerializerProtocol = JsonSerializer> {
    index: MetadataIndex,
    blobs: BlobOffload,
    serde: Arc<S>,
    config: CheckpointStoreConfig,
}

impl<S: SerializerProtocol> Clone for TieredCheckpointSaver<S> {
    fn clone(&self) -> Self {
        Self {
            index: self.index.clone(),
            blobs: self.blobs.clone(),
            serde: Arc::clone(&self.serde),
            config: self.config.clone(),
        }
    }
}

impl TieredCheckpointSaver<JsonSerializer> {
    /// Create a saver with the default configuration
    pub fn new(kv: Arc<dyn KeyValueStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self::build(kv, blobs, CheckpointStoreConfig::default(), JsonSerializer::new())
    }

    /// Create a saver with a custom configuration
    pub fn with_config(
        kv: Arc<dyn KeyValueStore>,
        blobs: Arc<dyn BlobStore>,
        config: CheckpointStoreConfig,
    ) -> Result<Self> {
        Self::with_serializer(kv, blobs, config, JsonSerializer::new())
    }

    /// Create a saver over fresh in-memory backends
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryKeyValueStore::new()),
            Arc::new(InMemoryBlobStore::new()),
        )
    }
}

impl<S: SerializerProtocol> TieredCheckpointSaver<S> {
    /// Create a saver with a custom configuration and state serializer
    pub fn with_serializer(
        kv: Arc<dyn KeyValueStore>,
        blobs: Arc<dyn BlobStore>,
        config: CheckpointStoreConfig,
        serde: S,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(kv, blobs, config, serde))
    }

    fn build(
        kv: Arc<dyn KeyValueStore>,
        blobs: Arc<dyn BlobStore>,
        config: CheckpointStoreConfig,
        serde: S,
    ) -> Self {
        Self {
            index: MetadataIndex::new(kv, config.retry.clone()),
            blobs: BlobOffload::new(blobs, config.retry.clone(), config.blob_prefix.clone()),
            serde: Arc::new(serde),
            config,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &CheckpointStoreConfig {
        &self.config
    }

    /// Move the planned segments to blob storage, keep the rest inline
    async fn tier(&self, thread_id: &str, encoded: Vec<TypedBytes>) -> Result<Vec<Segment>> {
        let sizes: Vec<usize> = encoded.iter().map(TypedBytes::len).collect();
        let offload = plan_offload(
            &sizes,
            self.config.inline_threshold_bytes,
            self.config.max_item_bytes,
        );

        let mut segments = Vec::with_capacity(encoded.len());
        for (position, bytes) in encoded.into_iter().enumerate() {
            if offload.contains(&position) {
                segments.push(self.blobs.offload(thread_id, bytes).await?);
            } else {
                segments.push(Segment::inline(bytes));
            }
        }
        Ok(segments)
    }

    async fn decode_segment<T: serde::de::DeserializeOwned>(&self, segment: &Segment) -> Result<T> {
        let bytes = self.blobs.load(segment).await?;
        self.serde.loads_typed(&bytes)
    }

    async fn load_metadata(&self, record: &CheckpointRecord) -> Result<CheckpointMetadata> {
        self.decode_segment(&record.metadata).await
    }

    /// Turn a stored record into a tuple, attaching its pending writes
    async fn load_tuple(
        &self,
        thread_id: &str,
        record: CheckpointRecord,
        metadata: Option<CheckpointMetadata>,
    ) -> Result<CheckpointTuple> {
        let mut checkpoint: Checkpoint = self.decode_segment(&record.checkpoint).await?;
        for (channel, segment) in &record.channels {
            let value: Value = self.decode_segment(segment).await?;
            checkpoint.channel_values.insert(channel.clone(), value);
        }

        let metadata = match metadata {
            Some(metadata) => metadata,
            None => self.load_metadata(&record).await?,
        };

        let pending_writes = self
            .load_writes(thread_id, &record.checkpoint_ns, &record.checkpoint_id)
            .await?;

        let config = CheckpointConfig::new(thread_id)
            .with_checkpoint_ns(record.checkpoint_ns.clone())
            .with_checkpoint_id(record.checkpoint_id);
        let parent_config = record.parent_checkpoint_id.map(|parent| {
            CheckpointConfig::new(thread_id)
                .with_checkpoint_ns(record.checkpoint_ns)
                .with_checkpoint_id(parent)
        });

        Ok(CheckpointTuple {
            config,
            checkpoint,
            metadata,
            parent_config,
            pending_writes,
        })
    }

    async fn load_writes(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
    ) -> Result<Vec<PendingWrite>> {
        let records = self
            .index
            .writes_for(thread_id, checkpoint_ns, checkpoint_id, self.config.list_page_size)
            .await?;

        let mut buffer = PendingWrites::new();
        for record in records {
            let value: Value = self.decode_segment(&record.value).await?;
            buffer.insert(PendingWrite {
                task_id: record.task_id,
                channel: record.channel,
                value,
                index: record.index,
            });
        }
        Ok(buffer.into_vec())
    }

    /// Fetch one backend page of history, returning matching tuples and
    /// whether more pages may follow
    async fn list_page(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        cursor: &mut ListCursor,
        filter: &BTreeMap<String, Value>,
    ) -> Result<(Vec<CheckpointTuple>, bool)> {
        let page_limit = cursor.page_limit(self.config.list_page_size);
        let records = self
            .index
            .checkpoint_page(thread_id, checkpoint_ns, cursor.position(), page_limit)
            .await?;
        let more = records.len() == page_limit;

        let mut tuples = Vec::with_capacity(records.len());
        for record in records {
            if cursor.is_exhausted() {
                break;
            }
            let checkpoint_id = record.checkpoint_id.clone();
            let metadata = self.load_metadata(&record).await?;
            if !metadata.matches(filter) {
                cursor.skip(&checkpoint_id);
                continue;
            }
            tuples.push(self.load_tuple(thread_id, record, Some(metadata)).await?);
            cursor.advance(&checkpoint_id);
        }
        Ok((tuples, more))
    }
}

fn require_thread(config: &CheckpointConfig) -> Result<&str> {
    if config.thread_id.is_empty() {
        return Err(CheckpointError::Invalid("thread_id must not be empty".into()));
    }
    Ok(&config.thread_id)
}

#[async_trait]
impl<S: SerializerProtocol + 'static> CheckpointSaver for TieredCheckpointSaver<S> {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<CheckpointTuple> {
        let thread_id = require_thread(config)?;
        let ns = &config.checkpoint_ns;

        let record = match &config.checkpoint_id {
            Some(checkpoint_id) => self.index.get_checkpoint(thread_id, ns, checkpoint_id).await?,
            None => self.index.latest_checkpoint(thread_id, ns).await?,
        };

        let Some(record) = record else {
            return Err(CheckpointError::NotFound(format!(
                "thread={} ns={:?} checkpoint={}",
                thread_id,
                ns,
                config.checkpoint_id.as_deref().unwrap_or("latest")
            )));
        };

        debug!(
            thread_id,
            checkpoint_ns = %ns,
            checkpoint_id = %record.checkpoint_id,
            "Loading checkpoint"
        );
        self.load_tuple(thread_id, record, None).await
    }

    async fn list(&self, config: &CheckpointConfig, options: ListOptions) -> Result<CheckpointStream> {
        let thread_id = require_thread(config)?.to_string();
        if let Some(before) = &options.before {
            validate_checkpoint_id(before)?;
        }

        let this = self.clone();
        let checkpoint_ns = config.checkpoint_ns.clone();
        let ListOptions {
            before,
            limit,
            filter,
        } = options;

        let stream = async_stream::stream! {
            let mut cursor = ListCursor::new(before, limit);
            while !cursor.is_exhausted() {
                match this.list_page(&thread_id, &checkpoint_ns, &mut cursor, &filter).await {
                    Ok((tuples, more)) => {
                        for tuple in tuples {
                            yield Ok(tuple);
                        }
                        if !more {
                            break;
                        }
                    }
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        mut checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointConfig> {
        let thread_id = require_thread(config)?;
        let checkpoint_ns = config.checkpoint_ns.clone();
        validate_checkpoint_id(&checkpoint.id)?;
        let parent_checkpoint_id = config.checkpoint_id.clone();
        if let Some(parent) = &parent_checkpoint_id {
            validate_checkpoint_id(parent)?;
            if *parent == checkpoint.id {
                return Err(CheckpointError::Invalid(format!(
                    "checkpoint {} cannot be its own parent",
                    parent
                )));
            }
        }

        let channel_values = std::mem::take(&mut checkpoint.channel_values);
        let mut encoded = Vec::with_capacity(channel_values.len() + 2);
        encoded.push(self.serde.dumps_typed(&checkpoint)?);
        encoded.push(self.serde.dumps_typed(&metadata)?);
        for value in channel_values.values() {
            encoded.push(self.serde.dumps_typed(value)?);
        }

        let mut segments = self.tier(thread_id, encoded).await?.into_iter();
        let (Some(body), Some(metadata_segment)) = (segments.next(), segments.next()) else {
            return Err(CheckpointError::Invalid("checkpoint encoding produced no segments".into()));
        };
        let channels: BTreeMap<String, Segment> = channel_values.into_keys().zip(segments).collect();

        let fingerprint = CheckpointRecord::compute_fingerprint(
            parent_checkpoint_id.as_deref(),
            &body,
            &metadata_segment,
            &channels,
        );
        let record = CheckpointRecord {
            checkpoint_id: checkpoint.id.clone(),
            checkpoint_ns: checkpoint_ns.clone(),
            parent_checkpoint_id,
            checkpoint: body,
            metadata: metadata_segment,
            channels,
            fingerprint,
        };

        let offloaded = record.pointers().len();
        match self.index.insert_checkpoint(thread_id, &record).await? {
            InsertOutcome::Created => debug!(
                thread_id,
                checkpoint_ns = %checkpoint_ns,
                checkpoint_id = %checkpoint.id,
                offloaded,
                "Stored checkpoint"
            ),
            InsertOutcome::Unchanged => debug!(
                thread_id,
                checkpoint_ns = %checkpoint_ns,
                checkpoint_id = %checkpoint.id,
                "Checkpoint retry matched stored content"
            ),
        }

        Ok(CheckpointConfig::new(thread_id)
            .with_checkpoint_ns(checkpoint_ns)
            .with_checkpoint_id(checkpoint.id))
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, Value)>,
        task_id: &str,
    ) -> Result<()> {
        let thread_id = require_thread(config)?;
        let Some(checkpoint_id) = config.checkpoint_id.as_deref() else {
            return Err(CheckpointError::Invalid(
                "put_writes requires a checkpoint_id".into(),
            ));
        };
        validate_checkpoint_id(checkpoint_id)?;
        let checkpoint_ns = &config.checkpoint_ns;

        let buffer = PendingWrites::from_task(task_id, writes);
        let count = buffer.len();

        try_join_all(buffer.into_vec().into_iter().map(|write| async move {
            let encoded = self.serde.dumps_typed(&write.value)?;
            let mut value = self.tier(thread_id, vec![encoded]).await?;
            let Some(value) = value.pop() else {
                return Err(CheckpointError::Invalid("write encoding produced no segment".into()));
            };
            let record = WriteRecord {
                task_id: write.task_id,
                channel: write.channel,
                index: write.index,
                value,
            };
            self.index
                .put_write(thread_id, checkpoint_ns, checkpoint_id, &record)
                .await
        }))
        .await?;

        debug!(
            thread_id,
            checkpoint_ns = %checkpoint_ns,
            checkpoint_id,
            task_id,
            count,
            "Stored pending writes"
        );
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        if thread_id.is_empty() {
            return Err(CheckpointError::Invalid("thread_id must not be empty".into()));
        }

        let entries = self
            .index
            .scan_thread(thread_id, self.config.list_page_size)
            .await?;

        // Blobs go first: a retry after a partial failure still finds the
        // records that point at the remaining ones.
        let locations: BTreeSet<String> = entries
            .iter()
            .flat_map(|entry| entry.pointers.iter().map(|pointer| pointer.location.clone()))
            .collect();
        for location in &locations {
            self.blobs.delete(location).await?;
        }

        let keys: Vec<ItemKey> = entries.into_iter().map(|entry| entry.key).collect();
        self.index
            .delete_keys(&keys, self.config.delete_batch_size)
            .await?;

        // Uploads from puts that never wrote their record
        self.blobs.delete_thread_blobs(thread_id).await?;

        info!(
            thread_id,
            records = keys.len(),
            blobs = locations.len(),
            "Deleted thread"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSource;
    use crate::retry::RetryPolicy;
    use crate::writes::ERROR;
    use futures::StreamExt;
    use serde_json::json;

    struct Harness {
        kv: InMemoryKeyValueStore,
        blobs: InMemoryBlobStore,
        saver: TieredCheckpointSaver,
    }

    fn harness(config: CheckpointStoreConfig) -> Harness {
        let kv = InMemoryKeyValueStore::with_max_item_bytes(config.max_item_bytes);
        let blobs = InMemoryBlobStore::new();
        let config = config.with_retry(
            RetryPolicy::new(3)
                .with_initial_interval(0.001)
                .with_jitter(false),
        );
        let saver =
            TieredCheckpointSaver::with_config(Arc::new(kv.clone()), Arc::new(blobs.clone()), config)
                .unwrap();
        Harness { kv, blobs, saver }
    }

    fn checkpoint(values: &[(&str, Value)]) -> Checkpoint {
        let values = values
            .iter()
            .map(|(channel, value)| (channel.to_string(), value.clone()))
            .collect();
        Checkpoint::new(values, BTreeMap::new(), BTreeMap::new())
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let h = harness(CheckpointStoreConfig::default());
        let thread = CheckpointConfig::new("t1");
        let cp = checkpoint(&[("messages", json!(["hi"])), ("count", json!(3))]);
        let metadata = CheckpointMetadata::new()
            .with_source(CheckpointSource::Input)
            .with_step(-1)
            .with_extra("user", json!("ada"));

        let stored = h.saver.put(&thread, cp.clone(), metadata.clone()).await.unwrap();
        assert_eq!(stored.checkpoint_id.as_deref(), Some(cp.id.as_str()));

        let tuple = h.saver.get_tuple(&stored).await.unwrap();
        assert_eq!(tuple.checkpoint, cp);
        assert_eq!(tuple.metadata, metadata);
        assert_eq!(tuple.config, stored);
        assert!(tuple.parent_config.is_none());
        assert!(tuple.pending_writes.is_empty());
        assert_eq!(h.blobs.blob_count().await, 0);
    }

    #[tokio::test]
    async fn test_get_of_missing_checkpoint_is_not_found() {
        let h = harness(CheckpointStoreConfig::default());
        let err = h.saver.get(&CheckpointConfig::new("nobody")).await.unwrap_err();
        assert!(err.is_not_found());

        let err = h
            .saver
            .get_tuple(&CheckpointConfig::new("nobody").with_checkpoint_id("c1"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_invalid_inputs_are_rejected() {
        let h = harness(CheckpointStoreConfig::default());

        let err = h
            .saver
            .put(&CheckpointConfig::new(""), Checkpoint::empty(), CheckpointMetadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Invalid(_)));

        let bad_id = Checkpoint::with_id("a#b".into(), BTreeMap::new(), BTreeMap::new(), BTreeMap::new());
        let err = h
            .saver
            .put(&CheckpointConfig::new("t"), bad_id, CheckpointMetadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Invalid(_)));

        let err = h
            .saver
            .put_writes(&CheckpointConfig::new("t"), vec![], "task")
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_large_channel_is_offloaded() {
        let config = CheckpointStoreConfig::default()
            .with_inline_threshold(1024)
            .with_max_item_bytes(16 * 1024);
        let h = harness(config);
        let big = json!("x".repeat(64 * 1024));
        let cp = checkpoint(&[("doc", big.clone()), ("small", json!(1))]);

        let stored = h
            .saver
            .put(&CheckpointConfig::new("t"), cp.clone(), CheckpointMetadata::new())
            .await
            .unwrap();
        assert_eq!(h.blobs.blob_count().await, 1);

        let tuple = h.saver.get_tuple(&stored).await.unwrap();
        assert_eq!(tuple.checkpoint.channel_values.get("doc"), Some(&big));
        assert_eq!(tuple.checkpoint, cp);
    }

    #[tokio::test]
    async fn test_pending_writes_are_attached_in_order() {
        let h = harness(CheckpointStoreConfig::default());
        let stored = h
            .saver
            .put(&CheckpointConfig::new("t"), Checkpoint::empty(), CheckpointMetadata::new())
            .await
            .unwrap();

        h.saver
            .put_writes(
                &stored,
                vec![("a".into(), json!(1)), (ERROR.into(), json!("boom"))],
                "task-2",
            )
            .await
            .unwrap();
        h.saver
            .put_writes(&stored, vec![("b".into(), json!(2))], "task-1")
            .await
            .unwrap();

        let writes = h.saver.get_tuple(&stored).await.unwrap().pending_writes;
        let keys: Vec<(String, i64, String)> = writes
            .into_iter()
            .map(|w| (w.task_id, w.index, w.channel))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("task-1".into(), 0, "b".into()),
                ("task-2".into(), -1, ERROR.into()),
                ("task-2".into(), 0, "a".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_list_filter_and_limit() {
        let h = harness(CheckpointStoreConfig::default().with_list_page_size(2));
        let mut config = CheckpointConfig::new("t");
        for step in 0..6 {
            let source = if step % 2 == 0 {
                CheckpointSource::Loop
            } else {
                CheckpointSource::Update
            };
            config = h
                .saver
                .put(
                    &config,
                    Checkpoint::empty(),
                    CheckpointMetadata::new().with_source(source).with_step(step),
                )
                .await
                .unwrap();
        }

        let options = ListOptions::new().filter("source", json!("loop")).limit(2);
        let steps: Vec<Option<i32>> = h
            .saver
            .list(&CheckpointConfig::new("t"), options)
            .await
            .unwrap()
            .map(|tuple| tuple.unwrap().metadata.step)
            .collect()
            .await;
        assert_eq!(steps, vec![Some(4), Some(2)]);
    }

    #[tokio::test]
    async fn test_delete_thread_removes_records_and_blobs() {
        let config = CheckpointStoreConfig::default()
            .with_inline_threshold(256)
            .with_delete_batch_size(2);
        let h = harness(config);
        let thread = CheckpointConfig::new("t");

        let stored = h
            .saver
            .put(&thread, checkpoint(&[("doc", json!("y".repeat(512)))]), CheckpointMetadata::new())
            .await
            .unwrap();
        h.saver
            .put_writes(&stored, vec![("doc".into(), json!("z".repeat(512)))], "task")
            .await
            .unwrap();
        assert_eq!(h.blobs.blob_count().await, 2);

        h.saver.delete_thread("t").await.unwrap();
        assert_eq!(h.kv.item_count().await, 0);
        assert_eq!(h.blobs.blob_count().await, 0);
        assert!(h.saver.get_tuple(&thread).await.unwrap_err().is_not_found());

        h.saver.delete_thread("t").await.unwrap();
    }
}
