//! Checkpoint storage trait
//!
//! This module defines the **[`CheckpointSaver`]** trait, the interface an
//! execution engine uses to persist and restore its state. The crate ships
//! one implementation, [`TieredCheckpointSaver`](crate::TieredCheckpointSaver),
//! which stores records in a sorted key-value store and moves oversized
//! payloads to a blob store.
//!
//! # Operations
//!
//! | Operation | Purpose |
//! |-----------|---------|
//! | [`put`](CheckpointSaver::put) | Commit a new checkpoint (write-once per id) |
//! | [`get_tuple`](CheckpointSaver::get_tuple) | Load a checkpoint by id, or the latest one |
//! | [`list`](CheckpointSaver::list) | Stream history newest first |
//! | [`put_writes`](CheckpointSaver::put_writes) | Record a task's channel writes against a checkpoint |
//! | [`delete_thread`](CheckpointSaver::delete_thread) | Remove every record and blob of a thread |
//!
//! # Lifecycle
//!
//! ```text
//! engine step N                                   engine step N+1
//! ─────────────────────────────────────────────   ───────────────────────
//! put(parent=cN-1) ──► cN
//!                      put_writes(cN, task a) ─┐
//!                      put_writes(cN, task b) ─┴► put(parent=cN) ──► cN+1
//! ```
//!
//! After a crash the engine calls `get_tuple` for the latest checkpoint; the
//! pending writes attached to it tell it which tasks already finished.

use crate::checkpoint::{Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata, CheckpointTuple};
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::Stream;
use serde_json::Value;
use std::collections::BTreeMap;
use std::pin::Pin;

/// Type alias for async stream of checkpoint tuples
pub type CheckpointStream = Pin<Box<dyn Stream<Item = Result<CheckpointTuple>> + Send + 'static>>;

/// Options for [`CheckpointSaver::list`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOptions {
    /// Exclusive upper bound: only checkpoints with a smaller id are listed
    pub before: Option<CheckpointId>,

    /// Maximum number of tuples to yield
    pub limit: Option<usize>,

    /// Exact-match filter on metadata fields (`source`, `step`, extra keys)
    pub filter: BTreeMap<String, Value>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// List only checkpoints older than `checkpoint_id`
    pub fn before(mut self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        self.before = Some(checkpoint_id.into());
        self
    }

    /// Stop after `limit` tuples
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Require metadata field `key` to equal `value`
    pub fn filter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.filter.insert(key.into(), value);
        self
    }
}

/// Core trait for checkpoint storage backends
///
/// Implementations must be thread-safe (`Send + Sync`): one saver is shared
/// by every execution thread of a process, and calls for different threads
/// proceed independently.
///
/// ## Example
///
/// ```rust
/// use langgraph_checkpoint_tiered::{
///     Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, ListOptions,
///     TieredCheckpointSaver,
/// };
/// use futures::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() -> langgraph_checkpoint_tiered::Result<()> {
/// let saver = TieredCheckpointSaver::in_memory();
/// let thread = CheckpointConfig::new("thread-1");
///
/// let first = saver.put(&thread, Checkpoint::empty(), CheckpointMetadata::new()).await?;
/// let second = saver.put(&first, Checkpoint::empty(), CheckpointMetadata::new()).await?;
///
/// let latest = saver.get_tuple(&thread).await?;
/// assert_eq!(latest.config, second);
/// assert_eq!(latest.parent_config, Some(first));
///
/// let history: Vec<_> = saver.list(&thread, ListOptions::new()).await?.collect().await;
/// assert_eq!(history.len(), 2);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch only the checkpoint addressed by `config`
    async fn get(&self, config: &CheckpointConfig) -> Result<Checkpoint> {
        Ok(self.get_tuple(config).await?.checkpoint)
    }

    /// Retrieve a complete checkpoint tuple
    ///
    /// With `checkpoint_id` set, that exact checkpoint is loaded; otherwise
    /// the latest checkpoint of `(thread_id, checkpoint_ns)`. The tuple
    /// carries every pending write recorded against the checkpoint.
    ///
    /// # Errors
    ///
    /// - [`NotFound`](crate::CheckpointError::NotFound) when nothing matches
    /// - [`BlobMissing`](crate::CheckpointError::BlobMissing) when an
    ///   offloaded payload is absent or corrupt
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<CheckpointTuple>;

    /// List checkpoints of `(thread_id, checkpoint_ns)` newest first
    ///
    /// `config.checkpoint_id` is ignored; use [`ListOptions::before`] to
    /// resume below a known id. The stream fetches pages lazily and holds no
    /// server-side state, so it can be dropped and re-created at any time.
    async fn list(&self, config: &CheckpointConfig, options: ListOptions) -> Result<CheckpointStream>;

    /// Commit a checkpoint
    ///
    /// `config.checkpoint_id`, when set, names the parent checkpoint. The
    /// returned config addresses the stored checkpoint and can be passed
    /// straight back as the parent of the next one.
    ///
    /// Committing the same id twice with identical content succeeds, so a
    /// timed-out call may be retried blindly. Different content under an
    /// existing id fails with
    /// [`AlreadyExists`](crate::CheckpointError::AlreadyExists).
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointConfig>;

    /// Record `writes` of `task_id` against `config.checkpoint_id`
    ///
    /// Writes are keyed by `(task_id, channel, index)`; submitting the same
    /// batch again overwrites instead of duplicating.
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, Value)>,
        task_id: &str,
    ) -> Result<()>;

    /// Delete all checkpoints, writes and blobs of `thread_id`
    ///
    /// Not atomic. A call that fails half-way can simply be repeated.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_list_options_builder() {
        let options = ListOptions::new()
            .before("c9")
            .limit(3)
            .filter("source", json!("loop"));

        assert_eq!(options.before.as_deref(), Some("c9"));
        assert_eq!(options.limit, Some(3));
        assert_eq!(options.filter.get("source"), Some(&json!("loop")));
    }

    #[test]
    fn test_default_list_options_are_unbounded() {
        let options = ListOptions::default();
        assert!(options.before.is_none());
        assert!(options.limit.is_none());
        assert!(options.filter.is_empty());
    }
}
