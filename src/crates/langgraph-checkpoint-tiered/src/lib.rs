//! # langgraph-checkpoint-tiered - Tiered Checkpoint Persistence
//!
//! **Checkpoint storage over a sorted key-value store, with oversized payloads
//! offloaded to a content-addressed blob store.** An execution engine hands the
//! store a snapshot after every step; the store keeps a versioned, branchable
//! history per thread and gives it back for resumption, replay and inspection.
//!
//! ## Overview
//!
//! Key-value backends cap the size of a single item (400 KiB on DynamoDB), while
//! execution state grows without bound. This crate splits every checkpoint into
//! segments and decides per segment, by encoded size alone, whether it lives
//! inline in the record or behind a [`BlobPointer`].
//!
//! - **Write-once history** - Records are committed with a conditional write;
//!   a conflicting writer gets [`CheckpointError::AlreadyExists`], a retry of
//!   the same content succeeds
//! - **Range-ordered listing** - Sort keys encode `(namespace, checkpoint_id)`,
//!   so history is read newest first straight from the backend
//! - **At-least-once writes** - Pending writes are keyed by
//!   `(task_id, channel, index)` and overwrite on resubmission
//! - **Garbage-safe blobs** - Blobs are scoped per thread, so deleting one
//!   thread never strands another
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ TieredCheckpointSaver  (CheckpointSaver)                     │
//! │   put / get_tuple / list / put_writes / delete_thread        │
//! └───────┬──────────────────────┬─────────────────────┬─────────┘
//!         │ SerializerProtocol   │                     │
//!         ▼                      ▼                     ▼
//! ┌──────────────┐      ┌─────────────────┐   ┌─────────────────┐
//! │ JSON/bincode │      │ MetadataIndex   │   │ BlobOffload     │
//! │ codecs       │      │ keys, records,  │   │ hash, scope,    │
//! └──────────────┘      │ paging          │   │ verify          │
//!                       └────────┬────────┘   └────────┬────────┘
//!                                ▼  with_retry         ▼
//!                       ┌─────────────────┐   ┌─────────────────┐
//!                       │ KeyValueStore   │   │ BlobStore       │
//!                       └─────────────────┘   └─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use langgraph_checkpoint_tiered::{
//!     Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointSource,
//!     TieredCheckpointSaver,
//! };
//! use serde_json::json;
//! use std::collections::BTreeMap;
//!
//! # #[tokio::main]
//! # async fn main() -> langgraph_checkpoint_tiered::Result<()> {
//! let saver = TieredCheckpointSaver::in_memory();
//! let thread = CheckpointConfig::new("conversation-42");
//!
//! let mut values = BTreeMap::new();
//! values.insert("messages".to_string(), json!(["hello"]));
//! let checkpoint = Checkpoint::new(values, BTreeMap::new(), BTreeMap::new());
//! let metadata = CheckpointMetadata::new().with_source(CheckpointSource::Input).with_step(-1);
//!
//! let stored = saver.put(&thread, checkpoint, metadata).await?;
//! saver
//!     .put_writes(&stored, vec![("messages".to_string(), json!("hi there"))], "task-1")
//!     .await?;
//!
//! let latest = saver.get_tuple(&thread).await?;
//! assert_eq!(latest.config, stored);
//! assert_eq!(latest.pending_writes.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! The store depends only on the [`KeyValueStore`] and [`BlobStore`] traits.
//! [`InMemoryKeyValueStore`] and [`InMemoryBlobStore`] implement them for
//! development and tests; production deployments implement them over their
//! cloud SDK of choice and map SDK errors onto [`BackendError`].
//!
//! ## Configuration
//!
//! [`CheckpointStoreConfig`] holds thresholds, page sizes and the
//! [`RetryPolicy`]. It loads from TOML:
//!
//! ```rust
//! use langgraph_checkpoint_tiered::CheckpointStoreConfig;
//!
//! let config = CheckpointStoreConfig::from_toml_str("list_page_size = 20").unwrap();
//! assert_eq!(config.list_page_size, 20);
//! assert_eq!(config.inline_threshold_bytes, 350 * 1024);
//! ```

pub mod backend;
pub mod blob;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod id;
pub mod index;
pub mod pagination;
pub mod retry;
pub mod saver;
pub mod serializer;
pub mod traits;
pub mod writes;

// Re-export main types
pub use backend::{BlobStore, InMemoryBlobStore, InMemoryKeyValueStore, KeyValueStore};
pub use blob::BlobPointer;
pub use checkpoint::{
    ChannelVersion, ChannelVersions, Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata,
    CheckpointSource, CheckpointTuple, PendingWrite,
};
pub use config::CheckpointStoreConfig;
pub use error::{BackendError, CheckpointError, Result};
pub use retry::RetryPolicy;
pub use saver::TieredCheckpointSaver;
pub use serializer::{
    BincodeSerializer, Format, JsonSerializer, SerializerProtocol, TypedBytes, VersionedSerializer,
};
pub use traits::{CheckpointSaver, CheckpointStream, ListOptions};
pub use writes::PendingWrites;
