//! Core checkpoint data structures
//!
//! This module defines the types the execution engine hands to the store and
//! gets back from it: **[`Checkpoint`]**, **[`CheckpointMetadata`]**,
//! **[`CheckpointConfig`]**, **[`CheckpointTuple`]** and **[`PendingWrite`]**.
//!
//! # Identity
//!
//! Every stored checkpoint is addressed by `(thread_id, checkpoint_ns,
//! checkpoint_id)`. The namespace is `""` for the root graph and a
//! sub-graph path otherwise. Checkpoint ids are lexicographically sortable
//! (see [`crate::id`]), so "latest" is simply the greatest id.
//!
//! ```text
//! thread "user-123"
//! ├── ns ""            c1 ◄── c2 ◄── c3
//! │                           ▲
//! │                           └──── c4   (branch: resumed from c2)
//! └── ns "agent:7"     c5 ◄── c6
//! ```
//!
//! Parent links are plain id references, so the history is a tree per
//! namespace. Merges are not representable.
//!
//! # Maps
//!
//! All maps are `BTreeMap` so that encoding the same checkpoint twice yields
//! the same bytes. Idempotent retries of `put` depend on that.
//!
//! # Example
//!
//! ```rust
//! use langgraph_checkpoint_tiered::{Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSource};
//! use serde_json::json;
//! use std::collections::BTreeMap;
//!
//! let mut values = BTreeMap::new();
//! values.insert("messages".to_string(), json!(["hello"]));
//!
//! let checkpoint = Checkpoint::new(values, BTreeMap::new(), BTreeMap::new());
//! let metadata = CheckpointMetadata::new()
//!     .with_source(CheckpointSource::Input)
//!     .with_step(-1);
//! let config = CheckpointConfig::new("user-123");
//!
//! assert_eq!(config.checkpoint_ns, "");
//! assert!(checkpoint.channel_values.contains_key("messages"));
//! assert_eq!(metadata.step, Some(-1));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Checkpoint ID type
pub type CheckpointId = String;

/// Channel version type - can be int, float, or string
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ChannelVersion {
    Int(i64),
    Float(f64),
    String(String),
}

/// Mapping from channel name to version
pub type ChannelVersions = BTreeMap<String, ChannelVersion>;

/// Metadata source type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Checkpoint created from an input to invoke/stream/batch
    Input,
    /// Checkpoint created from inside the execution loop
    Loop,
    /// Checkpoint created from a manual state update
    Update,
    /// Checkpoint created as a copy of another checkpoint
    Fork,
}

/// Metadata associated with a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointMetadata {
    /// The source of the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,

    /// The step number of the checkpoint
    /// -1 for the first "input" checkpoint
    /// 0 for the first "loop" checkpoint
    /// n for the nth checkpoint afterwards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i32>,

    /// Summary of the channel writes applied in this step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writes: Option<Value>,

    /// The IDs of the parent checkpoints
    /// Mapping from checkpoint namespace to checkpoint ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parents: Option<BTreeMap<String, CheckpointId>>,

    /// Additional custom metadata
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl CheckpointMetadata {
    /// Create a new checkpoint metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source
    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the step number
    pub fn with_step(mut self, step: i32) -> Self {
        self.step = Some(step);
        self
    }

    /// Set the write summary
    pub fn with_writes(mut self, writes: Value) -> Self {
        self.writes = Some(writes);
        self
    }

    /// Set parent checkpoints
    pub fn with_parents(mut self, parents: BTreeMap<String, CheckpointId>) -> Self {
        self.parents = Some(parents);
        self
    }

    /// Add custom metadata
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Whether every `(key, value)` in `filter` equals the metadata field of
    /// the same name. Keys address the serialized form, so `"source"`,
    /// `"step"` and custom `extra` keys all work.
    pub fn matches(&self, filter: &BTreeMap<String, Value>) -> bool {
        if filter.is_empty() {
            return true;
        }
        let Ok(Value::Object(fields)) = serde_json::to_value(self) else {
            return false;
        };
        filter
            .iter()
            .all(|(key, expected)| fields.get(key) == Some(expected))
    }
}

/// State snapshot at a given point in time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// The version of the checkpoint format (currently 1)
    pub v: i32,

    /// The ID of the checkpoint (unique and monotonically increasing)
    pub id: CheckpointId,

    /// The timestamp of the checkpoint
    pub ts: DateTime<Utc>,

    /// The values of the channels at the time of the checkpoint
    pub channel_values: BTreeMap<String, Value>,

    /// The versions of the channels at the time of the checkpoint
    pub channel_versions: ChannelVersions,

    /// Map from task name to the channel versions it has seen
    pub versions_seen: BTreeMap<String, ChannelVersions>,

    /// The channels that were updated in this checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_channels: Option<Vec<String>>,
}

impl Checkpoint {
    /// Current checkpoint format version
    pub const CURRENT_VERSION: i32 = 1;

    /// Create a checkpoint with a freshly generated id
    pub fn new(
        channel_values: BTreeMap<String, Value>,
        channel_versions: ChannelVersions,
        versions_seen: BTreeMap<String, ChannelVersions>,
    ) -> Self {
        Self::with_id(
            crate::id::generate(),
            channel_values,
            channel_versions,
            versions_seen,
        )
    }

    /// Create a checkpoint with a caller-supplied id
    pub fn with_id(
        id: CheckpointId,
        channel_values: BTreeMap<String, Value>,
        channel_versions: ChannelVersions,
        versions_seen: BTreeMap<String, ChannelVersions>,
    ) -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            id,
            ts: Utc::now(),
            channel_values,
            channel_versions,
            versions_seen,
            updated_channels: None,
        }
    }

    /// Create an empty checkpoint
    pub fn empty() -> Self {
        Self::new(BTreeMap::new(), BTreeMap::new(), BTreeMap::new())
    }

    /// Set the updated channels
    pub fn with_updated_channels(mut self, channels: Vec<String>) -> Self {
        self.updated_channels = Some(channels);
        self
    }
}

/// Address of a checkpoint, or of the latest checkpoint when
/// `checkpoint_id` is `None`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CheckpointConfig {
    /// Thread ID grouping all checkpoints of one run
    pub thread_id: String,

    /// Checkpoint namespace; empty for the root graph
    #[serde(default)]
    pub checkpoint_ns: String,

    /// Specific checkpoint ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,
}

impl CheckpointConfig {
    /// Address the latest checkpoint of the root namespace of `thread_id`
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: String::new(),
            checkpoint_id: None,
        }
    }

    /// Set the checkpoint ID
    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    /// Set the checkpoint namespace
    pub fn with_checkpoint_ns(mut self, checkpoint_ns: impl Into<String>) -> Self {
        self.checkpoint_ns = checkpoint_ns.into();
        self
    }
}

/// A channel write recorded against a checkpoint before the next one commits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingWrite {
    /// Task that produced the write
    pub task_id: String,
    /// Target channel
    pub channel: String,
    /// Written value
    pub value: Value,
    /// Position of the write within the task's submission, or a fixed
    /// negative index for special channels
    pub index: i64,
}

/// A tuple containing a checkpoint and its associated data
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointTuple {
    /// Full address of this checkpoint
    pub config: CheckpointConfig,

    /// The checkpoint itself
    pub checkpoint: Checkpoint,

    /// Metadata associated with the checkpoint
    pub metadata: CheckpointMetadata,

    /// Address of the parent checkpoint (if any)
    pub parent_config: Option<CheckpointConfig>,

    /// Writes recorded against this checkpoint, ordered by `(task_id, index)`
    pub pending_writes: Vec<PendingWrite>,
}

impl CheckpointTuple {
    /// Id of the parent checkpoint, if any
    pub fn parent_checkpoint_id(&self) -> Option<&str> {
        self.parent_config
            .as_ref()
            .and_then(|parent| parent.checkpoint_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checkpoint_creation() {
        let checkpoint = Checkpoint::empty();
        assert_eq!(checkpoint.v, Checkpoint::CURRENT_VERSION);
        assert!(checkpoint.channel_values.is_empty());
        assert!(checkpoint.channel_versions.is_empty());
        assert!(checkpoint.versions_seen.is_empty());
    }

    #[test]
    fn test_new_checkpoints_sort_by_creation() {
        let first = Checkpoint::empty();
        let second = Checkpoint::empty();
        assert!(first.id < second.id);
    }

    #[test]
    fn test_checkpoint_metadata() {
        let metadata = CheckpointMetadata::new()
            .with_source(CheckpointSource::Input)
            .with_step(-1)
            .with_extra("key", json!("value"));

        assert_eq!(metadata.source, Some(CheckpointSource::Input));
        assert_eq!(metadata.step, Some(-1));
        assert_eq!(metadata.extra.get("key"), Some(&json!("value")));
    }

    #[test]
    fn test_metadata_filter_matching() {
        let metadata = CheckpointMetadata::new()
            .with_source(CheckpointSource::Loop)
            .with_step(3)
            .with_extra("approved", json!(true));

        let mut filter = BTreeMap::new();
        assert!(metadata.matches(&filter));

        filter.insert("source".to_string(), json!("loop"));
        filter.insert("approved".to_string(), json!(true));
        assert!(metadata.matches(&filter));

        filter.insert("step".to_string(), json!(4));
        assert!(!metadata.matches(&filter));
    }

    #[test]
    fn test_checkpoint_config() {
        let config = CheckpointConfig::new("thread-1")
            .with_checkpoint_ns("child:1")
            .with_checkpoint_id("checkpoint-1");

        assert_eq!(config.thread_id, "thread-1");
        assert_eq!(config.checkpoint_ns, "child:1");
        assert_eq!(config.checkpoint_id, Some("checkpoint-1".to_string()));
    }

    #[test]
    fn test_channel_version_untagged_json() {
        let versions: ChannelVersions = serde_json::from_value(json!({
            "a": 3,
            "b": 1.5,
            "c": "v7"
        }))
        .unwrap();

        assert_eq!(versions["a"], ChannelVersion::Int(3));
        assert_eq!(versions["b"], ChannelVersion::Float(1.5));
        assert_eq!(versions["c"], ChannelVersion::String("v7".to_string()));
    }
}
