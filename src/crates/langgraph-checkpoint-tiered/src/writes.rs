//! Pending-writes buffer
//!
//! Writes recorded against a checkpoint are deduplicated by an explicit key,
//! `(task_id, index, channel)`. Inserting an existing key replaces its value,
//! so a task that re-submits its writes after a retry overwrites rather than
//! duplicates. Iteration follows `(task_id, index)` for deterministic replay.

use crate::checkpoint::PendingWrite;
use serde_json::Value;
use std::collections::BTreeMap;

/// Channel carrying a task error
pub const ERROR: &str = "__error__";
/// Channel carrying scheduled sends
pub const SCHEDULED: &str = "__scheduled__";
/// Channel carrying interrupts
pub const INTERRUPT: &str = "__interrupt__";
/// Channel carrying resume values
pub const RESUME: &str = "__resume__";

/// Fixed index of a special channel, independent of submission position
pub fn special_index(channel: &str) -> Option<i64> {
    match channel {
        ERROR => Some(-1),
        SCHEDULED => Some(-2),
        INTERRUPT => Some(-3),
        RESUME => Some(-4),
        _ => None,
    }
}

/// Index a write is stored under: the special-channel index if any,
/// otherwise its position in the submitted sequence
pub fn write_index(channel: &str, position: usize) -> i64 {
    special_index(channel).unwrap_or_else(|| i64::try_from(position).unwrap_or(i64::MAX))
}

/// Dedup key of a pending write
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WriteKey {
    pub task_id: String,
    pub index: i64,
    pub channel: String,
}

/// Ordered, deduplicated set of pending writes for one checkpoint
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingWrites {
    writes: BTreeMap<WriteKey, Value>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the buffer for one task's submission, assigning indices
    pub fn from_task(task_id: &str, writes: Vec<(String, Value)>) -> Self {
        let mut buffer = Self::new();
        for (position, (channel, value)) in writes.into_iter().enumerate() {
            let index = write_index(&channel, position);
            buffer.insert(PendingWrite {
                task_id: task_id.to_string(),
                channel,
                value,
                index,
            });
        }
        buffer
    }

    /// Insert a write; returns the value it replaced, if any
    pub fn insert(&mut self, write: PendingWrite) -> Option<Value> {
        let key = WriteKey {
            task_id: write.task_id,
            index: write.index,
            channel: write.channel,
        };
        self.writes.insert(key, write.value)
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Writes ordered by `(task_id, index)`
    pub fn iter(&self) -> impl Iterator<Item = PendingWrite> + '_ {
        self.writes.iter().map(|(key, value)| PendingWrite {
            task_id: key.task_id.clone(),
            channel: key.channel.clone(),
            value: value.clone(),
            index: key.index,
        })
    }

    pub fn into_vec(self) -> Vec<PendingWrite> {
        self.writes
            .into_iter()
            .map(|(key, value)| PendingWrite {
                task_id: key.task_id,
                channel: key.channel,
                value,
                index: key.index,
            })
            .collect()
    }
}

impl FromIterator<PendingWrite> for PendingWrites {
    fn from_iter<I: IntoIterator<Item = PendingWrite>>(iter: I) -> Self {
        let mut buffer = Self::new();
        for write in iter {
            buffer.insert(write);
        }
        buffer
    }
}
