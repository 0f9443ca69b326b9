//! Blob offload for oversized payload segments
//!
//! A record in the key-value store is made of named segments (the checkpoint
//! body, its metadata, one per channel value, one per pending write). Each
//! segment is either stored inline or moved to the [`BlobStore`] and replaced
//! by a [`BlobPointer`]. Whether a segment moves is decided by
//! [`plan_offload`] from encoded sizes alone.
//!
//! Blobs are keyed by the SHA-256 of their bytes inside a per-thread scope:
//! identical payloads of one thread share a blob, and deleting a thread can
//! never remove a blob that another thread still points at.

use crate::backend::{BlobKey, BlobStore};
use crate::error::{CheckpointError, Result};
use crate::retry::{with_retry, RetryPolicy};
use crate::serializer::TypedBytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error};

/// Bytes reserved in a record for keys, names and envelope fields
pub const RECORD_OVERHEAD_BYTES: usize = 4 * 1024;

/// Bytes a pointer costs in place of an offloaded segment
pub const POINTER_COST_BYTES: usize = 512;

/// Lower-case hex SHA-256 of `bytes`
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Reference to an offloaded payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobPointer {
    pub content_hash: String,
    pub size: u64,
    pub location: String,
}

/// Where a segment's bytes live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentBody {
    Inline(Vec<u8>),
    Offloaded(BlobPointer),
}

/// One encoded field of a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Codec tag of the payload bytes
    pub format: String,
    pub body: SegmentBody,
}

impl Segment {
    pub fn inline(bytes: TypedBytes) -> Self {
        Self {
            format: bytes.format,
            body: SegmentBody::Inline(bytes.data),
        }
    }

    /// Hash of the payload regardless of where it lives
    pub fn content_hash(&self) -> String {
        match &self.body {
            SegmentBody::Inline(data) => content_hash(data),
            SegmentBody::Offloaded(pointer) => pointer.content_hash.clone(),
        }
    }

    /// Bytes this segment occupies inside the record
    pub fn inline_len(&self) -> usize {
        match &self.body {
            SegmentBody::Inline(data) => data.len(),
            SegmentBody::Offloaded(_) => 0,
        }
    }

    pub fn pointer(&self) -> Option<&BlobPointer> {
        match &self.body {
            SegmentBody::Inline(_) => None,
            SegmentBody::Offloaded(pointer) => Some(pointer),
        }
    }
}

/// Choose which segments to offload
///
/// Every segment larger than `threshold` is offloaded. If the segments left
/// inline still exceed `max_item_bytes` once record overhead and pointers are
/// accounted for, the largest remaining ones follow until the record fits.
/// Returns indices into `sizes`.
pub fn plan_offload(sizes: &[usize], threshold: usize, max_item_bytes: usize) -> BTreeSet<usize> {
    let mut offload: BTreeSet<usize> = sizes
        .iter()
        .enumerate()
        .filter(|(_, size)| **size > threshold)
        .map(|(index, _)| index)
        .collect();

    let record_size = |offload: &BTreeSet<usize>| -> usize {
        let inline: usize = sizes
            .iter()
            .enumerate()
            .filter(|(index, _)| !offload.contains(index))
            .map(|(_, size)| *size)
            .sum();
        RECORD_OVERHEAD_BYTES + inline + offload.len() * POINTER_COST_BYTES
    };

    // Offloading a segment smaller than its pointer cannot shrink the record.
    let mut remaining: Vec<usize> = (0..sizes.len())
        .filter(|i| !offload.contains(i) && sizes[*i] > POINTER_COST_BYTES)
        .collect();
    remaining.sort_by_key(|index| std::cmp::Reverse(sizes[*index]));

    for index in remaining {
        if record_size(&offload) <= max_item_bytes {
            break;
        }
        offload.insert(index);
    }
    offload
}

/// Adapter over a [`BlobStore`] adding hashing, scoping, retries and
/// integrity checks
#[derive(Clone)]
pub struct BlobOffload {
    store: Arc<dyn BlobStore>,
    retry: RetryPolicy,
    prefix: String,
}

impl BlobOffload {
    pub fn new(store: Arc<dyn BlobStore>, retry: RetryPolicy, prefix: impl Into<String>) -> Self {
        Self {
            store,
            retry,
            prefix: prefix.into(),
        }
    }

    /// Scope under which all blobs of `thread_id` are stored
    pub fn scope_for(&self, thread_id: &str) -> String {
        let thread_hash = content_hash(thread_id.as_bytes());
        format!("{}/{}", self.prefix, &thread_hash[..32])
    }

    /// Upload `bytes` for `thread_id` and return a pointer segment
    pub async fn offload(&self, thread_id: &str, bytes: TypedBytes) -> Result<Segment> {
        let key = BlobKey {
            scope: self.scope_for(thread_id),
            content_hash: content_hash(&bytes.data),
        };
        let size = bytes.data.len() as u64;
        let payload = bytes.data;

        let location = with_retry(&self.retry, "blob_put", || {
            self.store.put(&key, payload.clone())
        })
        .await?;

        debug!(thread_id, location = %location, size, "Offloaded segment to blob store");
        Ok(Segment {
            format: bytes.format,
            body: SegmentBody::Offloaded(BlobPointer {
                content_hash: key.content_hash,
                size,
                location,
            }),
        })
    }

    /// Resolve a segment to its bytes, fetching and verifying offloaded ones
    pub async fn load(&self, segment: &Segment) -> Result<TypedBytes> {
        let data = match &segment.body {
            SegmentBody::Inline(data) => data.clone(),
            SegmentBody::Offloaded(pointer) => self.fetch(pointer).await?,
        };
        Ok(TypedBytes {
            format: segment.format.clone(),
            data,
        })
    }

    async fn fetch(&self, pointer: &BlobPointer) -> Result<Vec<u8>> {
        let fetched = with_retry(&self.retry, "blob_get", || self.store.get(&pointer.location)).await?;

        let Some(data) = fetched else {
            error!(location = %pointer.location, "Referenced blob is missing");
            return Err(CheckpointError::BlobMissing {
                location: pointer.location.clone(),
                reason: "object not found".to_string(),
            });
        };

        if data.len() as u64 != pointer.size || content_hash(&data) != pointer.content_hash {
            error!(
                location = %pointer.location,
                expected_size = pointer.size,
                actual_size = data.len() as u64,
                "Referenced blob failed integrity check"
            );
            return Err(CheckpointError::BlobMissing {
                location: pointer.location.clone(),
                reason: "content does not match pointer".to_string(),
            });
        }
        Ok(data)
    }

    /// Delete the blob at `location`; absent blobs are not an error
    pub async fn delete(&self, location: &str) -> Result<()> {
        with_retry(&self.retry, "blob_delete", || self.store.delete(location)).await
    }

    /// Delete every blob stored for `thread_id`, referenced or not
    pub async fn delete_thread_blobs(&self, thread_id: &str) -> Result<()> {
        let scope = self.scope_for(thread_id);
        with_retry(&self.retry, "blob_delete_scope", || self.store.delete_scope(&scope)).await
    }
}
