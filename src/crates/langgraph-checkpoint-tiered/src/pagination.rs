//! Cursor state for paged traversal
//!
//! History listing is stateless between calls: the only cursor is the id of
//! the last checkpoint a consumer processed. There is no server-side lease to
//! expire, so a crashed consumer resumes by passing that id as `before`.
//!
//! Internally every traversal is split into backend pages. [`ListCursor`]
//! tracks a descending walk over checkpoint ids; [`PageCursor`] tracks an
//! ascending walk over raw sort keys (pending writes, thread deletion).

use crate::backend::{Direction, QueryPage, QueryRequest};
use crate::checkpoint::CheckpointId;

/// Position of a reverse-chronological listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListCursor {
    last_seen: Option<CheckpointId>,
    remaining: Option<usize>,
}

impl ListCursor {
    /// Start below `before` (exclusive), or at the latest checkpoint when
    /// `None`, yielding at most `limit` items
    pub fn new(before: Option<CheckpointId>, limit: Option<usize>) -> Self {
        Self {
            last_seen: before,
            remaining: limit,
        }
    }

    /// Exclusive upper bound for the next page
    pub fn position(&self) -> Option<&str> {
        self.last_seen.as_deref()
    }

    /// Whether the caller's limit has been reached
    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }

    /// Backend page size to request next
    pub fn page_limit(&self, page_size: usize) -> usize {
        self.remaining.map_or(page_size, |left| left.min(page_size))
    }

    /// Move past a fetched record, whether or not it was yielded
    pub fn skip(&mut self, id: &str) {
        self.last_seen = Some(id.to_string());
    }

    /// Record that `id` was yielded to the caller
    pub fn advance(&mut self, id: &str) {
        self.skip(id);
        if let Some(left) = self.remaining.as_mut() {
            *left = left.saturating_sub(1);
        }
    }
}

/// Position of an ascending scan over one partition prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    partition: String,
    prefix: String,
    after: Option<String>,
    done: bool,
}

impl PageCursor {
    pub fn new(partition: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            prefix: prefix.into(),
            after: None,
            done: false,
        }
    }

    /// Query for the next page, or `None` when the scan is complete
    pub fn next_request(&self, page_size: usize) -> Option<QueryRequest> {
        if self.done {
            return None;
        }
        Some(QueryRequest {
            partition: self.partition.clone(),
            sort_prefix: self.prefix.clone(),
            lower: self.after.clone(),
            upper: None,
            direction: Direction::Ascending,
            limit: page_size,
        })
    }

    /// Consume a page's continuation marker
    pub fn advance(&mut self, page: &QueryPage) {
        match &page.last_evaluated {
            Some(last) => self.after = Some(last.clone()),
            None => self.done = true,
        }
    }
}
