//! Store configuration
//!
//! Loaded from TOML; every field has a default, so an empty document is a
//! valid configuration.
//!
//! ```toml
//! inline_threshold_bytes = 358400
//! max_item_bytes = 409600
//! list_page_size = 50
//! delete_batch_size = 25
//! blob_prefix = "checkpoints"
//!
//! [retry]
//! max_attempts = 5
//! initial_interval = 0.05
//! attempt_timeout_ms = 10000
//! ```

use crate::error::{CheckpointError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// 350 KiB: leaves headroom under a 400 KiB item limit for keys and pointers
pub const DEFAULT_INLINE_THRESHOLD_BYTES: usize = 350 * 1024;

/// Per-item limit of the key-value backend
pub const DEFAULT_MAX_ITEM_BYTES: usize = 400 * 1024;

/// Tunables for [`TieredCheckpointSaver`](crate::TieredCheckpointSaver)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointStoreConfig {
    /// Segments whose encoded size exceeds this are offloaded to blob storage
    pub inline_threshold_bytes: usize,

    /// Largest record the key-value store accepts
    pub max_item_bytes: usize,

    /// Records fetched per backend query while listing
    pub list_page_size: usize,

    /// Keys removed per backend batch while deleting a thread
    pub delete_batch_size: usize,

    /// Leading path component of blob keys
    pub blob_prefix: String,

    /// Backoff policy for transient backend failures
    pub retry: RetryPolicy,
}

impl Default for CheckpointStoreConfig {
    fn default() -> Self {
        Self {
            inline_threshold_bytes: DEFAULT_INLINE_THRESHOLD_BYTES,
            max_item_bytes: DEFAULT_MAX_ITEM_BYTES,
            list_page_size: 50,
            delete_batch_size: 25,
            blob_prefix: "checkpoints".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl CheckpointStoreConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            CheckpointError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Loaded checkpoint store config");
        Self::from_toml_str(&content)
    }

    /// Set the inline threshold
    pub fn with_inline_threshold(mut self, bytes: usize) -> Self {
        self.inline_threshold_bytes = bytes;
        self
    }

    /// Set the backend item limit
    pub fn with_max_item_bytes(mut self, bytes: usize) -> Self {
        self.max_item_bytes = bytes;
        self
    }

    /// Set the listing page size
    pub fn with_list_page_size(mut self, size: usize) -> Self {
        self.list_page_size = size;
        self
    }

    /// Set the delete batch size
    pub fn with_delete_batch_size(mut self, size: usize) -> Self {
        self.delete_batch_size = size;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reject settings the store cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.list_page_size == 0 {
            return Err(CheckpointError::Config("list_page_size must be > 0".into()));
        }
        if self.delete_batch_size == 0 {
            return Err(CheckpointError::Config("delete_batch_size must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(CheckpointError::Config("retry.max_attempts must be > 0".into()));
        }
        if !self.retry.has_valid_intervals() {
            return Err(CheckpointError::Config(
                "retry intervals and backoff_factor must be finite and non-negative".into(),
            ));
        }
        if self.inline_threshold_bytes > self.max_item_bytes {
            return Err(CheckpointError::Config(format!(
                "inline_threshold_bytes ({}) exceeds max_item_bytes ({})",
                self.inline_threshold_bytes, self.max_item_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CheckpointStoreConfig::default();
        assert_eq!(config.inline_threshold_bytes, 358_400);
        assert_eq!(config.max_item_bytes, 409_600);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = CheckpointStoreConfig::from_toml_str("").unwrap();
        assert_eq!(config, CheckpointStoreConfig::default());
    }

    #[test]
    fn test_partial_document_overrides() {
        let config = CheckpointStoreConfig::from_toml_str(
            r#"
            inline_threshold_bytes = 1024
            blob_prefix = "ckpt"

            [retry]
            max_attempts = 2
            jitter = false
            "#,
        )
        .unwrap();

        assert_eq!(config.inline_threshold_bytes, 1024);
        assert_eq!(config.blob_prefix, "ckpt");
        assert_eq!(config.retry.max_attempts, 2);
        assert!(!config.retry.jitter);
        assert_eq!(config.retry.backoff_factor, 2.0);
        assert_eq!(config.list_page_size, 50);
    }

    #[test]
    fn test_validation_failures() {
        let err = CheckpointStoreConfig::from_toml_str("list_page_size = 0").unwrap_err();
        assert!(matches!(err, CheckpointError::Config(_)));

        let err = CheckpointStoreConfig::default()
            .with_inline_threshold(10)
            .with_max_item_bytes(5)
            .validate()
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Config(_)));
    }

    #[test]
    fn test_non_finite_retry_intervals_are_rejected() {
        let err = CheckpointStoreConfig::from_toml_str(
            r#"
            [retry]
            initial_interval = inf
            max_interval = inf
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, CheckpointError::Config(_)));

        let err = CheckpointStoreConfig::default()
            .with_retry(RetryPolicy::default().with_initial_interval(-1.0))
            .validate()
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Config(_)));

        let err = CheckpointStoreConfig::default()
            .with_retry(RetryPolicy::default().with_backoff_factor(f64::NAN))
            .validate()
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Config(_)));
    }

    #[test]
    fn test_malformed_toml() {
        let err = CheckpointStoreConfig::from_toml_str("inline_threshold_bytes = \"big\"").unwrap_err();
        assert!(matches!(err, CheckpointError::Config(_)));
    }

    #[tokio::test]
    async fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "delete_batch_size = 10").unwrap();

        let config = CheckpointStoreConfig::from_file(file.path()).await.unwrap();
        assert_eq!(config.delete_batch_size, 10);
    }

    #[tokio::test]
    async fn test_from_missing_file() {
        let err = CheckpointStoreConfig::from_file("/nonexistent/checkpoints.toml")
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Config(_)));
    }
}
