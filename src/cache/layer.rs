//! Cache layer that maps logical dataset keys onto a storage backend.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::CacheStorage;
use crate::fetcher::Dataset;

/// Serialized form of a cached dataset.
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
  data: Dataset,
  /// Milliseconds since the Unix epoch when the entry was written
  timestamp: i64,
}

/// Write-through cache for datasets.
///
/// The cache is an optimization: none of its operations fail. Backend and
/// encoding errors are logged and the operation degrades to a miss or no-op.
pub struct CacheLayer {
  storage: Arc<dyn CacheStorage>,
  /// Prefix for every storage key this layer owns
  namespace: String,
}

impl CacheLayer {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: impl CacheStorage + 'static) -> Self {
    Self {
      storage: Arc::new(storage),
      namespace: "cache_".to_string(),
    }
  }

  /// Set the key prefix for entries written by this layer.
  pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
    self.namespace = namespace.into();
    self
  }

  fn storage_key(&self, key: &str) -> String {
    format!("{}{}", self.namespace, key)
  }

  /// Store `data` under `key`, replacing any previous entry.
  pub fn save(&self, key: &str, data: &Dataset) {
    self.save_at(key, data, Utc::now());
  }

  /// Return the cached dataset for `key` unless it is missing or older than `max_age`.
  ///
  /// Expired and unreadable entries are removed as a side effect.
  pub fn load(&self, key: &str, max_age: Duration) -> Option<Dataset> {
    self.load_at(key, max_age, Utc::now())
  }

  /// Remove one entry, or every entry in this namespace when `key` is `None`.
  pub fn clear(&self, key: Option<&str>) {
    let result = match key {
      Some(key) => self.storage.remove(&self.storage_key(key)),
      None => self.storage.remove_prefix(&self.namespace),
    };

    if let Err(e) = result {
      tracing::warn!(error = %e, namespace = %self.namespace, "failed to clear cache");
    }
  }

  pub(crate) fn save_at(&self, key: &str, data: &Dataset, now: DateTime<Utc>) {
    let entry = CacheEntry {
      data: data.clone(),
      timestamp: now.timestamp_millis(),
    };

    let result = serde_json::to_string(&entry)
      .map_err(|e| eyre!("Failed to serialize cache entry: {}", e))
      .and_then(|value| self.storage.set(&self.storage_key(key), &value));

    match result {
      Ok(()) => tracing::debug!(key, "dataset cached"),
      Err(e) => tracing::warn!(error = %e, key, "failed to write cache entry"),
    }
  }

  fn load_at(&self, key: &str, max_age: Duration, now: DateTime<Utc>) -> Option<Dataset> {
    match self.read_entry(key) {
      Ok(Some(entry)) => {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let Some(age_ms) = now.timestamp_millis().checked_sub(entry.timestamp) else {
          tracing::warn!(key, timestamp = entry.timestamp, "discarding cache entry with invalid timestamp");
          self.clear(Some(key));
          return None;
        };

        if age_ms > max_age_ms {
          tracing::debug!(key, age_ms, "cache entry expired");
          self.clear(Some(key));
          return None;
        }

        Some(entry.data)
      }
      Ok(None) => None,
      Err(e) => {
        tracing::warn!(error = %e, key, "discarding unreadable cache entry");
        self.clear(Some(key));
        None
      }
    }
  }

  fn read_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
    let Some(raw) = self.storage.get(&self.storage_key(key))? else {
      return Ok(None);
    };

    let entry = serde_json::from_str(&raw)
      .map_err(|e| eyre!("Failed to parse cache entry {}: {}", key, e))?;

    Ok(Some(entry))
  }
}

impl Clone for CacheLayer {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      namespace: self.namespace.clone(),
    }
  }
}
