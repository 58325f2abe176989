//! Partition store handle shared by the lifecycle and the strategies.

use std::sync::Arc;

use color_eyre::Result;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::{CacheKey, CachedResponse};
use crate::http::Response;

/// Explicit owner of the set of partitions.
///
/// Cloning is cheap and every clone talks to the same storage backend.
pub struct PartitionStore<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage> PartitionStore<S> {
  /// Create a new partition store on top of the given storage backend.
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  /// Open a partition, creating it if it does not exist yet.
  pub fn open(&self, name: &str) -> Result<Partition<S>> {
    self.storage.open_partition(name)?;
    Ok(Partition {
      name: name.to_string(),
      storage: Arc::clone(&self.storage),
    })
  }

  /// Delete a partition with all of its entries.
  pub fn delete(&self, name: &str) -> Result<bool> {
    self.storage.delete_partition(name)
  }

  /// Names of all existing partitions.
  pub fn names(&self) -> Result<Vec<String>> {
    self.storage.partition_names()
  }

  /// Number of entries currently held by a partition.
  pub fn entry_count(&self, name: &str) -> Result<usize> {
    self.storage.entry_count(name)
  }

  /// Best-effort lookup across every partition.
  pub fn match_any(&self, key: &CacheKey) -> Result<Option<CachedResponse>> {
    self.storage.get_any(key)
  }

  pub fn active_version(&self) -> Result<Option<String>> {
    self.storage.active_version()
  }

  pub fn set_active_version(&self, version: &str) -> Result<()> {
    self.storage.set_active_version(version)
  }
}

impl<S: CacheStorage> Clone for PartitionStore<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}

/// Handle to one open partition.
pub struct Partition<S: CacheStorage> {
  name: String,
  storage: Arc<S>,
}

impl<S: CacheStorage> Partition<S> {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Look up the stored response for a request key.
  pub fn lookup(&self, key: &CacheKey) -> Result<Option<Response>> {
    Ok(
      self
        .storage
        .get(&self.name, key)?
        .map(|cached| cached.response),
    )
  }

  /// Store a response, overwriting any previous entry for the key.
  pub fn put(&self, key: &CacheKey, response: &Response) -> Result<()> {
    self.storage.put(&self.name, key, response)
  }

  /// Store a batch of responses in one step. Nothing is stored on failure.
  pub fn put_many(&self, entries: &[(CacheKey, Response)]) -> Result<()> {
    self.storage.put_many(&self.name, entries)
  }

  /// Store a response on a blocking worker thread without waiting for it.
  ///
  /// Failures are logged and otherwise dropped; the caller keeps its own
  /// copy of the response.
  pub fn put_detached(&self, key: CacheKey, response: Response) -> JoinHandle<()> {
    let storage = Arc::clone(&self.storage);
    let name = self.name.clone();

    tokio::task::spawn_blocking(move || match storage.put(&name, &key, &response) {
      Ok(()) => debug!(partition = %name, key = %key, "Stored response"),
      Err(e) => warn!(partition = %name, key = %key, error = %e, "Failed to store response"),
    })
  }

  pub fn len(&self) -> Result<usize> {
    self.storage.entry_count(&self.name)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}
