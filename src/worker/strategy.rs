//! Per-class response strategies.

use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::classify::RequestClass;
use super::fallback;
use crate::cache::{CacheKey, CacheStorage, Partition, PartitionStore};
use crate::config::PartitionNames;
use crate::error::FetchError;
use crate::http::{Request, Response};
use crate::network::Network;

/// Partition writes spawned off the response path.
#[derive(Default)]
pub(crate) struct PendingWrites {
  handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PendingWrites {
  fn track(&self, handle: JoinHandle<()>) {
    let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
    handles.retain(|h| !h.is_finished());
    handles.push(handle);
  }

  /// Wait for every write spawned so far.
  pub(crate) async fn settle(&self) {
    let handles: Vec<_> = {
      let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
      guard.drain(..).collect()
    };

    for handle in handles {
      if let Err(e) = handle.await {
        warn!(error = %e, "Partition write task did not complete");
      }
    }
  }
}

/// Everything a strategy may touch: the partitions, the network and the
/// write tracker.
pub(crate) struct Strategies<'a, S: CacheStorage, N: Network> {
  /// Site origin; its root document is the last cached fallback for pages
  pub origin: &'a Url,
  pub store: &'a PartitionStore<S>,
  pub network: &'a N,
  pub partitions: &'a PartitionNames,
  pub writes: &'a PendingWrites,
}

impl<S: CacheStorage, N: Network> Strategies<'_, S, N> {
  /// Produce a response for a classified request.
  pub(crate) async fn run(&self, class: RequestClass, request: &Request) -> Result<Response, FetchError> {
    match class {
      RequestClass::Image => match self.cache_first(&self.partitions.images, request).await {
        Ok(response) => Ok(response),
        Err(e) => {
          debug!(url = %request.url, error = %e, "Serving placeholder image");
          Ok(fallback::image_placeholder())
        }
      },
      RequestClass::StaticAsset => {
        self
          .cache_first(&self.partitions.static_assets, request)
          .await
      }
      RequestClass::Document => Ok(self.network_first(&self.partitions.pages, request).await),
      RequestClass::Passthrough => self.passthrough(request).await,
    }
  }

  /// Serve a stored copy if there is one, otherwise fetch and store a 200.
  ///
  /// The network response is returned whatever its status.
  async fn cache_first(&self, partition: &str, request: &Request) -> Result<Response, FetchError> {
    let key = request.cache_key();
    let partition = self.open(partition);

    if let Some(partition) = &partition {
      match partition.lookup(&key) {
        Ok(Some(response)) => {
          debug!(partition = partition.name(), key = %key, "Cache hit");
          return Ok(response);
        }
        Ok(None) => debug!(partition = partition.name(), key = %key, "Cache miss"),
        Err(e) => warn!(partition = partition.name(), key = %key, error = %e, "Cache lookup failed"),
      }
    }

    let response = self.network.fetch(request).await?;
    if let Some(partition) = &partition {
      self.store_copy(partition, key, &response);
    }

    Ok(response)
  }

  /// Always try the network first. On failure fall back to the stored copy
  /// of this request, then the stored root document of the site origin,
  /// then the offline page.
  async fn network_first(&self, partition: &str, request: &Request) -> Response {
    let error = match self.network.fetch(request).await {
      Ok(response) => {
        if let Some(partition) = self.open(partition) {
          self.store_copy(&partition, request.cache_key(), &response);
        }
        return response;
      }
      Err(e) => e,
    };

    debug!(url = %request.url, error = %error, "Document fetch failed, trying cache");

    if let Some(response) = self.match_any(&request.cache_key()) {
      return response;
    }

    if let Ok(root) = self.origin.join("/") {
      if let Some(response) = self.match_any(&CacheKey::new("GET", &root)) {
        debug!(url = %request.url, "Serving cached root document");
        return response;
      }
    }

    debug!(url = %request.url, "Serving offline page");
    fallback::offline_page()
  }

  /// Network, then a best-effort lookup in any partition.
  async fn passthrough(&self, request: &Request) -> Result<Response, FetchError> {
    match self.network.fetch(request).await {
      Ok(response) => Ok(response),
      Err(e) => self.match_any(&request.cache_key()).ok_or(e),
    }
  }

  fn open(&self, name: &str) -> Option<Partition<S>> {
    match self.store.open(name) {
      Ok(partition) => Some(partition),
      Err(e) => {
        warn!(partition = name, error = %e, "Failed to open partition");
        None
      }
    }
  }

  fn match_any(&self, key: &CacheKey) -> Option<Response> {
    match self.store.match_any(key) {
      Ok(found) => found.map(|cached| cached.response),
      Err(e) => {
        warn!(key = %key, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  /// Detach a write of an exact-200 response. The caller keeps `response`.
  fn store_copy(&self, partition: &Partition<S>, key: CacheKey, response: &Response) {
    if response.is_cacheable() {
      self
        .writes
        .track(partition.put_detached(key, response.clone()));
    }
  }
}
