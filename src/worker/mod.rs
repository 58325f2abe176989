//! Request interception layer for one deployed site version.
//!
//! A [`ServiceWorker`] owns the partition store and the network capability
//! and exposes the three hooks a host drives:
//! - `install`: warm the pages partition with the precache manifest
//! - `activate`: retire partitions from older versions and claim open pages
//! - `intercept`: classify a request and run its strategy

mod classify;
mod fallback;
mod lifecycle;
mod strategy;

pub use classify::{Classifier, RequestClass};
pub use fallback::{image_placeholder, offline_page};
pub use lifecycle::{
  ActivationReport, ClientId, Clients, LifecycleState, WarmupOutcome, WarmupReport,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use color_eyre::{eyre::eyre, Result};
use futures::future::{join_all, try_join_all};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheKey, CacheStorage, PartitionStore};
use crate::config::{Config, PartitionNames, WarmupMode};
use crate::error::{FetchError, LifecycleError, WarmupError};
use crate::http::{Destination, Request, Response};
use crate::network::Network;
use strategy::{PendingWrites, Strategies};

/// Per-version settings of the interception layer.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
  pub origin: Url,
  pub version: String,
  pub static_prefix: String,
  pub partitions: PartitionNames,
  pub precache: Vec<String>,
  pub warmup: WarmupMode,
}

impl WorkerSettings {
  pub fn from_config(config: &Config) -> Result<Self> {
    let origin = Url::parse(&config.origin)
      .map_err(|e| eyre!("Invalid origin '{}': {}", config.origin, e))?;

    Ok(Self {
      origin,
      version: config.version.clone(),
      static_prefix: config.static_prefix.clone(),
      partitions: config.partitions.clone(),
      precache: config.precache.clone(),
      warmup: config.warmup,
    })
  }
}

/// What the layer decided to do with an intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interception {
  /// Answer the request with this response
  Respond(Response),
  /// Not handled; the host performs its default network fetch
  FallThrough,
}

/// The caching layer for one deployed version.
pub struct ServiceWorker<S: CacheStorage, N: Network> {
  settings: WorkerSettings,
  classifier: Classifier,
  store: PartitionStore<S>,
  network: Arc<N>,
  clients: Arc<Clients>,
  state: Mutex<LifecycleState>,
  skip_waiting: AtomicBool,
  writes: PendingWrites,
}

impl<S: CacheStorage, N: Network> ServiceWorker<S, N> {
  /// Create a worker that has not been installed yet.
  pub fn new(
    settings: WorkerSettings,
    store: PartitionStore<S>,
    network: Arc<N>,
    clients: Arc<Clients>,
  ) -> Self {
    let classifier = Classifier::new(&settings.origin, settings.static_prefix.clone());

    Self {
      settings,
      classifier,
      store,
      network,
      clients,
      state: Mutex::new(LifecycleState::New),
      skip_waiting: AtomicBool::new(false),
      writes: PendingWrites::default(),
    }
  }

  /// Create a worker, starting out active when the store records this
  /// version as the one that last activated.
  pub fn resume(
    settings: WorkerSettings,
    store: PartitionStore<S>,
    network: Arc<N>,
    clients: Arc<Clients>,
  ) -> Result<Self> {
    let active = store.active_version()?;
    let worker = Self::new(settings, store, network, clients);

    if active.as_deref() == Some(worker.settings.version.as_str()) {
      debug!(version = %worker.settings.version, "Resuming active version");
      worker.set_state(LifecycleState::Active);
    }

    Ok(worker)
  }

  pub fn settings(&self) -> &WorkerSettings {
    &self.settings
  }

  pub fn store(&self) -> &PartitionStore<S> {
    &self.store
  }

  pub fn clients(&self) -> &Arc<Clients> {
    &self.clients
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: LifecycleState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
  }

  /// Move from `from` to `to`, failing when the current state is not `from`.
  fn transition(
    &self,
    operation: &'static str,
    from: LifecycleState,
    to: LifecycleState,
  ) -> Result<(), LifecycleError> {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    if *state != from {
      return Err(LifecycleError::InvalidState {
        operation,
        state: *state,
      });
    }
    *state = to;
    Ok(())
  }

  /// Ask to activate without waiting for pages controlled by an older
  /// version to close.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  /// Install hook: warm the pages partition with the precache manifest.
  ///
  /// On success the worker waits to activate and has requested to skip
  /// waiting. A failed install leaves the worker superseded.
  pub async fn install(&self) -> Result<WarmupReport, LifecycleError> {
    self.transition("install", LifecycleState::New, LifecycleState::Installing)?;
    info!(version = %self.settings.version, "Installing");

    match self.warm_up().await {
      Ok(report) => {
        info!(version = %self.settings.version, "{}", report);
        self.set_state(LifecycleState::Waiting);
        self.skip_waiting();
        Ok(report)
      }
      Err(e) => {
        warn!(version = %self.settings.version, error = %e, "Install failed");
        self.set_state(LifecycleState::Superseded);
        Err(e)
      }
    }
  }

  /// Fetch every manifest entry concurrently, then store the ones that
  /// answered 200.
  ///
  /// In strict mode the entries are written as one batch, and only once
  /// every entry was fetched.
  async fn warm_up(&self) -> Result<WarmupReport, LifecycleError> {
    let pages = self
      .store
      .open(&self.settings.partitions.pages)
      .map_err(LifecycleError::Storage)?;

    match self.settings.warmup {
      WarmupMode::Strict => {
        let fetched = try_join_all(self.settings.precache.iter().map(|path| async move {
          self
            .fetch_manifest_entry(path)
            .await
            .map(|(request, response)| (path.clone(), request.cache_key(), response))
            .map_err(|source| LifecycleError::Warmup {
              path: path.clone(),
              source,
            })
        }))
        .await?;

        let (paths, batch): (Vec<String>, Vec<(CacheKey, Response)>) = fetched
          .into_iter()
          .map(|(path, key, response)| (path, (key, response)))
          .unzip();
        pages.put_many(&batch).map_err(LifecycleError::Storage)?;

        Ok(WarmupReport {
          outcomes: paths
            .into_iter()
            .map(|path| WarmupOutcome {
              path,
              result: Ok(()),
            })
            .collect(),
        })
      }
      WarmupMode::BestEffort => {
        let fetched = join_all(
          self
            .settings
            .precache
            .iter()
            .map(|path| async move { (path.clone(), self.fetch_manifest_entry(path).await) }),
        )
        .await;

        let mut report = WarmupReport::default();
        for (path, fetched) in fetched {
          let result = fetched.and_then(|(request, response)| {
            pages
              .put(&request.cache_key(), &response)
              .map_err(|e| WarmupError::Storage {
                path: path.clone(),
                reason: e.to_string(),
              })
          });

          if let Err(e) = &result {
            warn!(path = %path, error = %e, "Route not warmed");
          }
          report.outcomes.push(WarmupOutcome { path, result });
        }

        Ok(report)
      }
    }
  }

  async fn fetch_manifest_entry(&self, path: &str) -> Result<(Request, Response), WarmupError> {
    let url = self
      .settings
      .origin
      .join(path)
      .map_err(|e| WarmupError::InvalidPath {
        path: path.to_string(),
        reason: e.to_string(),
      })?;

    let request = Request::get(url, Destination::Document);
    let response = self.network.fetch(&request).await?;
    if !response.is_cacheable() {
      return Err(
        FetchError::NonSuccessStatus {
          url: request.url.to_string(),
          status: response.status,
        }
        .into(),
      );
    }

    Ok((request, response))
  }

  /// Activate hook: delete partitions outside the current whitelist, then
  /// take control of every open page.
  pub async fn activate(&self) -> Result<ActivationReport, LifecycleError> {
    if !self.skip_waiting.load(Ordering::SeqCst) {
      let count = self.clients.controlled_by_other(&self.settings.version);
      if count > 0 {
        return Err(LifecycleError::ClientsStillControlled { count });
      }
    }
    self.transition("activate", LifecycleState::Waiting, LifecycleState::Activating)?;

    let deleted = match self.retire_stale_partitions().await {
      Ok(deleted) => deleted,
      Err(e) => {
        self.set_state(LifecycleState::Waiting);
        return Err(e);
      }
    };

    if let Err(e) = self.store.set_active_version(&self.settings.version) {
      self.set_state(LifecycleState::Waiting);
      return Err(LifecycleError::Storage(e));
    }

    let claimed = self.clients.claim(&self.settings.version);
    self.set_state(LifecycleState::Active);
    info!(
      version = %self.settings.version,
      deleted = deleted.len(),
      claimed,
      "Activated"
    );

    Ok(ActivationReport { deleted, claimed })
  }

  /// Delete every partition outside the current whitelist, concurrently.
  pub async fn retire_stale_partitions(&self) -> Result<Vec<String>, LifecycleError> {
    let stale: Vec<String> = self
      .store
      .names()
      .map_err(LifecycleError::Storage)?
      .into_iter()
      .filter(|name| !self.settings.partitions.contains(name))
      .collect();

    try_join_all(stale.iter().map(|name| {
      let store = self.store.clone();
      let name = name.clone();
      async move {
        tokio::task::spawn_blocking(move || store.delete(&name))
          .await
          .map_err(|e| LifecycleError::Storage(eyre!("Partition deletion task failed: {}", e)))?
          .map_err(LifecycleError::Storage)
      }
    }))
    .await?;

    for name in &stale {
      info!(partition = %name, "Deleted stale partition");
    }

    Ok(stale)
  }

  /// Mark this version as replaced. It stops intercepting requests.
  pub fn supersede(&self) {
    self.set_state(LifecycleState::Superseded);
  }

  /// Intercept hook.
  ///
  /// Requests reaching a worker that is not active, and non-GET requests,
  /// fall through untouched.
  pub async fn intercept(&self, request: &Request) -> Result<Interception, FetchError> {
    let state = self.state();
    if state != LifecycleState::Active {
      debug!(url = %request.url, %state, "Worker not active, falling through");
      return Ok(Interception::FallThrough);
    }

    let class = self.classifier.classify(request);
    if class == RequestClass::Passthrough && !request.is_get() {
      return Ok(Interception::FallThrough);
    }

    debug!(
      method = %request.method,
      url = %request.url,
      destination = %request.destination,
      ?class,
      "Intercepted request"
    );

    let strategies = Strategies {
      origin: &self.settings.origin,
      store: &self.store,
      network: self.network.as_ref(),
      partitions: &self.settings.partitions,
      writes: &self.writes,
    };
    strategies.run(class, request).await.map(Interception::Respond)
  }

  /// Intercept a request and perform the default fetch when it falls
  /// through, as the host would.
  pub async fn handle(&self, request: &Request) -> Result<Response, FetchError> {
    match self.intercept(request).await? {
      Interception::Respond(response) => Ok(response),
      Interception::FallThrough => self.network.fetch(request).await,
    }
  }

  /// Wait for every detached partition write spawned so far.
  pub async fn settle(&self) {
    self.writes.settle().await;
  }
}
