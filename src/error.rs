//! Error types surfaced by the caching layer.
//!
//! A cache miss is not an error: lookups return `Option::None` and the
//! strategy moves on to its next step.

use thiserror::Error;

use crate::worker::LifecycleState;

/// Failure to obtain a usable response from the network.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  /// The fetch itself was rejected (offline, DNS, TLS, reset, timeout)
  #[error("network request for {url} failed: {reason}")]
  Network { url: String, reason: String },

  /// A response arrived but its status was not exactly 200
  #[error("{url} answered with status {status}")]
  NonSuccessStatus { url: String, status: u16 },
}

impl FetchError {
  pub fn network(url: impl Into<String>, reason: impl ToString) -> Self {
    Self::Network {
      url: url.into(),
      reason: reason.to_string(),
    }
  }
}

/// Failure of a single warm-up manifest entry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WarmupError {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error("manifest path {path} cannot be resolved: {reason}")]
  InvalidPath { path: String, reason: String },

  #[error("could not store {path}: {reason}")]
  Storage { path: String, reason: String },
}

/// Failure of an install or activate step.
#[derive(Debug, Error)]
pub enum LifecycleError {
  #[error("cannot {operation} while the worker is {state}")]
  InvalidState {
    operation: &'static str,
    state: LifecycleState,
  },

  #[error("warm-up of {path} failed: {source}")]
  Warmup {
    path: String,
    #[source]
    source: WarmupError,
  },

  #[error("{count} open page(s) are still controlled by a previous version")]
  ClientsStillControlled { count: usize },

  #[error("partition store error: {0}")]
  Storage(color_eyre::Report),
}
