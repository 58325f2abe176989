//! Lifecycle states, open page tracking and install/activate reports.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::error::WarmupError;

/// Lifecycle of one deployed version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Created, install not started
  New,
  Installing,
  /// Installed, waiting to activate
  Waiting,
  Activating,
  /// Intercepting requests
  Active,
  /// Replaced by a newer version, or failed to install
  Superseded,
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::New => "new",
      Self::Installing => "installing",
      Self::Waiting => "waiting to activate",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Superseded => "superseded",
    };
    f.write_str(name)
  }
}

pub type ClientId = u64;

/// Registry of open page instances and the version controlling each.
#[derive(Debug, Default)]
pub struct Clients {
  next_id: AtomicU64,
  controllers: RwLock<HashMap<ClientId, Option<String>>>,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a page, optionally already controlled by a version.
  pub fn open(&self, controller: Option<&str>) -> ClientId {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self
      .controllers
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .insert(id, controller.map(String::from));
    id
  }

  pub fn close(&self, id: ClientId) {
    self
      .controllers
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .remove(&id);
  }

  /// Version controlling a page, if any.
  pub fn controller(&self, id: ClientId) -> Option<String> {
    self
      .controllers
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .get(&id)
      .cloned()
      .flatten()
  }

  /// Number of open pages controlled by a version other than `version`.
  pub fn controlled_by_other(&self, version: &str) -> usize {
    self
      .controllers
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .values()
      .filter(|c| matches!(c, Some(v) if v != version))
      .count()
  }

  /// Take control of every open page. Returns how many changed controller.
  pub fn claim(&self, version: &str) -> usize {
    let mut controllers = self.controllers.write().unwrap_or_else(|e| e.into_inner());
    let mut claimed = 0;
    for controller in controllers.values_mut() {
      if controller.as_deref() != Some(version) {
        *controller = Some(version.to_string());
        claimed += 1;
      }
    }
    claimed
  }

  pub fn len(&self) -> usize {
    self
      .controllers
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Outcome of one warm-up manifest entry.
#[derive(Debug, Clone)]
pub struct WarmupOutcome {
  pub path: String,
  pub result: Result<(), WarmupError>,
}

/// Per-entry results of the install warm-up.
#[derive(Debug, Clone, Default)]
pub struct WarmupReport {
  pub outcomes: Vec<WarmupOutcome>,
}

impl WarmupReport {
  pub fn stored(&self) -> impl Iterator<Item = &str> {
    self
      .outcomes
      .iter()
      .filter(|o| o.result.is_ok())
      .map(|o| o.path.as_str())
  }

  pub fn failed(&self) -> impl Iterator<Item = &WarmupOutcome> {
    self.outcomes.iter().filter(|o| o.result.is_err())
  }

  pub fn is_complete(&self) -> bool {
    self.failed().next().is_none()
  }
}

impl fmt::Display for WarmupReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let stored = self.stored().count();
    write!(f, "warmed {}/{} routes", stored, self.outcomes.len())?;
    for outcome in self.failed() {
      if let Err(e) = &outcome.result {
        write!(f, "\n  {}: {}", outcome.path, e)?;
      }
    }
    Ok(())
  }
}

/// Result of a completed activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  /// Stale partitions that were deleted
  pub deleted: Vec<String>,
  /// Open pages that switched to this version
  pub claimed: usize,
}
