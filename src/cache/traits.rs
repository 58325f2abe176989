//! Core types for the partition store.

use std::fmt;

use chrono::{DateTime, Utc};
use url::Url;

use crate::http::Response;

/// Identity of a cached request within a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  method: String,
  url: String,
}

impl CacheKey {
  /// Build a key from a method and URL. The fragment never reaches the
  /// network, so it is not part of the identity.
  pub fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_ascii_uppercase(),
      url: url.into(),
    }
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A stored response together with its storage metadata.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The stored snapshot, tagged as coming from the cache
  pub response: Response,
  /// Partition the entry was found in
  pub partition: String,
  /// When the entry was last written
  pub cached_at: DateTime<Utc>,
}
