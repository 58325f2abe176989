//! Assigns every intercepted request to exactly one strategy class.

use url::{Origin, Url};

use crate::http::{Destination, Request};

/// Strategy class of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
  /// Cache-first with a synthetic placeholder on failure
  Image,
  /// Cache-first, failures propagate
  StaticAsset,
  /// Network-first with cache and offline page fallbacks
  Document,
  /// Network, with a best-effort lookup across partitions on failure
  Passthrough,
}

/// Request classifier for one site origin.
#[derive(Debug, Clone)]
pub struct Classifier {
  origin: Origin,
  static_prefix: String,
}

impl Classifier {
  pub fn new(origin: &Url, static_prefix: impl Into<String>) -> Self {
    Self {
      origin: origin.origin(),
      static_prefix: static_prefix.into(),
    }
  }

  /// Classify a request from its method, destination and URL alone.
  ///
  /// Rules are checked in order, first match wins.
  pub fn classify(&self, request: &Request) -> RequestClass {
    if !request.is_get() {
      return RequestClass::Passthrough;
    }

    if request.destination == Destination::Image {
      return RequestClass::Image;
    }

    if self.is_static_asset(&request.url) {
      return RequestClass::StaticAsset;
    }

    if request.destination == Destination::Document {
      return RequestClass::Document;
    }

    RequestClass::Passthrough
  }

  fn is_static_asset(&self, url: &Url) -> bool {
    if url.origin() != self.origin {
      return false;
    }

    let path = url.path();
    path.starts_with(&self.static_prefix) || path.ends_with(".js") || path.ends_with(".css")
  }
}
