//! Request and response values exchanged between the host and the caching layer.

use std::borrow::Cow;
use std::fmt;

use bytes::Bytes;
use clap::ValueEnum;
use reqwest::Method;
use url::Url;

use crate::cache::CacheKey;

/// The kind of resource a request is fetching, as reported by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, ValueEnum)]
pub enum Destination {
  Document,
  Image,
  Script,
  Style,
  Font,
  Manifest,
  /// Programmatic fetches (XHR, fetch()) with no resource type
  #[default]
  Empty,
}

impl fmt::Display for Destination {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Document => "document",
      Self::Image => "image",
      Self::Script => "script",
      Self::Style => "style",
      Self::Font => "font",
      Self::Manifest => "manifest",
      Self::Empty => "empty",
    };
    f.write_str(name)
  }
}

/// An outgoing resource request issued by the host application.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub headers: Vec<(String, String)>,
  pub body: Option<Bytes>,
}

impl Request {
  pub fn new(method: Method, url: Url, destination: Destination) -> Self {
    Self {
      method,
      url,
      destination,
      headers: Vec::new(),
      body: None,
    }
  }

  /// Shorthand for a body-less GET request.
  pub fn get(url: Url, destination: Destination) -> Self {
    Self::new(Method::GET, url, destination)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  /// Identity of this request inside a partition.
  pub fn cache_key(&self) -> CacheKey {
    CacheKey::new(self.method.as_str(), &self.url)
  }
}

/// Where a response handed back to the host was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  Cache,
  Synthetic,
}

impl fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Network => f.write_str("network"),
      Self::Cache => f.write_str("cache"),
      Self::Synthetic => f.write_str("synthetic"),
    }
  }
}

/// A fully buffered response snapshot.
///
/// The body is reference counted, so `clone()` yields a second, independently
/// readable copy. This is what lets a fetched response be stored and returned
/// at the same time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
  pub source: ResponseSource,
}

impl Response {
  /// Create a response as received from the network.
  pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers,
      body: body.into(),
      source: ResponseSource::Network,
    }
  }

  pub fn with_source(mut self, source: ResponseSource) -> Self {
    self.source = source;
    self
  }

  /// Case-insensitive header lookup, first match wins.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(key, _)| key.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }

  pub fn content_type(&self) -> Option<&str> {
    self.header("content-type")
  }

  /// Only an exact 200 may be written to a partition. Other 2xx codes
  /// (204, 206, ...) are returned to the caller but never stored.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }

  pub fn text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_only_exact_200_is_cacheable() {
    assert!(Response::new(200, Vec::new(), "ok").is_cacheable());
    assert!(!Response::new(204, Vec::new(), "").is_cacheable());
    assert!(!Response::new(206, Vec::new(), "partial").is_cacheable());
    assert!(!Response::new(304, Vec::new(), "").is_cacheable());
  }

  #[test]
  fn test_header_lookup_ignores_case() {
    let response = Response::new(
      200,
      vec![("Content-Type".to_string(), "text/css".to_string())],
      "body{}",
    );
    assert_eq!(response.content_type(), Some("text/css"));
    assert_eq!(response.header("CONTENT-TYPE"), Some("text/css"));
    assert_eq!(response.header("etag"), None);
  }

  #[test]
  fn test_clone_is_independently_readable() {
    let original = Response::new(200, Vec::new(), "payload");
    let stored = original.clone();
    drop(original);
    assert_eq!(stored.text(), "payload");
  }

  #[test]
  fn test_cache_key_uses_method_and_url() {
    let url = Url::parse("http://localhost:3000/pricing#plans").unwrap();
    let get = Request::get(url.clone(), Destination::Document);
    let post = Request::new(Method::POST, url, Destination::Document);

    assert_eq!(get.cache_key().url(), "http://localhost:3000/pricing");
    assert_ne!(get.cache_key(), post.cache_key());
  }
}
