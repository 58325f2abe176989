//! Network capability used by the strategies.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::HeaderMap;
use std::time::Duration;

use crate::config::Config;
use crate::error::FetchError;
use crate::http::{Request, Response};

/// Something that can perform a request against the network.
///
/// Any response that arrives counts as success here, whatever its status.
/// Only a rejected fetch is an error.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// Network access through a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  timeout: Option<Duration>,
}

impl HttpNetwork {
  pub fn new(config: &Config) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("storefront-offline/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      timeout: config.fetch_timeout(),
    })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }
    if let Some(timeout) = self.timeout {
      builder = builder.timeout(timeout);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| FetchError::network(request.url.as_str(), e))?;

    let status = response.status().as_u16();
    let headers = header_pairs(response.headers());
    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::network(request.url.as_str(), e))?;

    Ok(Response::new(status, headers, body))
  }
}

/// Snapshot response headers. Values outside visible ASCII are kept with
/// invalid UTF-8 replaced.
fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .map(|(name, value)| {
      (
        name.as_str().to_string(),
        String::from_utf8_lossy(value.as_bytes()).into_owned(),
      )
    })
    .collect()
}

/// A network that is never reachable. Every fetch is rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineNetwork;

#[async_trait]
impl Network for OfflineNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    Err(FetchError::network(
      request.url.as_str(),
      "network unavailable (offline mode)",
    ))
  }
}

#[cfg(test)]
pub(crate) mod mock {
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex;

  use bytes::Bytes;
  use reqwest::Method;

  use super::*;

  /// Scriptable in-memory network for tests.
  ///
  /// Unknown URLs answer 404 while online.
  pub(crate) struct MockNetwork {
    routes: Mutex<HashMap<String, Response>>,
    online: AtomicBool,
    calls: Mutex<Vec<(Method, String)>>,
  }

  impl MockNetwork {
    pub(crate) fn new() -> Self {
      Self {
        routes: Mutex::new(HashMap::new()),
        online: AtomicBool::new(true),
        calls: Mutex::new(Vec::new()),
      }
    }

    pub(crate) fn route(&self, url: &str, status: u16, content_type: &str, body: &str) {
      let response = Response::new(
        status,
        vec![("content-type".to_string(), content_type.to_string())],
        Bytes::from(body.to_string()),
      );
      self.routes.lock().unwrap().insert(url.to_string(), response);
    }

    pub(crate) fn set_online(&self, online: bool) {
      self.online.store(online, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<(Method, String)> {
      self.calls.lock().unwrap().clone()
    }

    pub(crate) fn calls_to(&self, url: &str) -> usize {
      self.calls().iter().filter(|(_, u)| u == url).count()
    }
  }

  #[async_trait]
  impl Network for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
      self
        .calls
        .lock()
        .unwrap()
        .push((request.method.clone(), request.url.to_string()));

      if !self.online.load(Ordering::SeqCst) {
        return Err(FetchError::network(request.url.as_str(), "connection refused"));
      }

      let routes = self.routes.lock().unwrap();
      Ok(
        routes
          .get(request.url.as_str())
          .cloned()
          .unwrap_or_else(|| Response::new(404, Vec::new(), Bytes::new())),
      )
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Destination;
  use reqwest::header::HeaderValue;
  use url::Url;

  #[tokio::test]
  async fn test_offline_network_rejects_every_fetch() {
    let request = Request::get(
      Url::parse("http://localhost:3000/").unwrap(),
      Destination::Document,
    );

    let err = OfflineNetwork.fetch(&request).await.unwrap_err();
    assert!(matches!(err, FetchError::Network { ref url, .. } if url == "http://localhost:3000/"));
  }

  #[test]
  fn test_header_snapshot_keeps_non_ascii_values() {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("text/html"));
    headers.insert(
      "content-disposition",
      HeaderValue::from_bytes(b"inline; filename=\"caf\xc3\xa9.html\"").unwrap(),
    );
    headers.insert("x-legacy", HeaderValue::from_bytes(b"r\xe9sum\xe9").unwrap());

    let pairs = header_pairs(&headers);
    assert_eq!(pairs.len(), 3);
    assert!(pairs.contains(&(
      "content-disposition".to_string(),
      "inline; filename=\"caf\u{e9}.html\"".to_string()
    )));
    assert!(pairs.contains(&("x-legacy".to_string(), "r\u{fffd}sum\u{fffd}".to_string())));
  }

  #[tokio::test]
  async fn test_mock_network_records_calls() {
    let network = mock::MockNetwork::new();
    network.route("http://localhost:3000/about", 200, "text/html", "about");
    let request = Request::get(
      Url::parse("http://localhost:3000/about").unwrap(),
      Destination::Document,
    );

    let response = network.fetch(&request).await.unwrap();
    assert_eq!(response.text(), "about");

    network.set_online(false);
    assert!(network.fetch(&request).await.is_err());
    assert_eq!(network.calls_to("http://localhost:3000/about"), 2);
  }
}
