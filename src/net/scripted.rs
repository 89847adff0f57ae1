//! Deterministic in-process network for embedding hosts and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use color_eyre::{eyre::eyre, Result};

use super::client::Network;
use super::types::{Request, Response};

/// A network that answers from a fixed routing table and can be switched offline.
///
/// Unrouted URLs answer `404`. While offline every fetch fails with an error,
/// the same way a real transport failure surfaces.
pub struct ScriptedNetwork {
  routes: Mutex<HashMap<String, Response>>,
  online: AtomicBool,
  calls: Mutex<Vec<String>>,
}

impl Default for ScriptedNetwork {
  fn default() -> Self {
    Self::new()
  }
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self {
      routes: Mutex::new(HashMap::new()),
      online: AtomicBool::new(true),
      calls: Mutex::new(Vec::new()),
    }
  }

  /// Answer `url` with `response` from now on.
  pub fn route(&self, url: &str, response: Response) {
    if let Ok(mut routes) = self.routes.lock() {
      routes.insert(url.to_string(), response);
    }
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Every fetch attempted so far, as `METHOD url`.
  pub fn calls(&self) -> Vec<String> {
    self
      .calls
      .lock()
      .map(|calls| calls.clone())
      .unwrap_or_default()
  }

  /// Number of fetches attempted for `url`, any method.
  pub fn call_count(&self, url: &str) -> usize {
    self
      .calls()
      .iter()
      .filter(|call| call.split_once(' ').map(|(_, u)| u) == Some(url))
      .count()
  }
}

impl Network for ScriptedNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let key = request.cache_key();
    if let Ok(mut calls) = self.calls.lock() {
      calls.push(format!("{} {}", request.method, key));
    }

    if !self.online.load(Ordering::SeqCst) {
      return Err(eyre!("Failed to fetch {}: network unreachable", key));
    }

    let routes = self
      .routes
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(
      routes
        .get(&key)
        .cloned()
        .unwrap_or_else(|| Response::new(404, "Not Found")),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[tokio::test]
  async fn test_routed_and_unrouted() {
    let network = ScriptedNetwork::new();
    network.route("https://a.test/x.js", Response::new(200, "x"));

    let hit = network.fetch(&get("https://a.test/x.js")).await.unwrap();
    assert_eq!(hit.body, b"x");
    let miss = network.fetch(&get("https://a.test/y.js")).await.unwrap();
    assert_eq!(miss.status, 404);
    assert_eq!(network.call_count("https://a.test/x.js"), 1);
  }

  #[tokio::test]
  async fn test_offline_fails_but_records_call() {
    let network = ScriptedNetwork::new();
    network.route("https://a.test/x.js", Response::new(200, "x"));
    network.set_online(false);

    assert!(network.fetch(&get("https://a.test/x.js")).await.is_err());
    assert_eq!(network.calls(), vec!["GET https://a.test/x.js".to_string()]);
  }
}
