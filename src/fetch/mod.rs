//! Fetch interception: route a request to a strategy and execute it.
//!
//! Strategies only write to the cache after a 2xx response. Writes run as detached
//! blocking tasks so the response is handed back without waiting on storage; a
//! failed write is logged and otherwise ignored.

pub mod fallback;
mod router;

use std::sync::{Arc, Mutex};

use color_eyre::Result;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use router::{Route, Router, Rule, Strategy, RULES};

use crate::cache::{CachedEntry, TierRole, TieredCacheManager};
use crate::net::{Network, Request, Response};
use crate::sync::SyncQueue;

/// Header marking an API response that was served from cache after a network failure.
pub const SERVED_FROM_HEADER: &str = "x-served-from";

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServedFrom {
  /// Fresh data from network
  Network,
  /// Cache hit, network not consulted
  Cache,
  /// Network failed, serving what the cache had
  CacheFallback,
  /// Neither network nor cache could answer; canned response
  Fallback,
}

/// A response together with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Served {
  pub source: ServedFrom,
  pub response: Response,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      source: ServedFrom::Network,
      response,
    }
  }

  pub fn from_cache(response: Response) -> Self {
    Self {
      source: ServedFrom::Cache,
      response,
    }
  }

  pub fn cache_fallback(response: Response) -> Self {
    Self {
      source: ServedFrom::CacheFallback,
      response,
    }
  }

  pub fn fallback(response: Response) -> Self {
    Self {
      source: ServedFrom::Fallback,
      response,
    }
  }
}

/// Executes one strategy per intercepted request.
pub struct FetchInterceptor<N: Network> {
  network: Arc<N>,
  tiers: Arc<TieredCacheManager>,
  queue: Arc<SyncQueue>,
  writes: Mutex<Vec<JoinHandle<()>>>,
}

impl<N: Network> FetchInterceptor<N> {
  pub fn new(network: Arc<N>, tiers: Arc<TieredCacheManager>, queue: Arc<SyncQueue>) -> Self {
    Self {
      network,
      tiers,
      queue,
      writes: Mutex::new(Vec::new()),
    }
  }

  /// Run `route`'s strategy. `Err` means no response and no fallback at this level.
  pub async fn execute(&self, route: Route, request: &Request) -> Result<Served> {
    match route.strategy {
      Strategy::CacheFirst => self.cache_first(route.tier, request).await,
      Strategy::NetworkFirst => self.network_first(route.tier, request).await,
      Strategy::NavigationFallback => self.navigation(route.tier, request).await,
      Strategy::ApiPolicy => self.api(route.tier, request).await,
      Strategy::NetworkOnly => self.network_only(request).await,
    }
  }

  async fn cache_first(&self, tier: TierRole, request: &Request) -> Result<Served> {
    if let Some(entry) = self.cached(request) {
      return Ok(Served::from_cache(entry.response));
    }

    let response = self.network.fetch(request).await?;
    if response.is_ok() {
      self.persist(tier, request, &response);
    }
    Ok(Served::from_network(response))
  }

  async fn network_first(&self, tier: TierRole, request: &Request) -> Result<Served> {
    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_ok() && request.is_get() {
          self.persist(tier, request, &response);
        }
        Ok(Served::from_network(response))
      }
      Err(err) => match self.cached(request) {
        Some(entry) => {
          debug!(url = %request.url, error = %err, "network failed, serving cache");
          Ok(Served::cache_fallback(entry.response))
        }
        None => Err(err),
      },
    }
  }

  async fn navigation(&self, tier: TierRole, request: &Request) -> Result<Served> {
    match self.network.fetch(request).await {
      Ok(response) if response.is_ok() => {
        self.persist(tier, request, &response);
        return Ok(Served::from_network(response));
      }
      Ok(response) => {
        debug!(url = %request.url, status = response.status, "navigation not ok");
      }
      Err(err) => {
        debug!(url = %request.url, error = %err, "navigation failed");
      }
    }

    Ok(match self.cached(request) {
      Some(entry) => Served::cache_fallback(entry.response),
      None => Served::fallback(fallback::offline_page()),
    })
  }

  async fn api(&self, tier: TierRole, request: &Request) -> Result<Served> {
    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_ok() && request.is_get() {
          self.persist(tier, request, &response);
        }
        Ok(Served::from_network(response))
      }
      Err(err) => {
        if request.is_get() {
          if let Some(entry) = self.cached(request) {
            let response = entry.response.with_header(SERVED_FROM_HEADER, "cache");
            return Ok(Served::cache_fallback(response));
          }
        }
        Err(err)
      }
    }
  }

  async fn network_only(&self, request: &Request) -> Result<Served> {
    match self.network.fetch(request).await {
      Ok(response) => Ok(Served::from_network(response)),
      Err(err) => {
        if !request.is_get() {
          match self.queue.enqueue(request) {
            Ok(task) => info!(id = task.id, method = %task.method, url = %task.url, "queued for replay"),
            Err(e) => warn!(url = %request.url, error = %e, "failed to queue request for replay"),
          }
        }
        Err(err)
      }
    }
  }

  /// Cache lookup across serving tiers. A read failure counts as a miss.
  fn cached(&self, request: &Request) -> Option<CachedEntry> {
    match self.tiers.lookup(&request.cache_key()) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(url = %request.url, error = %e, "cache read failed");
        None
      }
    }
  }

  /// Best-effort, non-blocking write of a successful response.
  fn persist(&self, tier: TierRole, request: &Request, response: &Response) {
    let tiers = Arc::clone(&self.tiers);
    let key = request.cache_key();
    let response = response.clone();

    let handle = tokio::task::spawn_blocking(move || {
      if let Err(e) = tiers.put(tier, &key, &response) {
        warn!(key = %key, error = %e, "background cache write failed");
      }
    });

    if let Ok(mut writes) = self.writes.lock() {
      writes.retain(|handle| !handle.is_finished());
      writes.push(handle);
    }
  }

  /// Wait for every cache write started so far.
  pub async fn flush_writes(&self) {
    let handles = match self.writes.lock() {
      Ok(mut writes) => std::mem::take(&mut *writes),
      Err(_) => return,
    };
    for handle in handles {
      if let Err(e) = handle.await {
        warn!(error = %e, "cache write task failed");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{BlobStore, MemoryStorage, TierNames};
  use crate::net::{Destination, ScriptedNetwork};
  use reqwest::Method;
  use url::Url;

  const ASSET: &str = "https://app.example.com/assets/logo.png";
  const API: &str = "https://api.other.com/models";

  struct Fixture {
    network: Arc<ScriptedNetwork>,
    tiers: Arc<TieredCacheManager>,
    queue: Arc<SyncQueue>,
    interceptor: FetchInterceptor<ScriptedNetwork>,
  }

  fn fixture() -> Fixture {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(ScriptedNetwork::new());
    let tiers = Arc::new(TieredCacheManager::new(storage.clone(), TierNames::new("app")));
    let queue = Arc::new(SyncQueue::new(storage));
    let interceptor = FetchInterceptor::new(network.clone(), tiers.clone(), queue.clone());
    Fixture {
      network,
      tiers,
      queue,
      interceptor,
    }
  }

  fn route(strategy: Strategy, tier: TierRole) -> Route {
    Route {
      rule: "test",
      strategy,
      tier,
    }
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let fx = fixture();
    fx.tiers.put(TierRole::Assets, ASSET, &Response::new(200, "cached")).unwrap();
    fx.network.route(ASSET, Response::new(200, "fresh"));

    let served = fx
      .interceptor
      .execute(route(Strategy::CacheFirst, TierRole::Assets), &get(ASSET))
      .await
      .unwrap();

    assert_eq!(served.source, ServedFrom::Cache);
    assert_eq!(served.response.body, b"cached");
    assert!(fx.network.calls().is_empty());
  }

  #[tokio::test]
  async fn test_cache_first_miss_stores_only_success() {
    let fx = fixture();
    fx.network.route(ASSET, Response::new(200, "fresh"));
    let missing = "https://app.example.com/assets/missing.png";

    let served = fx
      .interceptor
      .execute(route(Strategy::CacheFirst, TierRole::Assets), &get(ASSET))
      .await
      .unwrap();
    assert_eq!(served.source, ServedFrom::Network);

    let not_found = fx
      .interceptor
      .execute(route(Strategy::CacheFirst, TierRole::Assets), &get(missing))
      .await
      .unwrap();
    assert_eq!(not_found.response.status, 404);

    fx.interceptor.flush_writes().await;
    let stored = fx.tiers.get(TierRole::Assets, ASSET).unwrap().unwrap();
    assert_eq!(stored.response.body, b"fresh");
    assert!(fx.tiers.lookup(missing).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_cache_first_offline_miss_propagates() {
    let fx = fixture();
    fx.network.set_online(false);

    let result = fx
      .interceptor
      .execute(route(Strategy::CacheFirst, TierRole::Assets), &get(ASSET))
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_network_first_never_serves_stale_when_online() {
    let fx = fixture();
    let url = "https://app.example.com/version.json";
    fx.tiers.put(TierRole::Dynamic, url, &Response::new(200, "stale")).unwrap();
    fx.network.route(url, Response::new(200, "fresh"));

    let served = fx
      .interceptor
      .execute(route(Strategy::NetworkFirst, TierRole::Dynamic), &get(url))
      .await
      .unwrap();
    assert_eq!(served.source, ServedFrom::Network);
    assert_eq!(served.response.body, b"fresh");

    fx.interceptor.flush_writes().await;
    let stored = fx.tiers.get(TierRole::Dynamic, url).unwrap().unwrap();
    assert_eq!(stored.response.body, b"fresh");
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache() {
    let fx = fixture();
    let url = "https://app.example.com/version.json";
    fx.tiers.put(TierRole::Dynamic, url, &Response::new(200, "stale")).unwrap();
    fx.network.set_online(false);

    let served = fx
      .interceptor
      .execute(route(Strategy::NetworkFirst, TierRole::Dynamic), &get(url))
      .await
      .unwrap();
    assert_eq!(served.source, ServedFrom::CacheFallback);
    assert_eq!(served.response.body, b"stale");

    let missing = fx
      .interceptor
      .execute(
        route(Strategy::NetworkFirst, TierRole::Dynamic),
        &get("https://app.example.com/other.json"),
      )
      .await;
    assert!(missing.is_err());
  }

  #[tokio::test]
  async fn test_navigation_fallbacks() {
    let fx = fixture();
    let root = "https://app.example.com/";
    let request = Request::navigate(Url::parse(root).unwrap());
    fx.network.set_online(false);

    let served = fx
      .interceptor
      .execute(route(Strategy::NavigationFallback, TierRole::Dynamic), &request)
      .await
      .unwrap();
    assert_eq!(served.source, ServedFrom::Fallback);
    assert_eq!(served.response, fallback::offline_page());

    fx.tiers.put(TierRole::Dynamic, root, &Response::new(200, "<app>")).unwrap();
    let served = fx
      .interceptor
      .execute(route(Strategy::NavigationFallback, TierRole::Dynamic), &request)
      .await
      .unwrap();
    assert_eq!(served.source, ServedFrom::CacheFallback);
    assert_eq!(served.response.body, b"<app>");
  }

  #[tokio::test]
  async fn test_navigation_error_status_uses_cache() {
    let fx = fixture();
    let root = "https://app.example.com/";
    fx.tiers.put(TierRole::Dynamic, root, &Response::new(200, "<app>")).unwrap();
    fx.network.route(root, Response::new(503, "down"));

    let served = fx
      .interceptor
      .execute(
        route(Strategy::NavigationFallback, TierRole::Dynamic),
        &Request::navigate(Url::parse(root).unwrap()),
      )
      .await
      .unwrap();
    assert_eq!(served.response.body, b"<app>");
  }

  #[tokio::test]
  async fn test_api_fallback_is_marked() {
    let fx = fixture();
    fx.network.route(API, Response::new(200, "[1]"));

    let fresh = fx
      .interceptor
      .execute(route(Strategy::ApiPolicy, TierRole::Dynamic), &get(API))
      .await
      .unwrap();
    assert_eq!(fresh.response.header(SERVED_FROM_HEADER), None);
    fx.interceptor.flush_writes().await;

    fx.network.set_online(false);
    let degraded = fx
      .interceptor
      .execute(route(Strategy::ApiPolicy, TierRole::Dynamic), &get(API))
      .await
      .unwrap();
    assert_eq!(degraded.source, ServedFrom::CacheFallback);
    assert_eq!(degraded.response.header(SERVED_FROM_HEADER), Some("cache"));
    assert_eq!(degraded.response.body, b"[1]");
  }

  #[tokio::test]
  async fn test_mutation_offline_is_queued_not_cached() {
    let fx = fixture();
    let request = get("https://app.example.com/api/messages")
      .with_method(Method::POST)
      .with_body("hi");
    fx.network.set_online(false);

    let result = fx
      .interceptor
      .execute(route(Strategy::NetworkOnly, TierRole::Dynamic), &request)
      .await;
    assert!(result.is_err());

    let pending = fx.queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].method, "POST");
    assert_eq!(pending[0].body.as_deref(), Some(&b"hi"[..]));
    assert!(fx.tiers.lookup(&request.cache_key()).unwrap().is_none());
  }

  /// Store that refuses every write.
  struct ReadOnlyStore(MemoryStorage);

  impl BlobStore for ReadOnlyStore {
    fn open_tier(&self, tier: &str) -> Result<()> {
      self.0.open_tier(tier)
    }
    fn get(&self, tier: &str, key: &str) -> Result<Option<CachedEntry>> {
      self.0.get(tier, key)
    }
    fn put(&self, _tier: &str, _key: &str, _response: &Response) -> Result<()> {
      Err(color_eyre::eyre::eyre!("read-only filesystem"))
    }
    fn delete(&self, tier: &str, key: &str) -> Result<bool> {
      self.0.delete(tier, key)
    }
    fn keys(&self, tier: &str) -> Result<Vec<String>> {
      self.0.keys(tier)
    }
    fn tiers(&self) -> Result<Vec<String>> {
      self.0.tiers()
    }
    fn delete_tier(&self, tier: &str) -> Result<bool> {
      self.0.delete_tier(tier)
    }
  }

  #[tokio::test]
  async fn test_failed_cache_write_still_returns_response() {
    let network = Arc::new(ScriptedNetwork::new());
    let tiers = Arc::new(TieredCacheManager::new(
      Arc::new(ReadOnlyStore(MemoryStorage::new())),
      TierNames::new("app"),
    ));
    let queue = Arc::new(SyncQueue::new(Arc::new(MemoryStorage::new())));
    let interceptor = FetchInterceptor::new(network.clone(), tiers.clone(), queue);
    let version = "https://app.example.com/version.json";
    network.route(ASSET, Response::new(200, "logo"));
    network.route(version, Response::new(200, "2.0"));

    let asset = interceptor
      .execute(route(Strategy::CacheFirst, TierRole::Assets), &get(ASSET))
      .await
      .unwrap();
    assert_eq!(asset.source, ServedFrom::Network);
    assert_eq!(asset.response.body, b"logo");

    let fresh = interceptor
      .execute(route(Strategy::NetworkFirst, TierRole::Dynamic), &get(version))
      .await
      .unwrap();
    assert_eq!(fresh.source, ServedFrom::Network);
    assert_eq!(fresh.response.body, b"2.0");

    interceptor.flush_writes().await;
    assert!(tiers.lookup(ASSET).unwrap().is_none());
    assert!(tiers.lookup(version).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_image_destination_is_plain_request() {
    let fx = fixture();
    fx.network.set_online(false);
    let request = get(ASSET).with_destination(Destination::Image);

    let result = fx
      .interceptor
      .execute(route(Strategy::CacheFirst, TierRole::Assets), &request)
      .await;
    assert!(result.is_err());
    assert_eq!(fallback::for_request(&request), fallback::placeholder_image());
  }
}
