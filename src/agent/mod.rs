//! The agent: one instance of the cache protocol for one published manifest.
//!
//! Everything the host does to the agent arrives as an [`AgentEvent`] and is
//! answered with an [`AgentReply`]. Install stages the application shell,
//! activate reconciles the durable tiers against the manifest, and from then on
//! fetches are intercepted.

mod lifecycle;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

pub use lifecycle::{Lifecycle, Phase};

use crate::cache::{BlobStore, TierNames, TierRole, TieredCacheManager};
use crate::config::Config;
use crate::control::{ControlMessage, ControlReply};
use crate::fetch::{fallback, FetchInterceptor, Router, ServedFrom};
use crate::manifest::{Manifest, ManifestStore, ReconcileOutcome, Reconciler, ResourceKey};
use crate::net::{CacheMode, Network, Request, Response};
use crate::push::{ClickAction, Notification, NotificationClick};
use crate::sync::{DrainReport, SyncQueue, TaskLog};

/// Parallel fetches when downloading the whole manifest.
const DOWNLOAD_CONCURRENCY: usize = 8;

/// Everything the host can tell the agent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
  Install,
  Activate,
  Fetch { request: Request },
  /// A control message posted by a client
  Message { data: Value },
  Push {
    #[serde(default)]
    data: Option<String>,
  },
  NotificationClick(NotificationClick),
  Sync { tag: String },
}

/// The agent's answer to one event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentReply {
  Installed {
    staged: usize,
    /// Activation should follow without waiting for clients to close
    activate_next: bool,
  },
  Activated {
    version: String,
    outcome: ReconcileOutcome,
  },
  /// Not handled; the host performs the request itself
  Passthrough,
  Respond {
    rule: &'static str,
    source: ServedFrom,
    response: Response,
  },
  Control {
    #[serde(skip_serializing_if = "Option::is_none")]
    reply: Option<ControlReply>,
  },
  Notification {
    notification: Notification,
  },
  Click {
    click: ClickAction,
  },
  Synced {
    report: DrainReport,
  },
  Ignored,
  Failed {
    message: String,
  },
}

/// Snapshot of persisted state.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
  pub phase: Phase,
  /// Version of the active (last reconciled) manifest
  pub active_version: Option<String>,
  /// Version of the manifest this instance was started with
  pub published_version: String,
  pub tiers: BTreeMap<String, usize>,
  pub queued: usize,
}

pub struct AgentContext<N: Network> {
  origin: Url,
  shell: Vec<ResourceKey>,
  sync_tag: String,
  notification: Notification,
  manifest: Manifest,
  router: Router,
  tiers: Arc<TieredCacheManager>,
  manifests: ManifestStore,
  queue: Arc<SyncQueue>,
  network: Arc<N>,
  interceptor: FetchInterceptor<N>,
  lifecycle: Mutex<Lifecycle>,
}

impl<N: Network> AgentContext<N> {
  /// Build an agent for `manifest` over `storage`.
  pub fn new<S>(config: &Config, manifest: Manifest, storage: Arc<S>, network: N) -> Self
  where
    S: BlobStore + TaskLog + 'static,
  {
    let names = TierNames::new(&config.cache_prefix);
    let shell: Vec<ResourceKey> = config.shell.iter().map(|s| ResourceKey::new(s)).collect();

    let tiers = Arc::new(TieredCacheManager::new(storage.clone(), names.clone()));
    let manifests = ManifestStore::new(storage.clone(), names.name(TierRole::Manifest));
    let queue = Arc::new(SyncQueue::new(storage));
    let network = Arc::new(network);
    let interceptor = FetchInterceptor::new(network.clone(), tiers.clone(), queue.clone());

    Self {
      origin: config.origin.clone(),
      router: Router::new(config.origin.clone(), shell.clone()),
      shell,
      sync_tag: config.sync_tag.clone(),
      notification: config.notification.clone(),
      manifest,
      tiers,
      manifests,
      queue,
      network,
      interceptor,
      lifecycle: Mutex::new(Lifecycle::new(config.skip_waiting)),
    }
  }

  pub fn network(&self) -> &N {
    &self.network
  }

  pub fn tiers(&self) -> &TieredCacheManager {
    &self.tiers
  }

  pub fn manifests(&self) -> &ManifestStore {
    &self.manifests
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  pub fn phase(&self) -> Result<Phase> {
    self.with_lifecycle(|lifecycle| lifecycle.phase())
  }

  fn with_lifecycle<T>(&self, f: impl FnOnce(&mut Lifecycle) -> T) -> Result<T> {
    let mut lifecycle = self
      .lifecycle
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(f(&mut lifecycle))
  }

  /// Handle one event.
  pub async fn dispatch(&self, event: AgentEvent) -> Result<AgentReply> {
    match event {
      AgentEvent::Install => self.install().await,
      AgentEvent::Activate => self.activate(),
      AgentEvent::Fetch { request } => self.handle_fetch(&request).await,
      AgentEvent::Message { data } => self.handle_message(&data).await,
      AgentEvent::Push { data } => Ok(AgentReply::Notification {
        notification: Notification::from_push(data.as_deref(), &self.notification),
      }),
      AgentEvent::NotificationClick(click) => Ok(AgentReply::Click {
        click: click.resolve(),
      }),
      AgentEvent::Sync { tag } => {
        if tag == self.sync_tag {
          Ok(AgentReply::Synced {
            report: self.drain().await?,
          })
        } else {
          debug!(tag = %tag, "ignoring unknown sync tag");
          Ok(AgentReply::Ignored)
        }
      }
    }
  }

  /// Fetch the application shell into staging, bypassing HTTP caches.
  ///
  /// All-or-nothing: if any shell file fails, staging is deleted and the
  /// instance goes back to `Parsed`.
  pub async fn install(&self) -> Result<AgentReply> {
    self.with_lifecycle(|lifecycle| lifecycle.begin_install())??;

    let result = self.stage_shell().await;
    if let Err(e) = &result {
      warn!(error = %e, "install failed, discarding staging");
      let staging = self.tiers.names().name(TierRole::Staging);
      if let Err(e) = self.tiers.delete_tier(&staging) {
        warn!(error = %e, "failed to delete staging");
      }
    }
    let skip_waiting = self.with_lifecycle(|lifecycle| {
      lifecycle.finish(result.is_ok());
      lifecycle.skip_waiting()
    })?;

    let staged = result?;
    info!(staged, "installed");
    Ok(AgentReply::Installed {
      staged,
      activate_next: skip_waiting,
    })
  }

  async fn stage_shell(&self) -> Result<usize> {
    let staging = self.tiers.names().name(TierRole::Staging);
    self.tiers.delete_tier(&staging)?;

    let requests = self
      .shell
      .iter()
      .map(|key| -> Result<Request> {
        Ok(Request::get(key.to_url(&self.origin)?).with_cache(CacheMode::Reload))
      })
      .collect::<Result<Vec<_>>>()?;

    let responses = self.fetch_all(&requests).await?;

    self.tiers.open_tier(TierRole::Staging)?;
    for (request, response) in requests.iter().zip(&responses) {
      self.tiers.put(TierRole::Staging, &request.cache_key(), response)?;
    }
    Ok(responses.len())
  }

  /// Reconcile the durable tiers against this instance's manifest and take control.
  pub fn activate(&self) -> Result<AgentReply> {
    self.with_lifecycle(|lifecycle| lifecycle.begin_activate())??;

    let reconciler = Reconciler::new(&self.tiers, &self.manifests, &self.origin);
    let result = reconciler.run(&self.manifest).and_then(|outcome| {
      let version = self.manifest.version()?;
      Ok((version, outcome))
    });
    self.with_lifecycle(|lifecycle| lifecycle.finish(result.is_ok()))?;

    let (version, outcome) = result?;
    let staging = self.tiers.names().name(TierRole::Staging);
    if let Err(e) = self.tiers.delete_tier(&staging) {
      warn!(error = %e, "failed to delete staging after activation");
    }

    info!(version = %version, "activated");
    Ok(AgentReply::Activated { version, outcome })
  }

  pub async fn handle_fetch(&self, request: &Request) -> Result<AgentReply> {
    let claimed = self.with_lifecycle(|lifecycle| lifecycle.is_claimed())?;
    if !claimed || !self.router.intercepts(request, &self.manifest) {
      return Ok(AgentReply::Passthrough);
    }

    let route = self.router.classify(request);
    debug!(url = %request.url, rule = route.rule, "intercepted");

    let (source, response) = match self.interceptor.execute(route, request).await {
      Ok(served) => (served.source, served.response),
      Err(e) => {
        debug!(url = %request.url, error = %e, "no response, using fallback");
        (ServedFrom::Fallback, fallback::for_request(request))
      }
    };

    Ok(AgentReply::Respond {
      rule: route.rule,
      source,
      response,
    })
  }

  async fn handle_message(&self, data: &Value) -> Result<AgentReply> {
    let reply = match ControlMessage::parse(data) {
      ControlMessage::SkipWaiting => {
        let activate_now = self.with_lifecycle(|lifecycle| lifecycle.request_skip_waiting())?;
        if activate_now {
          return self.activate();
        }
        None
      }
      ControlMessage::GetVersion => Some(ControlReply::Version {
        version: self.manifests.version()?,
      }),
      ControlMessage::ClearCache => Some(ControlReply::Success {
        success: report("clear cache", self.clear_all()),
      }),
      ControlMessage::CacheUrls(urls) => Some(ControlReply::Success {
        success: report("cache urls", self.prefetch(&urls).await),
      }),
      ControlMessage::DownloadOffline => Some(ControlReply::Success {
        success: report("download offline", self.download_offline().await),
      }),
      ControlMessage::Unknown => {
        debug!(message = %data, "ignoring unknown control message");
        return Ok(AgentReply::Ignored);
      }
    };

    Ok(AgentReply::Control { reply })
  }

  /// Delete every tier and the manifest record.
  pub fn clear_all(&self) -> Result<usize> {
    let cleared = self.tiers.clear_all()?;
    self.manifests.clear()?;
    info!(cleared, "cleared all tiers");
    Ok(cleared)
  }

  /// Fetch `urls` and store them in the dynamic tier, only if every fetch succeeds.
  pub async fn prefetch(&self, urls: &[String]) -> Result<usize> {
    let requests = urls
      .iter()
      .map(|url| {
        self
          .origin
          .join(url)
          .map(Request::get)
          .map_err(|e| eyre!("Invalid url {}: {}", url, e))
      })
      .collect::<Result<Vec<_>>>()?;

    let responses = self.fetch_all(&requests).await?;
    for (request, response) in requests.iter().zip(&responses) {
      self.tiers.put(TierRole::Dynamic, &request.cache_key(), response)?;
    }
    Ok(responses.len())
  }

  /// Fetch every manifest resource that is not cached yet into the static tier.
  ///
  /// Best effort: individual failures are logged and skipped.
  pub async fn download_offline(&self) -> Result<usize> {
    let mut missing = Vec::new();
    for key in self.manifest.keys() {
      let request = Request::get(key.to_url(&self.origin)?);
      if self.tiers.lookup(&request.cache_key())?.is_none() {
        missing.push(request);
      }
    }

    let network = &self.network;
    let results: Vec<(Request, Result<Response>)> = stream::iter(missing)
      .map(|request| async move {
        let response = network.fetch(&request).await;
        (request, response)
      })
      .buffer_unordered(DOWNLOAD_CONCURRENCY)
      .collect()
      .await;

    let mut stored = 0;
    for (request, result) in results {
      match result {
        Ok(response) if response.is_ok() => {
          self.tiers.put(TierRole::Static, &request.cache_key(), &response)?;
          stored += 1;
        }
        Ok(response) => {
          warn!(url = %request.url, status = response.status, "skipping resource")
        }
        Err(e) => warn!(url = %request.url, error = %e, "failed to download resource"),
      }
    }

    info!(stored, "downloaded offline resources");
    Ok(stored)
  }

  /// Replay queued mutations.
  pub async fn drain(&self) -> Result<DrainReport> {
    self.queue.drain(self.network.as_ref()).await
  }

  pub fn status(&self) -> Result<Status> {
    Ok(Status {
      phase: self.phase()?,
      active_version: self.manifests.version()?,
      published_version: self.manifest.version()?,
      tiers: self.tiers.counts()?.into_iter().collect(),
      queued: self.queue.pending()?.len(),
    })
  }

  /// Wait for background cache writes started by intercepted fetches.
  pub async fn flush_writes(&self) {
    self.interceptor.flush_writes().await;
  }

  /// Fetch every request concurrently; any failure or non-2xx fails the whole set.
  async fn fetch_all(&self, requests: &[Request]) -> Result<Vec<Response>> {
    let results = futures::future::join_all(requests.iter().map(|r| self.network.fetch(r))).await;

    requests
      .iter()
      .zip(results)
      .map(|(request, result)| -> Result<Response> {
        let response = result?;
        if response.is_ok() {
          Ok(response)
        } else {
          Err(eyre!("Fetching {} returned {}", request.url, response.status))
        }
      })
      .collect()
  }
}

/// Collapse a command result into the success flag of its reply.
fn report<T>(command: &str, result: Result<T>) -> bool {
  match result {
    Ok(_) => true,
    Err(e) => {
      warn!(command, error = %e, "control command failed");
      false
    }
  }
}
