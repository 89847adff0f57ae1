//! Durable queue of mutations that failed while offline, replayed on a sync event.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::net::{Network, Request};

/// A request waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncTask {
  /// Assigned by the log on append; increases with insertion order
  pub id: i64,
  pub method: String,
  pub url: String,
  pub headers: Vec<(String, String)>,
  #[serde(skip)]
  pub body: Option<Vec<u8>>,
  pub enqueued_at: DateTime<Utc>,
}

impl SyncTask {
  pub fn from_request(request: &Request) -> Self {
    Self {
      id: 0,
      method: request.method.to_string(),
      url: request.url.to_string(),
      headers: request.headers.clone(),
      body: request.body.clone(),
      enqueued_at: Utc::now(),
    }
  }

  /// Rebuild the original request.
  pub fn to_request(&self) -> Result<Request> {
    let url = Url::parse(&self.url).map_err(|e| eyre!("Invalid task url {}: {}", self.url, e))?;
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| eyre!("Invalid task method {}: {}", self.method, e))?;

    let mut request = Request::get(url).with_method(method);
    request.headers = self.headers.clone();
    request.body = self.body.clone();
    Ok(request)
  }
}

/// Storage seam for the queue.
pub trait TaskLog: Send + Sync {
  /// Persist `task` and return its assigned id. The task's own id is ignored.
  fn append(&self, task: &SyncTask) -> Result<i64>;

  /// All tasks in insertion order.
  fn list(&self) -> Result<Vec<SyncTask>>;

  fn remove(&self, id: i64) -> Result<bool>;
}

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  /// Delivered and removed
  pub replayed: usize,
  /// Rejected by the server (4xx) and removed
  pub dropped: usize,
  /// Still queued for the next pass
  pub remaining: usize,
}

pub struct SyncQueue {
  log: Arc<dyn TaskLog>,
}

impl SyncQueue {
  pub fn new(log: Arc<dyn TaskLog>) -> Self {
    Self { log }
  }

  /// Queue a failed mutation. GET requests are never queued.
  pub fn enqueue(&self, request: &Request) -> Result<SyncTask> {
    if request.is_get() {
      return Err(eyre!("Refusing to queue GET {}", request.url));
    }

    let mut task = SyncTask::from_request(request);
    task.id = self.log.append(&task)?;
    Ok(task)
  }

  pub fn pending(&self) -> Result<Vec<SyncTask>> {
    self.log.list()
  }

  /// Replay every queued task once, in insertion order.
  ///
  /// 2xx and 3xx remove the task. 4xx removes it as a permanent failure. A
  /// transport error or 5xx leaves it queued.
  pub async fn drain<N: Network>(&self, network: &N) -> Result<DrainReport> {
    let mut report = DrainReport::default();

    for task in self.log.list()? {
      let request = match task.to_request() {
        Ok(request) => request,
        Err(e) => {
          warn!(id = task.id, error = %e, "dropping unreplayable task");
          self.log.remove(task.id)?;
          report.dropped += 1;
          continue;
        }
      };

      match network.fetch(&request).await {
        Ok(response) if response.status < 400 => {
          self.log.remove(task.id)?;
          report.replayed += 1;
          debug!(id = task.id, status = response.status, "replayed");
        }
        Ok(response) if response.status < 500 => {
          self.log.remove(task.id)?;
          report.dropped += 1;
          warn!(
            id = task.id,
            method = %task.method,
            url = %task.url,
            status = response.status,
            "server rejected queued request, dropping"
          );
        }
        Ok(response) => {
          report.remaining += 1;
          debug!(id = task.id, status = response.status, "server error, keeping");
        }
        Err(e) => {
          report.remaining += 1;
          debug!(id = task.id, error = %e, "still offline, keeping");
        }
      }
    }

    info!(
      replayed = report.replayed,
      dropped = report.dropped,
      remaining = report.remaining,
      "sync queue drained"
    );
    Ok(report)
  }
}
