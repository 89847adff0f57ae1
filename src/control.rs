//! Out-of-band commands sent to the agent and their replies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A recognized control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
  /// Activate the waiting instance without waiting for clients to close
  SkipWaiting,
  GetVersion,
  /// Delete every tier and the manifest record
  ClearCache,
  /// Fetch and store these URLs in the dynamic tier
  CacheUrls(Vec<String>),
  /// Fetch every manifest resource that is not cached yet
  DownloadOffline,
  /// Anything this agent does not understand; ignored
  Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum Tagged {
  SkipWaiting,
  GetVersion,
  ClearCache,
  CacheUrls {
    #[serde(default)]
    urls: Option<Vec<String>>,
    #[serde(default)]
    payload: Option<UrlsPayload>,
  },
  DownloadOffline,
}

#[derive(Debug, Deserialize)]
struct UrlsPayload {
  #[serde(default)]
  urls: Vec<String>,
}

impl ControlMessage {
  /// Interpret a message posted by the host. Never fails: unrecognized input is `Unknown`.
  pub fn parse(data: &Value) -> Self {
    if let Value::String(legacy) = data {
      return match legacy.as_str() {
        "skipWaiting" => Self::SkipWaiting,
        "downloadOffline" => Self::DownloadOffline,
        _ => Self::Unknown,
      };
    }

    match serde_json::from_value::<Tagged>(data.clone()) {
      Ok(Tagged::SkipWaiting) => Self::SkipWaiting,
      Ok(Tagged::GetVersion) => Self::GetVersion,
      Ok(Tagged::ClearCache) => Self::ClearCache,
      Ok(Tagged::CacheUrls { urls, payload }) => Self::CacheUrls(
        urls
          .or_else(|| payload.map(|p| p.urls))
          .unwrap_or_default(),
      ),
      Ok(Tagged::DownloadOffline) => Self::DownloadOffline,
      Err(_) => Self::Unknown,
    }
  }
}

/// Reply sent back on the message's reply channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ControlReply {
  Version { version: Option<String> },
  Success { success: bool },
}
