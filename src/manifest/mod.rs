//! Published manifests: resource key → content hash.
//!
//! A manifest is immutable once published. Its canonical JSON bytes (sorted keys)
//! are its version identity; there is no separate version counter.

mod reconcile;
mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

pub use reconcile::{plan, shadowed, Eviction, ReconcileOutcome, ReconcilePlan, Reconciler};
pub use store::ManifestStore;

/// Sentinel key for the site root.
pub const ROOT_KEY: &str = "/";

/// Normalized resource path, unique within a manifest.
///
/// Leading slashes, the fragment and any `?v=` cache-busting suffix are dropped;
/// the root collapses to [`ROOT_KEY`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ResourceKey(String);

impl ResourceKey {
  pub fn new(raw: &str) -> Self {
    let raw = raw.split('#').next().unwrap_or_default();
    let raw = match raw.find("?v=") {
      Some(idx) => &raw[..idx],
      None => raw,
    };
    let trimmed = raw.trim_start_matches('/');
    if trimmed.is_empty() {
      Self(ROOT_KEY.to_string())
    } else {
      Self(trimmed.to_string())
    }
  }

  /// Key of a same-origin URL; `None` for anything cross-origin.
  pub fn from_url(url: &Url, origin: &Url) -> Option<Self> {
    if url.origin() != origin.origin() {
      return None;
    }
    let mut raw = url.path().to_string();
    if let Some(query) = url.query() {
      raw.push('?');
      raw.push_str(query);
    }
    Some(Self::new(&raw))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn is_root(&self) -> bool {
    self.0 == ROOT_KEY
  }

  /// Absolute URL of this key under `origin`.
  pub fn to_url(&self, origin: &Url) -> Result<Url> {
    let path = if self.is_root() {
      ROOT_KEY.to_string()
    } else {
      format!("/{}", self.0)
    };
    origin
      .join(&path)
      .map_err(|e| eyre!("Failed to resolve {} against {}: {}", self.0, origin, e))
  }
}

impl From<String> for ResourceKey {
  fn from(raw: String) -> Self {
    Self::new(&raw)
  }
}

impl From<&str> for ResourceKey {
  fn from(raw: &str) -> Self {
    Self::new(raw)
  }
}

impl From<ResourceKey> for String {
  fn from(key: ResourceKey) -> Self {
    key.0
  }
}

impl fmt::Display for ResourceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Opaque content digest. Equal key + equal hash means identical content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
  pub fn new(hash: &str) -> Self {
    Self(hash.to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ContentHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Mapping of resource key to content hash for one published version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
  entries: BTreeMap<ResourceKey, ContentHash>,
}

impl Manifest {
  pub fn from_json(bytes: &[u8]) -> Result<Self> {
    serde_json::from_slice(bytes).map_err(|e| eyre!("Failed to parse manifest: {}", e))
  }

  pub fn load(path: &Path) -> Result<Self> {
    let bytes = std::fs::read(path)
      .map_err(|e| eyre!("Failed to read manifest {}: {}", path.display(), e))?;
    Self::from_json(&bytes).map_err(|e| eyre!("{} ({})", e, path.display()))
  }

  /// Canonical serialized form. These bytes are the manifest's identity.
  pub fn to_json(&self) -> Result<Vec<u8>> {
    serde_json::to_vec(&self.entries).map_err(|e| eyre!("Failed to serialize manifest: {}", e))
  }

  /// Hex SHA-256 of the canonical bytes.
  pub fn version(&self) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(self.to_json()?);
    Ok(hex::encode(hasher.finalize()))
  }

  pub fn get(&self, key: &ResourceKey) -> Option<&ContentHash> {
    self.entries.get(key)
  }

  pub fn contains(&self, key: &ResourceKey) -> bool {
    self.entries.contains_key(key)
  }

  pub fn insert(&mut self, key: impl Into<ResourceKey>, hash: ContentHash) {
    self.entries.insert(key.into(), hash);
  }

  pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
    self.entries.keys()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Manifest {
  fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
    let mut manifest = Manifest::default();
    for (key, hash) in iter {
      manifest.insert(key, ContentHash::new(hash));
    }
    manifest
  }
}
