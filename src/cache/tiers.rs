//! Tiered cache manager: role-named partitions on top of a blob store.

use std::sync::Arc;

use color_eyre::Result;
use serde::Serialize;
use tracing::debug;

use super::traits::{BlobStore, CachedEntry};
use crate::net::Response;

/// What a tier is for. Tier names derive from the role, never from a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TierRole {
  /// Application shell and static files, governed by the manifest
  Static,
  /// Large engine/runtime assets, governed by the manifest
  Assets,
  /// Runtime responses, managed by the application
  Dynamic,
  /// Shell files fetched during install, promoted at activation
  Staging,
  /// The single active-manifest record
  Manifest,
}

impl TierRole {
  pub fn as_str(&self) -> &'static str {
    match self {
      TierRole::Static => "static",
      TierRole::Assets => "assets",
      TierRole::Dynamic => "dynamic",
      TierRole::Staging => "staging",
      TierRole::Manifest => "manifest",
    }
  }
}

/// Stable tier names under a common prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierNames {
  prefix: String,
}

impl TierNames {
  pub fn new(prefix: &str) -> Self {
    Self {
      prefix: prefix.to_string(),
    }
  }

  pub fn name(&self, role: TierRole) -> String {
    format!("{}-{}", self.prefix, role.as_str())
  }
}

/// Owns the named tiers and the moves between them.
pub struct TieredCacheManager {
  store: Arc<dyn BlobStore>,
  names: TierNames,
}

/// Lookup order when serving from cache.
const LOOKUP_ORDER: [TierRole; 3] = [TierRole::Static, TierRole::Assets, TierRole::Dynamic];

impl TieredCacheManager {
  pub fn new(store: Arc<dyn BlobStore>, names: TierNames) -> Self {
    Self { store, names }
  }

  pub fn names(&self) -> &TierNames {
    &self.names
  }

  pub fn store(&self) -> &Arc<dyn BlobStore> {
    &self.store
  }

  pub fn open_tier(&self, role: TierRole) -> Result<String> {
    let name = self.names.name(role);
    self.store.open_tier(&name)?;
    Ok(name)
  }

  /// Manifest-governed durable tiers: the ones reconciliation may evict from.
  pub fn governed(&self) -> Vec<String> {
    vec![
      self.names.name(TierRole::Static),
      self.names.name(TierRole::Assets),
    ]
  }

  /// First cached response for `key` across the serving tiers.
  pub fn lookup(&self, key: &str) -> Result<Option<CachedEntry>> {
    for role in LOOKUP_ORDER {
      if let Some(entry) = self.store.get(&self.names.name(role), key)? {
        return Ok(Some(entry));
      }
    }
    Ok(None)
  }

  pub fn get(&self, role: TierRole, key: &str) -> Result<Option<CachedEntry>> {
    self.store.get(&self.names.name(role), key)
  }

  pub fn put(&self, role: TierRole, key: &str, response: &Response) -> Result<()> {
    self.store.put(&self.names.name(role), key, response)
  }

  pub fn evict(&self, tier: &str, key: &str) -> Result<bool> {
    let removed = self.store.delete(tier, key)?;
    if removed {
      debug!(tier, key, "evicted");
    }
    Ok(removed)
  }

  pub fn delete_tier(&self, name: &str) -> Result<bool> {
    self.store.delete_tier(name)
  }

  /// Copy every entry of `from` into `to`, overwriting existing keys.
  ///
  /// Running it again from the same source yields the same destination contents.
  pub fn promote(&self, from: &str, to: &str) -> Result<usize> {
    self.store.open_tier(to)?;

    let mut promoted = 0;
    for key in self.store.keys(from)? {
      if let Some(entry) = self.store.get(from, &key)? {
        self.store.put(to, &key, &entry.response)?;
        promoted += 1;
      }
    }

    debug!(from, to, promoted, "promoted tier");
    Ok(promoted)
  }

  /// `(tier, key)` for every entry in `tiers`.
  pub fn entries(&self, tiers: &[String]) -> Result<Vec<(String, String)>> {
    let mut entries = Vec::new();
    for tier in tiers {
      for key in self.store.keys(tier)? {
        entries.push((tier.clone(), key));
      }
    }
    Ok(entries)
  }

  /// Delete every tier present in the store, whatever its name.
  pub fn clear_all(&self) -> Result<usize> {
    let tiers = self.store.tiers()?;
    for tier in &tiers {
      self.store.delete_tier(tier)?;
    }
    Ok(tiers.len())
  }

  /// Entry count per existing tier.
  pub fn counts(&self) -> Result<Vec<(String, usize)>> {
    self
      .store
      .tiers()?
      .into_iter()
      .map(|tier| -> Result<(String, usize)> {
        let count = self.store.keys(&tier)?.len();
        Ok((tier, count))
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;

  fn manager() -> TieredCacheManager {
    TieredCacheManager::new(Arc::new(MemoryStorage::new()), TierNames::new("app"))
  }

  #[test]
  fn test_names_are_role_based() {
    let names = TierNames::new("app");
    assert_eq!(names.name(TierRole::Static), "app-static");
    assert_eq!(names.name(TierRole::Staging), "app-staging");
    assert_eq!(names.name(TierRole::Manifest), "app-manifest");
  }

  #[test]
  fn test_promote_overwrites_and_is_idempotent() {
    let tiers = manager();
    let staging = tiers.names().name(TierRole::Staging);
    let durable = tiers.names().name(TierRole::Static);

    tiers.put(TierRole::Static, "k1", &Response::new(200, "old")).unwrap();
    tiers.put(TierRole::Static, "k2", &Response::new(200, "keep")).unwrap();
    tiers.put(TierRole::Staging, "k1", &Response::new(200, "new")).unwrap();

    assert_eq!(tiers.promote(&staging, &durable).unwrap(), 1);
    let first = tiers.entries(&[durable.clone()]).unwrap();
    assert_eq!(tiers.promote(&staging, &durable).unwrap(), 1);
    assert_eq!(tiers.entries(&[durable]).unwrap(), first);

    let k1 = tiers.get(TierRole::Static, "k1").unwrap().unwrap();
    assert_eq!(k1.response.body, b"new");
    let k2 = tiers.get(TierRole::Static, "k2").unwrap().unwrap();
    assert_eq!(k2.response.body, b"keep");
  }

  #[test]
  fn test_lookup_prefers_static_over_dynamic() {
    let tiers = manager();
    tiers.put(TierRole::Dynamic, "k", &Response::new(200, "dynamic")).unwrap();
    assert_eq!(tiers.lookup("k").unwrap().unwrap().response.body, b"dynamic");

    tiers.put(TierRole::Static, "k", &Response::new(200, "static")).unwrap();
    assert_eq!(tiers.lookup("k").unwrap().unwrap().response.body, b"static");

    assert!(tiers.lookup("missing").unwrap().is_none());
  }

  #[test]
  fn test_clear_all_removes_unknown_tiers_too() {
    let tiers = manager();
    tiers.put(TierRole::Dynamic, "k", &Response::new(200, "x")).unwrap();
    tiers.store().put("legacy-v1", "k", &Response::new(200, "x")).unwrap();

    assert_eq!(tiers.clear_all().unwrap(), 2);
    assert!(tiers.counts().unwrap().is_empty());
  }
}
