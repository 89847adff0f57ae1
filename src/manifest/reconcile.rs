//! Manifest reconciliation: decide which durable entries survive an upgrade.

use color_eyre::Result;
use serde::Serialize;
use tracing::{error, info, warn};
use url::Url;

use super::{Manifest, ManifestStore, ResourceKey};
use crate::cache::{TierRole, TieredCacheManager};

/// A durable entry scheduled for removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
  pub tier: String,
  pub key: String,
}

/// What reconciliation will do to the durable tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilePlan {
  /// Prior state unknown: delete every durable tier before promoting staging.
  FullRebuild,
  /// Remove exactly these entries; everything else is kept.
  Evict(Vec<Eviction>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
  pub full_rebuild: bool,
  pub evicted: usize,
  pub promoted: usize,
}

/// Diff `previous` against `next` over the current durable `entries` (`(tier, url)` pairs).
///
/// An entry is stale when its key is missing from `next`, or when `next` records a
/// different hash than `previous` did. Entries whose URL yields no key are stale.
pub fn plan(
  previous: Option<&Manifest>,
  next: &Manifest,
  entries: &[(String, String)],
  origin: &Url,
) -> ReconcilePlan {
  let Some(previous) = previous else {
    return ReconcilePlan::FullRebuild;
  };

  let evictions = entries
    .iter()
    .filter(|(_, url)| {
      let key = Url::parse(url)
        .ok()
        .and_then(|url| ResourceKey::from_url(&url, origin));
      match key {
        Some(key) => match next.get(&key) {
          Some(hash) => previous.get(&key) != Some(hash),
          None => true,
        },
        None => true,
      }
    })
    .map(|(tier, key)| Eviction {
      tier: tier.clone(),
      key: key.clone(),
    })
    .collect();

  ReconcilePlan::Evict(evictions)
}

/// Entries of an ungoverned tier that shadow a manifest resource whose content changed.
///
/// Runtime tiers keep whatever they hold, except copies of resources `next` declares
/// with a hash that differs from `previous` (or when there is no `previous`).
pub fn shadowed(
  previous: Option<&Manifest>,
  next: &Manifest,
  entries: &[(String, String)],
  origin: &Url,
) -> Vec<Eviction> {
  entries
    .iter()
    .filter(|(_, url)| {
      let key = Url::parse(url)
        .ok()
        .and_then(|url| ResourceKey::from_url(&url, origin));
      match key.and_then(|key| next.get(&key).map(|hash| (key, hash))) {
        Some((key, hash)) => previous.and_then(|p| p.get(&key)) != Some(hash),
        None => false,
      }
    })
    .map(|(tier, key)| Eviction {
      tier: tier.clone(),
      key: key.clone(),
    })
    .collect()
}

/// Applies reconciliation plans to the tiered cache.
pub struct Reconciler<'a> {
  tiers: &'a TieredCacheManager,
  manifests: &'a ManifestStore,
  origin: &'a Url,
}

impl<'a> Reconciler<'a> {
  pub fn new(tiers: &'a TieredCacheManager, manifests: &'a ManifestStore, origin: &'a Url) -> Self {
    Self {
      tiers,
      manifests,
      origin,
    }
  }

  /// Reconcile against whatever manifest is currently active.
  pub fn run(&self, next: &Manifest) -> Result<ReconcileOutcome> {
    self.guarded(|| {
      let previous = self.manifests.load()?;
      self.apply(previous.as_ref(), next)
    })
  }

  /// Evict stale entries, promote staging into the static tier, record `next`.
  ///
  /// The staging tier is left in place. On any error every durable tier, the
  /// staging tier and the manifest record are deleted before the error is returned.
  pub fn reconcile(&self, previous: Option<&Manifest>, next: &Manifest) -> Result<ReconcileOutcome> {
    self.guarded(|| self.apply(previous, next))
  }

  fn guarded(&self, step: impl FnOnce() -> Result<ReconcileOutcome>) -> Result<ReconcileOutcome> {
    step().map_err(|e| {
      error!(error = %e, "reconciliation failed, wiping cache state");
      self.wipe();
      e
    })
  }

  fn apply(&self, previous: Option<&Manifest>, next: &Manifest) -> Result<ReconcileOutcome> {
    let governed = self.tiers.governed();
    let entries = self.tiers.entries(&governed)?;

    let (full_rebuild, evicted) = match plan(previous, next, &entries, self.origin) {
      ReconcilePlan::FullRebuild => {
        for tier in &governed {
          self.tiers.delete_tier(tier)?;
          self.tiers.store().open_tier(tier)?;
        }
        (true, entries.len())
      }
      ReconcilePlan::Evict(evictions) => {
        for eviction in &evictions {
          self.tiers.evict(&eviction.tier, &eviction.key)?;
        }
        (false, evictions.len())
      }
    };

    let dynamic = vec![self.tiers.names().name(TierRole::Dynamic)];
    let runtime = self.tiers.entries(&dynamic)?;
    let stale = shadowed(previous, next, &runtime, self.origin);
    for eviction in &stale {
      self.tiers.evict(&eviction.tier, &eviction.key)?;
    }
    let evicted = evicted + stale.len();

    // Evictions are committed; only now may staging content land.
    let names = self.tiers.names();
    let promoted = self.tiers.promote(
      &names.name(TierRole::Staging),
      &names.name(TierRole::Static),
    )?;

    self.manifests.save(next)?;

    info!(full_rebuild, evicted, promoted, "reconciled cache");
    Ok(ReconcileOutcome {
      full_rebuild,
      evicted,
      promoted,
    })
  }

  /// Fail-safe: forget everything so the next activation starts from scratch.
  pub fn wipe(&self) {
    let mut doomed = self.tiers.governed();
    doomed.push(self.tiers.names().name(TierRole::Staging));

    for tier in &doomed {
      if let Err(e) = self.tiers.delete_tier(tier) {
        warn!(tier = %tier, error = %e, "failed to delete tier during wipe");
      }
    }
    if let Err(e) = self.manifests.clear() {
      warn!(error = %e, "failed to delete manifest record during wipe");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{BlobStore, CachedEntry, MemoryStorage, TierNames};
  use crate::net::Response;
  use proptest::prelude::*;
  use std::collections::BTreeMap;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Arc;

  const ORIGIN: &str = "https://app.example.com";

  fn origin() -> Url {
    Url::parse(ORIGIN).unwrap()
  }

  fn url(key: &str) -> String {
    format!("{}/{}", ORIGIN, key.trim_start_matches('/'))
  }

  fn manifest(pairs: &[(&str, &str)]) -> Manifest {
    pairs.iter().copied().collect()
  }

  struct Fixture {
    tiers: TieredCacheManager,
    manifests: ManifestStore,
    origin: Url,
  }

  impl Fixture {
    fn new(store: Arc<dyn BlobStore>) -> Self {
      let names = TierNames::new("app");
      Self {
        manifests: ManifestStore::new(store.clone(), names.name(TierRole::Manifest)),
        tiers: TieredCacheManager::new(store, names),
        origin: origin(),
      }
    }

    fn reconciler(&self) -> Reconciler<'_> {
      Reconciler::new(&self.tiers, &self.manifests, &self.origin)
    }

    fn put(&self, role: TierRole, key: &str, body: &str) {
      self.tiers.put(role, &url(key), &Response::new(200, body)).unwrap();
    }

    fn body(&self, role: TierRole, key: &str) -> Option<String> {
      self
        .tiers
        .get(role, &url(key))
        .unwrap()
        .map(|e| String::from_utf8(e.response.body).unwrap())
    }

    fn snapshot(&self) -> BTreeMap<(String, String), Vec<u8>> {
      let governed = self.tiers.governed();
      self
        .tiers
        .entries(&governed)
        .unwrap()
        .into_iter()
        .map(|(tier, key)| {
          let body = self.tiers.store().get(&tier, &key).unwrap().unwrap().response.body;
          ((tier, key), body)
        })
        .collect()
    }
  }

  #[test]
  fn test_plan_without_previous_is_full_rebuild() {
    let next = manifest(&[("/a.js", "h1")]);
    let entries = vec![("app-static".to_string(), url("a.js"))];
    assert_eq!(plan(None, &next, &entries, &origin()), ReconcilePlan::FullRebuild);
  }

  #[test]
  fn test_plan_evicts_changed_removed_and_foreign() {
    let previous = manifest(&[("/a.js", "h1"), ("/b.js", "h2"), ("/gone.js", "h9")]);
    let next = manifest(&[("/a.js", "h1"), ("/b.js", "h3"), ("/new.js", "h4")]);
    let entries = vec![
      ("app-static".to_string(), url("a.js")),
      ("app-static".to_string(), url("b.js")),
      ("app-assets".to_string(), url("gone.js")),
      ("app-assets".to_string(), url("new.js")),
      ("app-assets".to_string(), "https://cdn.example.com/a.js".to_string()),
      ("app-assets".to_string(), "not a url".to_string()),
    ];

    let ReconcilePlan::Evict(evictions) = plan(Some(&previous), &next, &entries, &origin()) else {
      panic!("expected evictions");
    };
    let evicted: Vec<&str> = evictions.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(
      evicted,
      vec![
        url("b.js").as_str(),
        url("gone.js").as_str(),
        url("new.js").as_str(),
        "https://cdn.example.com/a.js",
        "not a url",
      ]
    );
  }

  #[test]
  fn test_versioned_url_keeps_its_entry() {
    let previous = manifest(&[("main.dart.js", "h1")]);
    let entries = vec![("app-static".to_string(), url("main.dart.js?v=42"))];
    assert_eq!(
      plan(Some(&previous), &previous, &entries, &origin()),
      ReconcilePlan::Evict(Vec::new())
    );
  }

  #[test]
  fn test_changed_resource_ends_with_new_bytes() {
    let fx = Fixture::new(Arc::new(MemoryStorage::new()));
    let previous = manifest(&[("/a.js", "h1"), ("/b.js", "h2")]);
    let next = manifest(&[("/a.js", "h1"), ("/b.js", "h3")]);
    fx.put(TierRole::Static, "a.js", "a-v1");
    fx.put(TierRole::Static, "b.js", "b-v1");
    fx.put(TierRole::Staging, "b.js", "b-v2");

    let outcome = fx.reconciler().reconcile(Some(&previous), &next).unwrap();

    assert_eq!(
      outcome,
      ReconcileOutcome {
        full_rebuild: false,
        evicted: 1,
        promoted: 1
      }
    );
    assert_eq!(fx.body(TierRole::Static, "a.js").as_deref(), Some("a-v1"));
    assert_eq!(fx.body(TierRole::Static, "b.js").as_deref(), Some("b-v2"));
    assert_eq!(fx.manifests.load().unwrap(), Some(next));
  }

  #[test]
  fn test_full_rebuild_discards_everything_before_promotion() {
    let fx = Fixture::new(Arc::new(MemoryStorage::new()));
    let next = manifest(&[("/a.js", "h1")]);
    fx.put(TierRole::Static, "a.js", "stale");
    fx.put(TierRole::Assets, "font.ttf", "stale");
    fx.put(TierRole::Staging, "index.html", "shell");

    let outcome = fx.reconciler().reconcile(None, &next).unwrap();

    assert!(outcome.full_rebuild);
    assert_eq!(outcome.evicted, 2);
    assert!(fx.body(TierRole::Static, "a.js").is_none());
    assert!(fx.body(TierRole::Assets, "font.ttf").is_none());
    assert_eq!(fx.body(TierRole::Static, "index.html").as_deref(), Some("shell"));
  }

  #[test]
  fn test_run_uses_stored_manifest() {
    let fx = Fixture::new(Arc::new(MemoryStorage::new()));
    let current = manifest(&[("/a.js", "h1")]);
    fx.manifests.save(&current).unwrap();
    fx.put(TierRole::Static, "a.js", "a");

    let outcome = fx.reconciler().run(&current).unwrap();
    assert!(!outcome.full_rebuild);
    assert_eq!(outcome.evicted, 0);
    assert_eq!(fx.body(TierRole::Static, "a.js").as_deref(), Some("a"));
  }

  #[test]
  fn test_dynamic_tier_is_not_reconciled() {
    let fx = Fixture::new(Arc::new(MemoryStorage::new()));
    let previous = manifest(&[("/a.js", "h1")]);
    fx.put(TierRole::Dynamic, "api/user", "{}");

    fx.reconciler().reconcile(Some(&previous), &previous).unwrap();
    assert!(fx.body(TierRole::Dynamic, "api/user").is_some());
  }

  #[test]
  fn test_dynamic_copy_of_changed_resource_is_evicted() {
    let fx = Fixture::new(Arc::new(MemoryStorage::new()));
    let previous = manifest(&[("main.dart.js", "h1"), ("/", "h0")]);
    let next = manifest(&[("main.dart.js", "h2"), ("/", "h0")]);
    fx.put(TierRole::Dynamic, "main.dart.js", "v1");
    fx.put(TierRole::Dynamic, "", "<html>");
    fx.put(TierRole::Dynamic, "api/user", "{}");

    let outcome = fx.reconciler().reconcile(Some(&previous), &next).unwrap();

    assert_eq!(outcome.evicted, 1);
    assert!(fx.body(TierRole::Dynamic, "main.dart.js").is_none());
    assert_eq!(fx.body(TierRole::Dynamic, "").as_deref(), Some("<html>"));
    assert!(fx.body(TierRole::Dynamic, "api/user").is_some());
  }

  #[test]
  fn test_dynamic_copies_of_declared_resources_go_on_full_rebuild() {
    let fx = Fixture::new(Arc::new(MemoryStorage::new()));
    let next = manifest(&[("main.dart.js", "h1")]);
    fx.put(TierRole::Dynamic, "main.dart.js", "unknown");
    fx.put(TierRole::Dynamic, "api/user", "{}");

    fx.reconciler().reconcile(None, &next).unwrap();

    assert!(fx.body(TierRole::Dynamic, "main.dart.js").is_none());
    assert!(fx.body(TierRole::Dynamic, "api/user").is_some());
  }

  /// Store whose deletes fail once armed.
  struct FlakyStore {
    inner: MemoryStorage,
    fail_deletes: AtomicBool,
  }

  impl BlobStore for FlakyStore {
    fn open_tier(&self, tier: &str) -> Result<()> {
      self.inner.open_tier(tier)
    }
    fn get(&self, tier: &str, key: &str) -> Result<Option<CachedEntry>> {
      self.inner.get(tier, key)
    }
    fn put(&self, tier: &str, key: &str, response: &Response) -> Result<()> {
      self.inner.put(tier, key, response)
    }
    fn delete(&self, tier: &str, key: &str) -> Result<bool> {
      if self.fail_deletes.load(Ordering::SeqCst) {
        return Err(color_eyre::eyre::eyre!("disk full"));
      }
      self.inner.delete(tier, key)
    }
    fn keys(&self, tier: &str) -> Result<Vec<String>> {
      self.inner.keys(tier)
    }
    fn tiers(&self) -> Result<Vec<String>> {
      self.inner.tiers()
    }
    fn delete_tier(&self, tier: &str) -> Result<bool> {
      self.inner.delete_tier(tier)
    }
  }

  #[test]
  fn test_failure_wipes_all_state() {
    let store = Arc::new(FlakyStore {
      inner: MemoryStorage::new(),
      fail_deletes: AtomicBool::new(false),
    });
    let fx = Fixture::new(store.clone());
    let previous = manifest(&[("/a.js", "h1")]);
    let next = manifest(&[("/a.js", "h2")]);
    fx.manifests.save(&previous).unwrap();
    fx.put(TierRole::Static, "a.js", "a-v1");
    fx.put(TierRole::Staging, "a.js", "a-v2");
    store.fail_deletes.store(true, Ordering::SeqCst);

    assert!(fx.reconciler().run(&next).is_err());

    assert!(fx.manifests.load().unwrap().is_none());
    assert!(fx.body(TierRole::Static, "a.js").is_none());
    assert!(fx.body(TierRole::Staging, "a.js").is_none());
  }

  fn arb_manifest() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map("[a-z]{1,6}\\.js", "h[0-9]", 0..8)
  }

  fn to_manifest(map: &BTreeMap<String, String>) -> Manifest {
    map.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
  }

  proptest! {
    #[test]
    fn prop_identical_manifest_evicts_nothing(map in arb_manifest()) {
      let fx = Fixture::new(Arc::new(MemoryStorage::new()));
      let m = to_manifest(&map);
      for key in map.keys() {
        fx.put(TierRole::Static, key, key);
      }

      let outcome = fx.reconciler().reconcile(Some(&m), &m).unwrap();
      prop_assert_eq!(outcome.evicted, 0);
      prop_assert_eq!(fx.tiers.entries(&fx.tiers.governed()).unwrap().len(), map.len());
    }

    #[test]
    fn prop_disjoint_manifests_leave_only_staging(old in arb_manifest(), staged in arb_manifest()) {
      let fx = Fixture::new(Arc::new(MemoryStorage::new()));
      let previous = to_manifest(&old);
      let next: Manifest = staged
        .iter()
        .map(|(k, v)| (format!("new/{}", k), v.clone()))
        .collect::<Vec<_>>()
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
      for key in old.keys() {
        fx.put(TierRole::Static, key, "old");
      }
      for key in staged.keys() {
        fx.put(TierRole::Staging, &format!("new/{}", key), "new");
      }

      fx.reconciler().reconcile(Some(&previous), &next).unwrap();
      let remaining: Vec<String> = fx
        .tiers
        .entries(&fx.tiers.governed())
        .unwrap()
        .into_iter()
        .map(|(_, key)| key)
        .collect();
      let expected: Vec<String> = staged.keys().map(|k| url(&format!("new/{}", k))).collect();
      prop_assert_eq!(remaining, expected);
    }

    #[test]
    fn prop_reconcile_is_idempotent(old in arb_manifest(), new in arb_manifest()) {
      let fx = Fixture::new(Arc::new(MemoryStorage::new()));
      let previous = to_manifest(&old);
      let next = to_manifest(&new);
      for key in old.keys() {
        fx.put(TierRole::Static, key, "old");
      }
      for key in new.keys().step_by(2) {
        fx.put(TierRole::Staging, key, "new");
      }

      fx.reconciler().reconcile(Some(&previous), &next).unwrap();
      let once = fx.snapshot();
      fx.reconciler().reconcile(Some(&previous), &next).unwrap();
      prop_assert_eq!(fx.snapshot(), once);
    }
  }
}
