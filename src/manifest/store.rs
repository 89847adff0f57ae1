use std::sync::Arc;

use color_eyre::Result;
use tracing::warn;

use super::Manifest;
use crate::cache::BlobStore;
use crate::net::Response;

/// Key of the single record in the manifest tier.
const RECORD_KEY: &str = "manifest";

/// Holds the manifest that was active after the last successful reconciliation.
pub struct ManifestStore {
  store: Arc<dyn BlobStore>,
  tier: String,
}

impl ManifestStore {
  pub fn new(store: Arc<dyn BlobStore>, tier: String) -> Self {
    Self { store, tier }
  }

  /// The active manifest, if any.
  ///
  /// A record that no longer parses is reported as absent, which sends the next
  /// activation down the full-rebuild path.
  pub fn load(&self) -> Result<Option<Manifest>> {
    let Some(entry) = self.store.get(&self.tier, RECORD_KEY)? else {
      return Ok(None);
    };

    match Manifest::from_json(&entry.response.body) {
      Ok(manifest) => Ok(Some(manifest)),
      Err(e) => {
        warn!(error = %e, "stored manifest is unreadable, treating as absent");
        Ok(None)
      }
    }
  }

  /// Replace the active manifest as a whole.
  pub fn save(&self, manifest: &Manifest) -> Result<()> {
    let response =
      Response::new(200, manifest.to_json()?).with_header("content-type", "application/json");
    self.store.put(&self.tier, RECORD_KEY, &response)
  }

  pub fn clear(&self) -> Result<()> {
    self.store.delete_tier(&self.tier)?;
    Ok(())
  }

  /// Identity of the active manifest.
  pub fn version(&self) -> Result<Option<String>> {
    self.load()?.map(|manifest| manifest.version()).transpose()
  }
}
