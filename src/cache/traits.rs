//! Core traits and types for the blob store.

use chrono::{DateTime, Utc};
use color_eyre::Result;

use crate::net::Response;

/// A response held in a tier, with the time it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Durable key → response store, partitioned into independently named tiers.
///
/// Every method is atomic per key. Nothing is promised across keys or tiers;
/// callers that need cross-key consistency order their operations themselves.
pub trait BlobStore: Send + Sync {
  /// Create the tier if it does not exist yet.
  fn open_tier(&self, tier: &str) -> Result<()>;

  fn get(&self, tier: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Upsert. Opens the tier when needed.
  fn put(&self, tier: &str, key: &str, response: &Response) -> Result<()>;

  /// Returns whether an entry was removed.
  fn delete(&self, tier: &str, key: &str) -> Result<bool>;

  /// Keys of the tier in insertion-independent (sorted) order.
  fn keys(&self, tier: &str) -> Result<Vec<String>>;

  /// Names of every opened tier.
  fn tiers(&self) -> Result<Vec<String>>;

  /// Remove the tier and everything in it. Returns whether it existed.
  fn delete_tier(&self, tier: &str) -> Result<bool>;
}
