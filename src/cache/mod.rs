//! Tiered response cache.
//!
//! This module provides:
//! - the `BlobStore` seam: named partitions of key → response
//! - SQLite and in-memory stores
//! - the `TieredCacheManager`, which names tiers by role and moves content between them

mod storage;
mod tiers;
mod traits;

pub use storage::{MemoryStorage, SqliteStorage};
pub use tiers::{TierNames, TierRole, TieredCacheManager};
pub use traits::{BlobStore, CachedEntry};
