//! Offline-capable resource cache agent.
//!
//! Keeps a versioned, content-addressed record of which resources are available
//! locally, reconciles it against each newly published manifest so that only
//! changed resources are re-fetched, and serves intercepted requests through a
//! per-resource-class fetch strategy.

pub mod agent;
pub mod cache;
pub mod config;
pub mod control;
pub mod event;
pub mod fetch;
pub mod manifest;
pub mod net;
pub mod push;
pub mod sync;
