//! Network seam: request/response values, the `Network` trait and its implementations.

mod client;
mod scripted;
mod types;

pub use client::{HttpNetwork, Network};
pub use scripted::ScriptedNetwork;
pub use types::{BodyEncoding, CacheMode, Destination, Request, RequestMode, Response};
