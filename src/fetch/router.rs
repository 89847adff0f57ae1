//! Strategy routing: which fetch policy handles a request.

use std::collections::BTreeSet;

use serde::Serialize;
use url::Url;

use crate::cache::TierRole;
use crate::manifest::{Manifest, ResourceKey};
use crate::net::Request;

/// Fetch-handling policy for one intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
  /// Mutations: network only, queued for replay when offline
  NetworkOnly,
  NavigationFallback,
  CacheFirst,
  NetworkFirst,
  /// Network first, GET-only cache fallback marked as degraded
  ApiPolicy,
}

/// Outcome of classification: the rule that matched and what it implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
  pub rule: &'static str,
  pub strategy: Strategy,
  /// Tier that successful responses are written to
  pub tier: TierRole,
}

/// One entry of the precedence table.
pub struct Rule {
  pub name: &'static str,
  pub strategy: Strategy,
  pub tier: TierRole,
  matches: fn(&Router, &Request) -> bool,
}

impl Rule {
  fn route(&self) -> Route {
    Route {
      rule: self.name,
      strategy: self.strategy,
      tier: self.tier,
    }
  }
}

/// Engine/runtime directories whose contents are immutable build output.
const ENGINE_DIRS: &[&str] = &["/assets/", "/canvaskit/", "/fonts/", "/flutter_assets/"];
const ENGINE_SUFFIXES: &[&str] = &[".dart.js", ".dart.wasm", ".dart.mjs"];

const STATIC_SUFFIXES: &[&str] = &[
  ".css", ".js", ".mjs", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".webp", ".woff",
  ".woff2", ".ttf", ".otf",
];

/// Shell paths that are always treated as static, in addition to the configured shell.
const SHELL_PATHS: &[&str] = &["/", "/index.html", "/manifest.json", "/favicon.png"];

const NETWORK_FIRST_PREFIXES: &[&str] = &["/api/"];
const NETWORK_FIRST_SUFFIXES: &[&str] = &[".json", "/sw.js"];

const API_MARKERS: &[&str] = &["/v1/", "/graphql"];

/// Precedence table. First match wins.
pub const RULES: &[Rule] = &[
  Rule {
    name: "mutation",
    strategy: Strategy::NetworkOnly,
    tier: TierRole::Dynamic,
    matches: |_, request| !request.is_get(),
  },
  Rule {
    name: "navigation",
    strategy: Strategy::NavigationFallback,
    tier: TierRole::Dynamic,
    matches: |_, request| request.is_navigation(),
  },
  Rule {
    name: "engine-asset",
    strategy: Strategy::CacheFirst,
    tier: TierRole::Assets,
    matches: |_, request| {
      let path = request.url.path();
      ENGINE_DIRS.iter().any(|dir| path.contains(dir))
        || ENGINE_SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
    },
  },
  Rule {
    name: "static-asset",
    strategy: Strategy::CacheFirst,
    tier: TierRole::Static,
    matches: |router, request| {
      let path = request.url.path();
      STATIC_SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
        || SHELL_PATHS.contains(&path)
        || router.is_shell(request)
    },
  },
  Rule {
    name: "network-priority",
    strategy: Strategy::NetworkFirst,
    tier: TierRole::Dynamic,
    matches: |_, request| {
      let path = request.url.path();
      NETWORK_FIRST_PREFIXES.iter().any(|prefix| path.contains(prefix))
        || NETWORK_FIRST_SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
    },
  },
  Rule {
    name: "api",
    strategy: Strategy::ApiPolicy,
    tier: TierRole::Dynamic,
    matches: |router, request| {
      let path = request.url.path();
      !router.is_same_origin(&request.url)
        || API_MARKERS.iter().any(|marker| path.contains(marker))
    },
  },
];

/// Unclassified requests never get stale content.
const DEFAULT_RULE: Rule = Rule {
  name: "default",
  strategy: Strategy::NetworkFirst,
  tier: TierRole::Dynamic,
  matches: |_, _| true,
};

/// Classifies requests against the precedence table and decides interception scope.
pub struct Router {
  origin: Url,
  shell: BTreeSet<ResourceKey>,
}

impl Router {
  pub fn new(origin: Url, shell: impl IntoIterator<Item = ResourceKey>) -> Self {
    Self {
      origin,
      shell: shell.into_iter().collect(),
    }
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  /// Pure function of method, URL and request mode.
  pub fn classify(&self, request: &Request) -> Route {
    RULES
      .iter()
      .find(|rule| (rule.matches)(self, request))
      .unwrap_or(&DEFAULT_RULE)
      .route()
  }

  /// Whether the agent handles `request` at all.
  ///
  /// Same-origin GETs are only shadowed when the manifest declares them; anything
  /// else goes to the native network stack untouched.
  pub fn intercepts(&self, request: &Request, manifest: &Manifest) -> bool {
    if !matches!(request.url.scheme(), "http" | "https") {
      return false;
    }
    if !request.is_get() {
      return true;
    }
    match ResourceKey::from_url(&request.url, &self.origin) {
      Some(key) => manifest.contains(&key),
      None => true,
    }
  }

  fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }

  fn is_shell(&self, request: &Request) -> bool {
    ResourceKey::from_url(&request.url, &self.origin)
      .map(|key| self.shell.contains(&key))
      .unwrap_or(false)
  }
}
