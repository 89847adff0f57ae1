//! Request and response values exchanged between the host, the agent and the network.

use base64::prelude::{Engine as _, BASE64_STANDARD};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// How a body travels on the host channel. Text stays readable; anything else is base64.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
  #[default]
  Utf8,
  Base64,
}

fn encode_body(body: &[u8]) -> (String, BodyEncoding) {
  match std::str::from_utf8(body) {
    Ok(text) => (text.to_string(), BodyEncoding::Utf8),
    Err(_) => (BASE64_STANDARD.encode(body), BodyEncoding::Base64),
  }
}

fn decode_body(body: String, encoding: BodyEncoding) -> Result<Vec<u8>, String> {
  match encoding {
    BodyEncoding::Utf8 => Ok(body.into_bytes()),
    BodyEncoding::Base64 => BASE64_STANDARD
      .decode(body.as_bytes())
      .map_err(|e| format!("invalid base64 body: {}", e)),
  }
}

/// How the host issued the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
  /// Full document load
  Navigate,
  SameOrigin,
  #[default]
  Cors,
  NoCors,
}

/// What the requested resource will be used as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Document,
  Image,
  Script,
  Style,
  Font,
  #[default]
  #[serde(other)]
  Empty,
}

/// Whether the network layer may answer from an intermediate HTTP cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
  #[default]
  Default,
  /// Bypass every intermediate cache
  Reload,
}

/// An intercepted request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "WireRequest")]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub destination: Destination,
  pub cache: CacheMode,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  /// A plain GET for `url`.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::default(),
      destination: Destination::default(),
      cache: CacheMode::default(),
      headers: Vec::new(),
      body: None,
    }
  }

  /// A navigation (document load) for `url`.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      destination: Destination::Document,
      ..Self::get(url)
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_cache(mut self, cache: CacheMode) -> Self {
    self.cache = cache;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Key under which responses to this request are cached: the URL without fragment.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.to_string()
  }
}

/// Wire form of a request as the host sends it.
#[derive(Debug, Deserialize)]
struct WireRequest {
  url: String,
  #[serde(default = "default_method")]
  method: String,
  #[serde(default)]
  mode: RequestMode,
  #[serde(default)]
  destination: Destination,
  #[serde(default)]
  cache: CacheMode,
  #[serde(default)]
  headers: Vec<(String, String)>,
  #[serde(default)]
  body: Option<String>,
  #[serde(default)]
  body_encoding: BodyEncoding,
}

fn default_method() -> String {
  "GET".to_string()
}

impl TryFrom<WireRequest> for Request {
  type Error = String;

  fn try_from(wire: WireRequest) -> Result<Self, Self::Error> {
    let url = Url::parse(&wire.url).map_err(|e| format!("invalid url {}: {}", wire.url, e))?;
    let method = Method::from_bytes(wire.method.to_uppercase().as_bytes())
      .map_err(|e| format!("invalid method {}: {}", wire.method, e))?;
    let body = match wire.body {
      Some(body) => Some(decode_body(body, wire.body_encoding)?),
      None => None,
    };

    Ok(Self {
      method,
      url,
      mode: wire.mode,
      destination: wire.destination,
      cache: wire.cache,
      headers: wire.headers,
      body,
    })
  }
}

/// A response as stored in and served from the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireResponse", try_from = "WireResponse")]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

/// Wire form of a response.
#[derive(Debug, Serialize, Deserialize)]
struct WireResponse {
  status: u16,
  #[serde(default)]
  headers: Vec<(String, String)>,
  #[serde(default)]
  body: String,
  #[serde(default)]
  body_encoding: BodyEncoding,
}

impl From<Response> for WireResponse {
  fn from(response: Response) -> Self {
    let (body, body_encoding) = encode_body(&response.body);
    Self {
      status: response.status,
      headers: response.headers,
      body,
      body_encoding,
    }
  }
}

impl TryFrom<WireResponse> for Response {
  type Error = String;

  fn try_from(wire: WireResponse) -> Result<Self, Self::Error> {
    Ok(Self {
      status: wire.status,
      headers: wire.headers,
      body: decode_body(wire.body, wire.body_encoding)?,
    })
  }
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// Set a header, replacing any existing value with the same (case-insensitive) name.
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// 2xx status.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }
}
