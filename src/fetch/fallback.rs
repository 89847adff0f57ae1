//! Canned responses used when neither network nor cache can answer.

use crate::net::{Destination, Request, Response};

/// Status of the generic network-error response.
pub const NETWORK_ERROR_STATUS: u16 = 408;

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>Offline</title>
  <style>
    body {
      font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
      margin: 0;
      min-height: 100vh;
      display: flex;
      align-items: center;
      justify-content: center;
      text-align: center;
      background: #1565c0;
      color: white;
    }
    .container { max-width: 400px; padding: 40px; }
    h1 { margin: 0 0 16px 0; font-size: 24px; font-weight: 600; }
    p { margin: 0 0 24px 0; line-height: 1.5; opacity: 0.9; }
    button {
      background: white;
      color: #1565c0;
      border: none;
      padding: 12px 24px;
      border-radius: 8px;
      font-size: 16px;
      cursor: pointer;
    }
  </style>
</head>
<body>
  <div class="container">
    <h1>You are offline</h1>
    <p>Check your connection and try again. Content that was already downloaded is still available.</p>
    <button onclick="window.location.reload()">Retry</button>
  </div>
</body>
</html>
"#;

const PLACEHOLDER_IMAGE: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="200" viewBox="0 0 200 200"><rect width="200" height="200" fill="#f0f0f0"/><text x="100" y="100" text-anchor="middle" dy=".3em" fill="#999">Image unavailable</text></svg>"##;

/// Offline document for failed navigations.
pub fn offline_page() -> Response {
  Response::new(200, OFFLINE_PAGE).with_header("content-type", "text/html; charset=utf-8")
}

/// Placeholder graphic for failed image loads.
pub fn placeholder_image() -> Response {
  Response::new(200, PLACEHOLDER_IMAGE).with_header("content-type", "image/svg+xml")
}

pub fn network_error() -> Response {
  Response::new(NETWORK_ERROR_STATUS, "Network Error").with_header("content-type", "text/plain")
}

/// The canned response matching what `request` was for.
pub fn for_request(request: &Request) -> Response {
  if request.is_navigation() {
    offline_page()
  } else if request.destination == Destination::Image {
    placeholder_image()
  } else {
    network_error()
  }
}
