//! Push and notification-click contracts. Rendering is the host's job.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// A button offered on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
}

/// Notification the host should display for a push.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: Option<String>,
  pub badge: Option<String>,
  pub tag: Option<String>,
  /// Where a click should navigate
  pub url: Option<String>,
  pub require_interaction: bool,
  pub actions: Vec<NotificationAction>,
}

impl Default for Notification {
  fn default() -> Self {
    Self {
      title: "offcache".to_string(),
      body: "You have a new message".to_string(),
      icon: Some("/icons/Icon-192.png".to_string()),
      badge: Some("/icons/Icon-96.png".to_string()),
      tag: Some("offcache-notification".to_string()),
      url: None,
      require_interaction: false,
      actions: vec![
        NotificationAction {
          action: "open".to_string(),
          title: "Open".to_string(),
          icon: None,
        },
        NotificationAction {
          action: "dismiss".to_string(),
          title: "Dismiss".to_string(),
          icon: None,
        },
      ],
    }
  }
}

impl Notification {
  /// Build the notification for a push event.
  ///
  /// Fields of a JSON object payload override `defaults`. A payload that is not a
  /// JSON object keeps the defaults and, when non-empty, becomes the body text.
  pub fn from_push(payload: Option<&str>, defaults: &Notification) -> Notification {
    let Some(raw) = payload else {
      return defaults.clone();
    };

    match merge(raw, defaults) {
      Some(notification) => notification,
      None => {
        warn!("push payload is not a notification object, using it as body");
        let mut notification = defaults.clone();
        if !raw.trim().is_empty() {
          notification.body = raw.to_string();
        }
        notification
      }
    }
  }
}

fn merge(raw: &str, defaults: &Notification) -> Option<Notification> {
  let Ok(Value::Object(overrides)) = serde_json::from_str::<Value>(raw) else {
    return None;
  };
  let Ok(Value::Object(mut base)) = serde_json::to_value(defaults) else {
    return None;
  };

  base.extend(overrides);
  serde_json::from_value(Value::Object(base)).ok()
}

/// A click on a displayed notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NotificationClick {
  #[serde(default)]
  pub action: Option<String>,
  #[serde(default)]
  pub url: Option<String>,
}

/// What the host should do about a click.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClickAction {
  Dismiss,
  /// Focus an open window of the app, or open `url`
  FocusOrOpen { url: String },
}

impl NotificationClick {
  pub fn resolve(&self) -> ClickAction {
    if self.action.as_deref() == Some("dismiss") {
      return ClickAction::Dismiss;
    }
    ClickAction::FocusOrOpen {
      url: self.url.clone().unwrap_or_else(|| "/".to_string()),
    }
  }
}
