use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::NotificationConfig;
use crate::core::{Alert, Severity};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned status {0}")]
    Status(u16),

    #[error("desktop notification failed: {0}")]
    Desktop(String),
}

/// A sink that is told about every persisted alert.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver the alert. Returns `Ok(false)` when the notifier chose to skip it.
    async fn notify(&self, alert: &Alert) -> Result<bool, NotifyError>;
}

/// Shared gate for severity threshold and spam cooldown.
struct Throttle {
    min_severity: Severity,
    cooldown: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl Throttle {
    fn new(min_severity: Severity, cooldown: Duration) -> Self {
        Self {
            min_severity,
            cooldown,
            last_sent: Mutex::new(None),
        }
    }

    fn admits(&self, alert: &Alert) -> bool {
        alert.severity >= self.min_severity && self.check_cooldown()
    }

    /// Check and update cooldown. Returns true if enough time has passed.
    fn check_cooldown(&self) -> bool {
        let Ok(mut last) = self.last_sent.lock() else {
            return false;
        };
        let now = Instant::now();
        if let Some(prev) = *last {
            if now.duration_since(prev) < self.cooldown {
                return false;
            }
        }
        *last = Some(now);
        true
    }
}

fn summary(alert: &Alert) -> String {
    format!("{} TrustWatch: {}", alert.severity.emoji(), alert.title)
}

/// Desktop notification sender with cooldown to prevent spam.
pub struct DesktopNotifier {
    throttle: Throttle,
}

impl DesktopNotifier {
    pub fn new(config: &NotificationConfig) -> Self {
        Self {
            throttle: Throttle::new(config.min_severity, Duration::from_secs(config.cooldown_seconds)),
        }
    }
}

#[async_trait]
impl Notifier for DesktopNotifier {
    fn name(&self) -> &str {
        "desktop"
    }

    async fn notify(&self, alert: &Alert) -> Result<bool, NotifyError> {
        if !self.throttle.admits(alert) {
            return Ok(false);
        }
        let title = summary(alert);
        let body = format!("{} | user {} | alert #{}", alert.description, alert.user_id, alert.id);

        // notify-rust blocks on the session bus; keep it off the runtime threads.
        tokio::task::spawn_blocking(move || {
            notify_rust::Notification::new()
                .summary(&title)
                .body(&body)
                .show()
                .map(|_| ())
                .map_err(|e| NotifyError::Desktop(e.to_string()))
        })
        .await
        .map_err(|e| NotifyError::Desktop(e.to_string()))??;
        Ok(true)
    }
}

/// Posts each alert as JSON to a webhook, with optional basic auth.
pub struct WebhookNotifier {
    url: String,
    client: Client,
    auth: Option<String>, // base64 encoded user:pass
    throttle: Throttle,
}

impl WebhookNotifier {
    pub fn new(url: &str, user: Option<&str>, pass: Option<&str>, config: &NotificationConfig) -> Self {
        use base64::{Engine, engine::general_purpose::STANDARD};
        let auth = match (user, pass) {
            (Some(user), Some(pass)) => Some(STANDARD.encode(format!("{user}:{pass}"))),
            _ => None,
        };
        Self {
            url: url.to_string(),
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            auth,
            // Webhooks get every admitted alert; the cooldown only applies to the desktop.
            throttle: Throttle::new(config.min_severity, Duration::ZERO),
        }
    }

    pub fn from_config(config: &NotificationConfig) -> Option<Self> {
        let url = config.webhook_url.as_deref()?;
        Some(Self::new(
            url,
            config.webhook_user.as_deref(),
            config.webhook_password.as_deref(),
            config,
        ))
    }

    pub fn payload(alert: &Alert) -> serde_json::Value {
        json!({
            "event": "detection_alert",
            "summary": summary(alert),
            "alert": alert,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, alert: &Alert) -> Result<bool, NotifyError> {
        if !self.throttle.admits(alert) {
            return Ok(false);
        }
        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&Self::payload(alert));
        if let Some(ref auth) = self.auth {
            req = req.header("Authorization", format!("Basic {auth}"));
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status().as_u16()));
        }
        Ok(true)
    }
}
