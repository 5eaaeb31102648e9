// src/notify.rs

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Severity attached to a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Warning,
    Error,
}

impl NotifyLevel {
    /// Slack attachment color for the level.
    fn color(self) -> &'static str {
        match self {
            Self::Info => "#36a64f",
            Self::Warning => "#ffae42",
            Self::Error => "#d50200",
        }
    }
}

/// Best-effort outbound channel for pool events (exhaustion, near-quota).
///
/// The trait boundary is infallible on purpose: implementations swallow and
/// log delivery failures, so a broken webhook can never fail the primary
/// operation that triggered the notification.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, message: &str, level: NotifyLevel);
}

/// Posts notifications to a Slack incoming webhook.
pub struct SlackWebhookSink {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackWebhookSink {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for SlackWebhookSink {
    async fn notify(&self, message: &str, level: NotifyLevel) {
        let payload = json!({
            "attachments": [{
                "color": level.color(),
                "text": message,
                "ts": Utc::now().timestamp(),
            }]
        });

        match self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!("Notification delivered");
            }
            Ok(response) => {
                warn!(
                    http.status_code = response.status().as_u16(),
                    "Slack rejected the notification"
                );
            }
            Err(e) => {
                warn!(error = %e, "Failed to send Slack notification");
            }
        }
    }
}

/// Fallback sink that only writes to the log, used when no webhook is
/// configured.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, message: &str, level: NotifyLevel) {
        match level {
            NotifyLevel::Info => info!(notification = message),
            NotifyLevel::Warning => warn!(notification = message),
            NotifyLevel::Error => error!(notification = message),
        }
    }
}
