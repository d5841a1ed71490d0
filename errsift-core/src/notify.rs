//! Operator notifications
//!
//! Delivery is best-effort: a failed notification is logged and dropped, it
//! never propagates back into the caller.

use crate::config::NotifierConfig;
use crate::error::{Error, Result};
use serde_json::json;
use std::time::Duration;

/// One-way message sink for operator alerts.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Posts Slack-compatible `{"text": ...}` payloads to an incoming webhook.
pub struct WebhookNotifier {
    url: String,
    runtime: tokio::runtime::Runtime,
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("errsift-notify")
            .enable_all()
            .build()
            .map_err(|e| Error::Notify(format!("failed to build tokio runtime: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Notify(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            runtime,
            http,
        })
    }

    /// Deliver one message, reporting any failure.
    pub fn send(&self, message: &str) -> Result<()> {
        self.runtime.block_on(async {
            let resp = self
                .http
                .post(&self.url)
                .json(&json!({ "text": message }))
                .send()
                .await
                .map_err(|e| Error::Notify(format!("webhook request failed: {e}")))?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(Error::Notify(format!(
                    "webhook returned {}: {}",
                    status.as_u16(),
                    body
                )));
            }
            Ok(())
        })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, message: &str) {
        if let Err(e) = self.send(message) {
            tracing::warn!(error = %e, notification = %message, "Failed to deliver notification");
        }
    }
}

/// Fallback when no webhook is configured: notifications go to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        tracing::warn!(notification = %message, "NOTIFY");
    }
}

/// Build the notifier described by the configuration.
pub fn create_notifier(config: &NotifierConfig) -> Result<Box<dyn Notifier>> {
    match &config.webhook_url {
        Some(url) => Ok(Box::new(WebhookNotifier::new(
            url.clone(),
            Duration::from_secs(config.timeout_secs.max(1)),
        )?)),
        None => Ok(Box::new(LogNotifier)),
    }
}
