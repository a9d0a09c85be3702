//! Task completion notifications.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::NotifyConfig;
use crate::models::history::HistoryKind;

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: HistoryKind,
    pub success: bool,
    pub title: String,
    pub message: String,
    pub filenames: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: HistoryKind, success: bool, message: impl Into<String>) -> Self {
        let title = match (kind, success) {
            (HistoryKind::Backup, true) => "PVE backup succeeded",
            (HistoryKind::Backup, false) => "PVE backup failed",
            (HistoryKind::Restore, true) => "PVE restore succeeded",
            (HistoryKind::Restore, false) => "PVE restore failed",
        };
        Self {
            kind,
            success,
            title: title.to_string(),
            message: message.into(),
            filenames: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Called from blocking threads once per finished task.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Notifications disabled.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _notification: &Notification) {}
}

/// Writes notifications to the log only.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: &Notification) {
        if n.success {
            tracing::info!(title = %n.title, "[Notify] {}", n.message);
        } else {
            tracing::warn!(title = %n.title, "[Notify] {}", n.message);
        }
    }
}

/// Posts notifications as JSON to a webhook.
pub struct WebhookNotifier {
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    fn send(&self, n: &Notification) -> Result<(), reqwest::Error> {
        reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?
            .post(&self.url)
            .json(n)
            .send()?
            .error_for_status()?;
        Ok(())
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, n: &Notification) {
        LogNotifier.notify(n);
        if let Err(e) = self.send(n) {
            tracing::warn!(url = %self.url, error = %e, "[Notify] Webhook delivery failed");
        }
    }
}

pub fn from_config(config: &NotifyConfig) -> Arc<dyn Notifier> {
    if !config.enabled {
        return Arc::new(NoopNotifier);
    }
    match config.webhook_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Arc::new(WebhookNotifier::new(url)),
        _ => Arc::new(LogNotifier),
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        pub fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, notification: &Notification) {
            self.sent.lock().unwrap().push(notification.clone());
        }
    }
}
