//! Best-effort delivery of threshold violation alerts.
use crate::models::Violation;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub device_id: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub violations: Vec<Violation>,
}

impl Alert {
    pub fn compose(device_id: &str, recipients: &[String], violations: &[Violation]) -> Self {
        let mut body = format!("Threshold violation alert for device ID: {device_id}\n\n");
        body.push_str("Violation details:\n");
        for violation in violations {
            body.push_str("- ");
            body.push_str(&violation.message);
            body.push('\n');
        }
        Self {
            device_id: device_id.to_string(),
            recipients: recipients.to_vec(),
            subject: format!("[ALERT] Threshold violation for device {device_id}"),
            body,
            violations: violations.to_vec(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no alert recipients configured")]
    NoRecipients,
    #[error("alert delivery failed: {0}")]
    Delivery(#[from] reqwest::Error),
    #[error("alert relay answered with status {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Writes alerts to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        info!(
            device_id = %alert.device_id,
            recipients = ?alert.recipients,
            subject = %alert.subject,
            "{}",
            alert.body
        );
        Ok(())
    }
}

/// Posts the alert as JSON to a mail relay.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        if alert.recipients.is_empty() {
            return Err(NotifyError::NoRecipients);
        }
        let response = self.client.post(&self.url).json(alert).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Skipped,
    Delivered,
    Failed,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    recipients: Vec<String>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, recipients: Vec<String>) -> Self {
        Self {
            notifier,
            recipients,
        }
    }

    /// Sends one alert for all `violations`. Never fails; delivery errors are
    /// logged and reported as `NotifyOutcome::Failed`.
    pub async fn notify(&self, device_id: &str, violations: &[Violation]) -> NotifyOutcome {
        if violations.is_empty() {
            return NotifyOutcome::Skipped;
        }

        error!("--- THRESHOLD VIOLATION ALERT for device {} ---", device_id);
        for violation in violations {
            error!(" > {}", violation.message);
        }

        let alert = Alert::compose(device_id, &self.recipients, violations);
        info!(device_id, "Sending violation alert");
        match self.notifier.send(&alert).await {
            Ok(()) => NotifyOutcome::Delivered,
            Err(e) => {
                warn!(device_id, error = %e, "Violation alert could not be delivered");
                NotifyOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<Alert>>,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
            self.sent.lock().push(alert.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        async fn send(&self, _alert: &Alert) -> Result<(), NotifyError> {
            Err(NotifyError::Rejected(502))
        }
    }

    fn violation() -> Violation {
        Violation {
            sensor_key: "temp".into(),
            value: 5.0,
            message: "Value 5 for 'temp' is below min threshold 10".into(),
        }
    }

    #[tokio::test]
    async fn empty_violations_are_skipped() {
        let recording = Arc::new(Recording::default());
        let dispatcher = NotificationDispatcher::new(recording.clone(), vec!["ops@example.com".into()]);
        assert_eq!(dispatcher.notify("C1", &[]).await, NotifyOutcome::Skipped);
        assert!(recording.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn alert_lists_every_violation() {
        let recording = Arc::new(Recording::default());
        let dispatcher = NotificationDispatcher::new(recording.clone(), vec!["ops@example.com".into()]);
        assert_eq!(
            dispatcher.notify("C1", &[violation()]).await,
            NotifyOutcome::Delivered
        );

        let sent = recording.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "[ALERT] Threshold violation for device C1");
        assert!(sent[0].body.contains("- Value 5 for 'temp' is below min threshold 10"));
        assert_eq!(sent[0].recipients, vec!["ops@example.com".to_string()]);
    }

    #[tokio::test]
    async fn delivery_failure_is_swallowed() {
        let dispatcher = NotificationDispatcher::new(Arc::new(Failing), vec![]);
        assert_eq!(
            dispatcher.notify("C1", &[violation()]).await,
            NotifyOutcome::Failed
        );
    }

    #[tokio::test]
    async fn webhook_requires_recipients() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/alerts").unwrap();
        let alert = Alert::compose("C1", &[], &[violation()]);
        assert!(matches!(
            notifier.send(&alert).await,
            Err(NotifyError::NoRecipients)
        ));
    }
}
