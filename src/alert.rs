//! New-connection alerts
//!
//! The notifier listens on the event bus and delivers each alert on its own
//! task, so a slow or broken relay never holds up a session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::error::AlertError;
use crate::events::AlertEvent;

/// Something that can carry an alert to a human.
#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), AlertError>;
}

/// Relay credentials, loaded from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayCredentials {
    pub endpoint: String,
    pub username: String,
    pub password: String,
}

impl RelayCredentials {
    pub fn load(path: &Path) -> Result<Self, AlertError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AlertError::Credentials(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| AlertError::Credentials(format!("{}: {}", path.display(), e)))
    }
}

#[derive(Serialize)]
struct MailRequest<'a> {
    to: &'a str,
    subject: &'a str,
    message: &'a str,
}

/// Posts alerts as JSON to an HTTP mail relay.
pub struct HttpMailTransport {
    client: reqwest::Client,
    credentials: RelayCredentials,
}

impl HttpMailTransport {
    pub fn new(credentials: RelayCredentials) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, credentials })
    }
}

#[async_trait]
impl AlertTransport for HttpMailTransport {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), AlertError> {
        let response = self
            .client
            .post(&self.credentials.endpoint)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .json(&MailRequest {
                to: recipient,
                subject,
                message: body,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Writes alerts to the operator log only.
pub struct LogTransport;

#[async_trait]
impl AlertTransport for LogTransport {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), AlertError> {
        warn!(recipient = %recipient, "{} | {}", subject, body);
        Ok(())
    }
}

/// Pick a transport for the configured recipient and credentials file.
///
/// Missing credentials or an unusable HTTP client degrade to [`LogTransport`]
/// instead of failing startup.
pub fn transport_for(recipient: &str, credentials_file: &Path) -> Arc<dyn AlertTransport> {
    if recipient.is_empty() {
        info!("No alert recipient configured, alerts are logged only");
        return Arc::new(LogTransport);
    }
    match RelayCredentials::load(credentials_file).and_then(HttpMailTransport::new) {
        Ok(transport) => {
            info!(
                recipient = %recipient,
                endpoint = %transport.credentials.endpoint,
                "Alert relay configured"
            );
            Arc::new(transport)
        }
        Err(e) => {
            warn!("{}; alerts are logged only", e);
            Arc::new(LogTransport)
        }
    }
}

/// Delivers every published [`AlertEvent`] to one recipient.
pub struct AlertNotifier {
    transport: Arc<dyn AlertTransport>,
    recipient: Arc<str>,
}

impl AlertNotifier {
    pub fn new(transport: Arc<dyn AlertTransport>, recipient: impl Into<Arc<str>>) -> Self {
        Self {
            transport,
            recipient: recipient.into(),
        }
    }

    /// Run until the event bus is closed.
    pub fn spawn(self, rx: broadcast::Receiver<Arc<AlertEvent>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stream = BroadcastStream::new(rx);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => self.deliver(event),
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        warn!(missed = missed, "AlertDeliveryFailure: notifier lagged, alerts dropped");
                    }
                }
            }
            info!("Alert notifier shutting down");
        })
    }

    fn deliver(&self, event: Arc<AlertEvent>) {
        let transport = self.transport.clone();
        let recipient = self.recipient.clone();
        tokio::spawn(async move {
            let subject = event.subject();
            match transport.send(&recipient, &subject, &event.message).await {
                Ok(()) => info!(session = %event.session, peer = %event.peer, "Sent alert"),
                Err(e) => warn!(
                    session = %event.session,
                    peer = %event.peer,
                    "AlertDeliveryFailure: unable to send alert: {}",
                    e
                ),
            }
        });
    }
}
