//! Event bus for broadcasting new-connection alerts

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A new connection worth telling someone about.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub session: Uuid,
    pub timestamp: DateTime<Utc>,
    pub peer: SocketAddr,
    /// Local port the peer connected to
    pub port: u16,
    pub mac: Option<String>,
    pub message: String,
}

impl AlertEvent {
    pub fn new(session: Uuid, peer: SocketAddr, port: u16, mac: Option<String>) -> Self {
        let message = format!(
            "Connection from ip: {} mac: {}",
            peer.ip(),
            mac.as_deref().unwrap_or("unknown")
        );
        Self {
            session,
            timestamp: Utc::now(),
            peer,
            port,
            mac,
            message,
        }
    }

    pub fn subject(&self) -> String {
        format!(
            "ALERT! SSH Connection attempt to fake-ssh on port {} from: {}",
            self.port,
            self.peer.ip()
        )
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<AlertEvent>>,
}

impl EventBus {
    pub fn new(sender: broadcast::Sender<Arc<AlertEvent>>) -> Self {
        Self { sender }
    }

    /// Never blocks; an event with no subscriber is simply dropped.
    pub fn publish(&self, event: AlertEvent) {
        let _ = self.sender.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AlertEvent>> {
        self.sender.subscribe()
    }
}
