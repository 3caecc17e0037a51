//! Session registry
//!
//! Holds one [`SessionRecord`] per port key: the connection status plus the
//! most recent completed line and its timestamp. Only the latest line is
//! kept. The registry is an ordinary owned value, shared behind an `Arc` by
//! whichever layer needs it.

use super::framing::CompletedMessage;
use super::port_key::PortKey;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default capacity of the registry event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Connection status of a port
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Not connected
    #[default]
    Disconnected,
    /// Open in progress
    Connecting,
    /// Open succeeded
    Connected,
    /// Open failed
    Failed(String),
}

impl ConnectionStatus {
    /// Whether the port is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}

/// Per-port state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Connection status
    pub status: ConnectionStatus,
    /// Most recent completed line
    pub last_message: Option<String>,
    /// When the most recent line completed
    pub last_received_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    fn clear_data(&mut self) {
        self.last_message = None;
        self.last_received_at = None;
    }
}

/// Registry events
#[derive(Debug, Clone)]
pub enum PortEvent {
    /// A line completed on a port
    MessageReceived(CompletedMessage),
    /// Connection status changed
    StatusChanged {
        /// Port
        port: PortKey,
        /// New status
        status: ConnectionStatus,
    },
    /// Last-message data removed for one port
    Cleared(PortKey),
    /// Last-message data removed for every port
    ClearedAll,
}

/// Owner of every port's session record
#[derive(Debug)]
pub struct SessionRegistry {
    records: RwLock<HashMap<PortKey, SessionRecord>>,
    event_tx: broadcast::Sender<PortEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Create a registry with the default event capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a registry with a specific event channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            records: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.event_tx.subscribe()
    }

    /// Overwrite a port's last message, stamped with the current time
    pub fn record_message(&self, port: &PortKey, text: impl Into<String>) {
        self.record(&CompletedMessage::new(port.clone(), text.into()));
    }

    /// Overwrite a port's last message with a completed line
    pub fn record(&self, message: &CompletedMessage) {
        {
            let mut records = self.records.write();
            let record = records.entry(message.port.clone()).or_default();
            record.last_message = Some(message.text.clone());
            record.last_received_at = Some(message.received_at);
        }
        trace!(port = %message.port, seq = message.seq, "recorded message");
        let _ = self.event_tx.send(PortEvent::MessageReceived(message.clone()));
    }

    /// Mark a connection attempt as started
    pub fn mark_connecting(&self, port: &PortKey) {
        self.set_status(port, ConnectionStatus::Connecting);
    }

    /// Mark a port as open
    pub fn mark_connected(&self, port: &PortKey) {
        self.set_status(port, ConnectionStatus::Connected);
    }

    /// Mark a connection attempt as failed
    pub fn mark_failed(&self, port: &PortKey, reason: impl Into<String>) {
        self.set_status(port, ConnectionStatus::Failed(reason.into()));
    }

    /// Mark a port as closed
    pub fn mark_disconnected(&self, port: &PortKey) {
        self.set_status(port, ConnectionStatus::Disconnected);
    }

    fn set_status(&self, port: &PortKey, status: ConnectionStatus) {
        let previous = {
            let mut records = self.records.write();
            let record = records.entry(port.clone()).or_default();
            std::mem::replace(&mut record.status, status.clone())
        };
        debug!(port = %port, from = %previous, to = %status, "status changed");
        let _ = self.event_tx.send(PortEvent::StatusChanged {
            port: port.clone(),
            status,
        });
    }

    /// Remove one port's last message and timestamp, keeping its status
    pub fn clear(&self, port: &PortKey) {
        let found = match self.records.write().get_mut(port) {
            Some(record) => {
                record.clear_data();
                true
            }
            None => false,
        };
        if found {
            let _ = self.event_tx.send(PortEvent::Cleared(port.clone()));
        }
    }

    /// Remove every port's last message and timestamp
    pub fn clear_all(&self) {
        for record in self.records.write().values_mut() {
            record.clear_data();
        }
        let _ = self.event_tx.send(PortEvent::ClearedAll);
    }

    /// Connection status of a port
    pub fn status(&self, port: &PortKey) -> ConnectionStatus {
        self.records
            .read()
            .get(port)
            .map(|r| r.status.clone())
            .unwrap_or_default()
    }

    /// Full record of a port
    pub fn get(&self, port: &PortKey) -> Option<SessionRecord> {
        self.records.read().get(port).cloned()
    }

    /// Last message of a port
    pub fn last_message(&self, port: &PortKey) -> Option<String> {
        self.records.read().get(port)?.last_message.clone()
    }

    /// Snapshot of last message per port
    pub fn received_data(&self) -> HashMap<PortKey, String> {
        self.records
            .read()
            .iter()
            .filter_map(|(port, r)| Some((port.clone(), r.last_message.clone()?)))
            .collect()
    }

    /// Snapshot of last message timestamp per port
    pub fn data_timestamps(&self) -> HashMap<PortKey, DateTime<Utc>> {
        self.records
            .read()
            .iter()
            .filter_map(|(port, r)| Some((port.clone(), r.last_received_at?)))
            .collect()
    }

    /// Every known port
    pub fn ports(&self) -> Vec<PortKey> {
        let mut ports: Vec<_> = self.records.read().keys().cloned().collect();
        ports.sort();
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> PortKey {
        PortKey::normalize(raw)
    }

    #[test]
    fn test_last_value_wins() {
        let registry = SessionRegistry::new();
        let port = key("COM3");
        registry.record_message(&port, "first");
        registry.record_message(&port, "second");

        assert_eq!(registry.last_message(&port).as_deref(), Some("second"));
        assert_eq!(registry.received_data().len(), 1);
    }

    #[test]
    fn test_unknown_port_reads_are_empty() {
        let registry = SessionRegistry::new();
        let port = key("COM8");
        assert_eq!(registry.status(&port), ConnectionStatus::Disconnected);
        assert!(registry.get(&port).is_none());
        registry.clear(&port);
        assert!(registry.ports().is_empty());
    }

    #[test]
    fn test_clear_one_port() {
        let registry = SessionRegistry::new();
        let com3 = key("COM3");
        let com4 = key("COM4");
        registry.mark_connected(&com3);
        registry.record_message(&com3, "three");
        registry.record_message(&com4, "four");

        registry.clear(&com3);

        assert_eq!(registry.last_message(&com3), None);
        assert!(!registry.data_timestamps().contains_key(&com3));
        assert_eq!(registry.status(&com3), ConnectionStatus::Connected);
        assert_eq!(registry.last_message(&com4).as_deref(), Some("four"));
        assert!(registry.data_timestamps().contains_key(&com4));
    }

    #[test]
    fn test_clear_all() {
        let registry = SessionRegistry::new();
        registry.record_message(&key("COM1"), "a");
        registry.record_message(&key("COM2"), "b");

        registry.clear_all();

        assert!(registry.received_data().is_empty());
        assert!(registry.data_timestamps().is_empty());
        assert_eq!(registry.ports().len(), 2);
    }

    #[test]
    fn test_status_transitions() {
        let registry = SessionRegistry::new();
        let port = key("COM5");

        registry.mark_connecting(&port);
        assert_eq!(registry.status(&port), ConnectionStatus::Connecting);

        registry.mark_failed(&port, "busy");
        assert_eq!(registry.status(&port), ConnectionStatus::Failed("busy".into()));
        assert!(registry.last_message(&port).is_none());

        registry.mark_disconnected(&port);
        assert_eq!(registry.status(&port), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_events_published() {
        let registry = SessionRegistry::new();
        let mut rx = registry.subscribe();
        let port = key("COM1");

        registry.mark_connected(&port);
        registry.record_message(&port, "hi");
        registry.clear(&port);

        match rx.try_recv().unwrap() {
            PortEvent::StatusChanged { port: p, status } => {
                assert_eq!(p, port);
                assert_eq!(status, ConnectionStatus::Connected);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.try_recv().unwrap() {
            PortEvent::MessageReceived(msg) => assert_eq!(msg.text, "hi"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(rx.try_recv().unwrap(), PortEvent::Cleared(p) if p == port));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::Failed("gone".into()).to_string(), "Failed: gone");
        assert_eq!(ConnectionStatus::Connected.to_string(), "Connected");
    }
}
