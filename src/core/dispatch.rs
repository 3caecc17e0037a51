//! Dispatch layer
//!
//! Sits between a [`SerialDriver`] and its consumers. Raw chunks come in
//! from the driver, get normalized and framed, and the completed lines land
//! in the [`SessionRegistry`]. Consumer calls (connect, send, disconnect,
//! clear) go out through the driver and update the registry with the outcome.
//!
//! Driver failures never escape as panics or poison other ports: each one is
//! logged with its port key and handed back to the caller.

use super::driver::{CloseFailure, DriverError, PortConfig, SerialDriver};
use super::framing::{CompletedMessage, FramerArena};
use super::port_key::PortKey;
use super::registry::{ConnectionStatus, SessionRegistry};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Line ending appended to outgoing text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    /// Send text as-is
    #[default]
    None,
    /// LF only
    Lf,
    /// CR only
    Cr,
    /// CR+LF
    CrLf,
}

impl LineEnding {
    /// Bytes for this line ending
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::None => b"",
            Self::Lf => b"\n",
            Self::Cr => b"\r",
            Self::CrLf => b"\r\n",
        }
    }
}

/// Result of one connection attempt
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    /// Port key the attempt was recorded under
    pub port: PortKey,
    /// Driver outcome
    pub result: Result<(), DriverError>,
}

impl ConnectOutcome {
    /// Whether the port opened
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Handle to the running dispatch loop.
///
/// Dropping the handle stops the loop. [`Subscription::shutdown`] also waits
/// for it to finish.
#[must_use = "dropping the subscription stops dispatching"]
pub struct Subscription {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Whether the dispatch loop is still running
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the loop and wait for it to exit
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Routes driver traffic through framing into the session registry
pub struct Dispatcher {
    driver: Arc<dyn SerialDriver>,
    registry: Arc<SessionRegistry>,
    framers: FramerArena,
    /// Raw name each port was opened with
    routes: RwLock<HashMap<PortKey, String>>,
    line_ending: LineEnding,
}

impl Dispatcher {
    /// Create a dispatcher over a driver and registry
    pub fn new(driver: Arc<dyn SerialDriver>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            driver,
            registry,
            framers: FramerArena::new(),
            routes: RwLock::new(HashMap::new()),
            line_ending: LineEnding::None,
        }
    }

    /// Set the line ending appended by [`Dispatcher::send`]
    #[must_use]
    pub fn with_line_ending(mut self, line_ending: LineEnding) -> Self {
        self.line_ending = line_ending;
        self
    }

    /// Session registry this dispatcher writes to
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start consuming the driver's raw chunks.
    ///
    /// Chunks are handled one at a time in receive order, so bytes for a
    /// given port are framed in the order the driver produced them. Nothing
    /// is skipped: a slow loop holds the driver back instead. Chunks the
    /// driver produced before this call never reach the framers.
    pub fn attach(self: &Arc<Self>) -> Subscription {
        let mut rx = self.driver.subscribe();
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let dispatcher = Arc::clone(self);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    chunk = rx.recv() => match chunk {
                        Some(chunk) => {
                            dispatcher.handle_chunk(&chunk.port, &chunk.data);
                        }
                        None => {
                            debug!("driver channel closed");
                            break;
                        }
                    }
                }
            }
            debug!("dispatch loop stopped");
        });

        Subscription {
            token,
            task: Some(task),
        }
    }

    /// Frame one raw chunk and record every completed line
    pub fn handle_chunk(&self, raw_port: &str, data: &[u8]) -> Vec<CompletedMessage> {
        let port = PortKey::normalize(raw_port);
        trace!(port = %port, len = data.len(), "raw chunk");

        let framer = self.framers.framer(&port);
        // Held while recording so the registry sees this port's lines in order
        let mut framer = framer.lock();
        let messages = framer.feed_all(&port, data);
        for message in &messages {
            self.registry.record(message);
        }
        messages
    }

    /// Open each port in turn. A failure is recorded and logged, then the
    /// remaining ports are still attempted.
    pub async fn connect(&self, configs: &[PortConfig]) -> Vec<ConnectOutcome> {
        let mut outcomes = Vec::with_capacity(configs.len());
        for config in configs {
            outcomes.push(self.open(config).await);
        }
        outcomes
    }

    /// Open a single port
    pub async fn connect_one(&self, config: &PortConfig) -> Result<PortKey, DriverError> {
        let ConnectOutcome { port, result } = self.open(config).await;
        result.map(|()| port)
    }

    /// A port this dispatcher already holds open is left alone and reported
    /// as connected.
    async fn open(&self, config: &PortConfig) -> ConnectOutcome {
        let port = PortKey::normalize(&config.port_name);
        if self.routes.read().contains_key(&port) && self.registry.status(&port).is_connected() {
            debug!(port = %port, "already connected");
            return ConnectOutcome { port, result: Ok(()) };
        }
        self.registry.mark_connecting(&port);

        let result = self.driver.open_port(config).await;
        match &result {
            Ok(()) => {
                self.routes
                    .write()
                    .insert(port.clone(), config.port_name.clone());
                self.registry.mark_connected(&port);
                info!(port = %port, config = %config, "connected");
            }
            Err(e) => {
                self.registry.mark_failed(&port, e.to_string());
                error!(port = %port, error = %e, "connection failed");
            }
        }
        ConnectOutcome { port, result }
    }

    /// Encode text as UTF-8, append the line ending and write it
    pub async fn send(&self, port: &str, text: &str) -> Result<usize, DriverError> {
        let key = PortKey::normalize(port);
        let raw = self.route(&key, port);

        let mut bytes = Vec::with_capacity(text.len() + 2);
        bytes.extend_from_slice(text.as_bytes());
        bytes.extend_from_slice(self.line_ending.as_bytes());

        match self.driver.write(&raw, &bytes).await {
            Ok(written) => {
                info!(port = %key, bytes = written, "sent");
                Ok(written)
            }
            Err(e) => {
                error!(port = %key, error = %e, "send failed");
                Err(e)
            }
        }
    }

    /// Close a port. Buffered and received data are kept.
    pub async fn disconnect(&self, port: &str) -> Result<(), DriverError> {
        let key = PortKey::normalize(port);
        let raw = self.route(&key, port);

        match self.driver.close_port(&raw).await {
            Ok(()) => {
                self.forget_route(&key);
                self.registry.mark_disconnected(&key);
                info!(port = %key, "disconnected");
                Ok(())
            }
            Err(e) => {
                if let DriverError::Close {
                    reason: CloseFailure::AlreadyClosed | CloseFailure::Removed,
                    ..
                } = &e
                {
                    // Nothing is open any more either way
                    self.forget_route(&key);
                    self.registry.mark_disconnected(&key);
                    warn!(port = %key, error = %e, "close reported port already gone");
                } else {
                    error!(port = %key, error = %e, "close failed");
                }
                Err(e)
            }
        }
    }

    /// Clear last-message data for one port, or for every port
    pub fn clear_data(&self, port: Option<&str>) {
        match port {
            Some(port) => {
                let key = PortKey::normalize(port);
                debug!(port = %key, "clearing data");
                self.registry.clear(&key);
            }
            None => {
                debug!("clearing data for all ports");
                self.registry.clear_all();
            }
        }
    }

    /// Enumerate ports through the driver
    pub async fn list_ports(&self) -> Result<Vec<String>, DriverError> {
        self.driver.list_ports().await.map_err(|e| {
            error!(error = %e, "port enumeration failed");
            e
        })
    }

    /// Last message per port
    pub fn received_data(&self) -> HashMap<PortKey, String> {
        self.registry.received_data()
    }

    /// Last message timestamp per port
    pub fn data_timestamps(&self) -> HashMap<PortKey, DateTime<Utc>> {
        self.registry.data_timestamps()
    }

    /// Connection status of a port
    pub fn status(&self, port: &str) -> ConnectionStatus {
        self.registry.status(&PortKey::normalize(port))
    }

    /// Text received on a port since its last terminator
    pub fn pending(&self, port: &str) -> Option<String> {
        self.framers.pending(&PortKey::normalize(port))
    }

    /// Drop a port's unterminated text
    pub fn discard_pending(&self, port: &str) {
        self.framers.discard(&PortKey::normalize(port));
    }

    fn route(&self, key: &PortKey, fallback: &str) -> String {
        self.routes
            .read()
            .get(key)
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    }

    fn forget_route(&self, key: &PortKey) {
        self.routes.write().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::driver::{MockSerialDriver, OpenFailure, RawChunk, WriteFailure};
    use tokio::sync::mpsc;

    fn mock_driver() -> MockSerialDriver {
        let mut driver = MockSerialDriver::new();
        driver
            .expect_subscribe()
            .returning(|| mpsc::channel::<RawChunk>(16).1);
        driver
    }

    fn dispatcher(driver: MockSerialDriver) -> Dispatcher {
        Dispatcher::new(Arc::new(driver), Arc::new(SessionRegistry::new()))
    }

    #[tokio::test]
    async fn test_connect_continues_after_failure() {
        let mut driver = mock_driver();
        driver
            .expect_open_port()
            .times(2)
            .returning(|config| match config.port_name.as_str() {
                "COM1" => Err(DriverError::open("COM1", OpenFailure::Busy)),
                _ => Ok(()),
            });
        let dispatcher = dispatcher(driver);

        let outcomes = dispatcher
            .connect(&[PortConfig::new("COM1", 9600), PortConfig::new("COM2", 9600)])
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].is_ok());
        assert!(outcomes[1].is_ok());
        assert!(matches!(dispatcher.status("COM1"), ConnectionStatus::Failed(_)));
        assert_eq!(dispatcher.status("COM2"), ConnectionStatus::Connected);
        assert!(dispatcher.received_data().is_empty());
    }

    #[tokio::test]
    async fn test_connect_open_port_again_stays_connected() {
        let mut driver = mock_driver();
        driver.expect_open_port().times(1).returning(|_| Ok(()));
        let dispatcher = dispatcher(driver);

        dispatcher.connect_one(&PortConfig::new("COM3", 9600)).await.unwrap();
        let outcomes = dispatcher.connect(&[PortConfig::new("\\\\.\\COM3", 9600)]).await;

        assert!(outcomes[0].is_ok());
        assert_eq!(dispatcher.status("COM3"), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_send_uses_open_route_and_line_ending() {
        let mut driver = mock_driver();
        driver.expect_open_port().returning(|_| Ok(()));
        driver
            .expect_write()
            .withf(|port, data| port == "\\\\.\\COM3" && data == &b"AT\r\n"[..])
            .times(1)
            .returning(|_, data| Ok(data.len()));
        let dispatcher = dispatcher(driver).with_line_ending(LineEnding::CrLf);

        dispatcher
            .connect_one(&PortConfig::new("\\\\.\\COM3", 9600))
            .await
            .unwrap();
        assert_eq!(dispatcher.send("COM3", "AT").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_send_encodes_utf8() {
        let mut driver = mock_driver();
        driver
            .expect_write()
            .withf(|_, data| data == "é".as_bytes())
            .returning(|_, data| Ok(data.len()));
        let dispatcher = dispatcher(driver);

        assert_eq!(dispatcher.send("COM1", "é").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_send_failure_keeps_pending_text() {
        let mut driver = mock_driver();
        driver
            .expect_write()
            .returning(|port, _| Err(DriverError::write(port, WriteFailure::Io("gone".into()))));
        let dispatcher = dispatcher(driver);

        dispatcher.handle_chunk("COM4", b"partial");
        assert!(dispatcher.send("COM4", "x").await.is_err());
        assert_eq!(dispatcher.pending("COM4").as_deref(), Some("partial"));
    }

    #[tokio::test]
    async fn test_close_io_failure_keeps_status() {
        let mut driver = mock_driver();
        driver.expect_open_port().returning(|_| Ok(()));
        driver
            .expect_close_port()
            .returning(|port| Err(DriverError::close(port, CloseFailure::Io("stuck".into()))));
        let dispatcher = dispatcher(driver);

        dispatcher.connect_one(&PortConfig::new("COM6", 9600)).await.unwrap();
        assert!(dispatcher.disconnect("COM6").await.is_err());
        assert_eq!(dispatcher.status("COM6"), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_close_already_closed_marks_disconnected() {
        let mut driver = mock_driver();
        driver.expect_open_port().returning(|_| Ok(()));
        driver
            .expect_close_port()
            .returning(|port| Err(DriverError::close(port, CloseFailure::AlreadyClosed)));
        let dispatcher = dispatcher(driver);

        dispatcher.connect_one(&PortConfig::new("COM6", 9600)).await.unwrap();
        assert!(dispatcher.disconnect("COM6").await.is_err());
        assert_eq!(dispatcher.status("COM6"), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_list_ports_error_is_returned() {
        let mut driver = mock_driver();
        driver
            .expect_list_ports()
            .returning(|| Err(DriverError::Enumerate("denied".into())));
        let dispatcher = dispatcher(driver);

        assert_eq!(
            dispatcher.list_ports().await.unwrap_err(),
            DriverError::Enumerate("denied".into())
        );
    }

    #[test]
    fn test_handle_chunk_normalizes_and_records() {
        let dispatcher = dispatcher(mock_driver());

        let messages = dispatcher.handle_chunk("\\\\.\\com3", b"Hi\nthere");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].port.as_str(), "COM3");

        let data = dispatcher.received_data();
        assert_eq!(data.get("COM3").map(String::as_str), Some("Hi"));
        assert_eq!(dispatcher.pending("COM3").as_deref(), Some("there"));
    }

    #[test]
    fn test_interleaved_ports_stay_separate() {
        let dispatcher = dispatcher(mock_driver());

        dispatcher.handle_chunk("COM1", b"one-");
        dispatcher.handle_chunk("COM2", b"two-");
        dispatcher.handle_chunk("COM1", b"a\n");
        dispatcher.handle_chunk("COM2", b"b\n");

        let data = dispatcher.received_data();
        assert_eq!(data.get("COM1").map(String::as_str), Some("one-a"));
        assert_eq!(data.get("COM2").map(String::as_str), Some("two-b"));
    }

    #[test]
    fn test_clear_data_normalizes_port() {
        let dispatcher = dispatcher(mock_driver());
        dispatcher.handle_chunk("COM3", b"x\n");
        dispatcher.handle_chunk("COM4", b"y\n");

        dispatcher.clear_data(Some("\\\\.\\com3"));
        assert!(!dispatcher.received_data().contains_key("COM3"));
        assert!(dispatcher.received_data().contains_key("COM4"));

        dispatcher.clear_data(None);
        assert!(dispatcher.received_data().is_empty());
        assert!(dispatcher.data_timestamps().is_empty());
    }

    #[test]
    fn test_line_ending_bytes() {
        assert_eq!(LineEnding::None.as_bytes(), b"");
        assert_eq!(LineEnding::CrLf.as_bytes(), b"\r\n");
    }
}
