//! In-memory serial driver
//!
//! Ports exist only as names. Tests and demos script arrivals with
//! [`VirtualDriver::inject`], inspect writes with [`VirtualDriver::written`],
//! and force failures per port. Port names are matched by their normalized
//! key, the same way Windows accepts both `COM3` and `\\.\COM3`.

use super::{
    ChunkFanout, CloseFailure, DriverError, OpenFailure, PortConfig, RawChunk, SerialDriver, WriteFailure,
    DEFAULT_CHUNK_CAPACITY,
};
use crate::core::port_key::PortKey;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Default)]
struct VirtualState {
    /// Present devices, raw name by key
    available: BTreeMap<PortKey, String>,
    /// Open ports, config by key
    open: HashMap<PortKey, PortConfig>,
    written: HashMap<PortKey, Vec<u8>>,
    open_failures: HashMap<PortKey, OpenFailure>,
    write_failures: HashMap<PortKey, WriteFailure>,
    enumerate_failure: Option<String>,
    echo: bool,
}

/// Scriptable in-memory driver
#[derive(Debug)]
pub struct VirtualDriver {
    state: Mutex<VirtualState>,
    fanout: ChunkFanout,
}

impl Default for VirtualDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDriver {
    /// Create a driver with no ports
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHUNK_CAPACITY)
    }

    /// Create a driver with no ports and a specific per-consumer queue
    /// capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(VirtualState::default()),
            fanout: ChunkFanout::new(capacity),
        }
    }

    /// Create a driver with the given ports present
    pub fn with_ports<I, S>(ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let driver = Self::new();
        for port in ports {
            driver.add_port(port.as_ref());
        }
        driver
    }

    /// Plug in a device
    pub fn add_port(&self, port: &str) {
        self.state
            .lock()
            .available
            .insert(PortKey::normalize(port), port.to_string());
    }

    /// Unplug a device. An open port stays open until closed, and closing it
    /// then reports [`CloseFailure::Removed`].
    pub fn remove_port(&self, port: &str) {
        self.state.lock().available.remove(&PortKey::normalize(port));
    }

    /// Make the next opens of a port fail
    pub fn fail_open(&self, port: &str, failure: OpenFailure) {
        self.state
            .lock()
            .open_failures
            .insert(PortKey::normalize(port), failure);
    }

    /// Make writes to a port fail
    pub fn fail_write(&self, port: &str, failure: WriteFailure) {
        self.state
            .lock()
            .write_failures
            .insert(PortKey::normalize(port), failure);
    }

    /// Make enumeration fail
    pub fn fail_enumeration(&self, reason: &str) {
        self.state.lock().enumerate_failure = Some(reason.to_string());
    }

    /// Remove every scripted failure
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.open_failures.clear();
        state.write_failures.clear();
        state.enumerate_failure = None;
    }

    /// Loop written bytes back as arrivals on the same port
    pub fn set_echo(&self, echo: bool) {
        self.state.lock().echo = echo;
    }

    /// Deliver bytes as if the device had sent them, waiting while a
    /// consumer queue is full.
    ///
    /// Returns `false` if nothing received them: the port is not open, or no
    /// consumer is subscribed.
    pub async fn inject(&self, port: &str, data: impl Into<Bytes>) -> bool {
        if !self.is_open(port) {
            debug!(port = %port, "dropping injected bytes for closed port");
            return false;
        }
        self.fanout.publish(RawChunk::new(port, data)).await > 0
    }

    /// Whether a port is open
    pub fn is_open(&self, port: &str) -> bool {
        self.state.lock().open.contains_key(&PortKey::normalize(port))
    }

    /// Configuration a port was opened with
    pub fn open_config(&self, port: &str) -> Option<PortConfig> {
        self.state.lock().open.get(&PortKey::normalize(port)).cloned()
    }

    /// Every byte written to a port so far
    pub fn written(&self, port: &str) -> Vec<u8> {
        self.state
            .lock()
            .written
            .get(&PortKey::normalize(port))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SerialDriver for VirtualDriver {
    async fn list_ports(&self) -> Result<Vec<String>, DriverError> {
        let state = self.state.lock();
        if let Some(reason) = &state.enumerate_failure {
            return Err(DriverError::Enumerate(reason.clone()));
        }
        Ok(state.available.values().cloned().collect())
    }

    async fn open_port(&self, config: &PortConfig) -> Result<(), DriverError> {
        let name = &config.port_name;
        config.validate().map_err(|reason| DriverError::open(name, reason))?;

        let key = PortKey::normalize(name);
        let mut state = self.state.lock();
        if let Some(failure) = state.open_failures.get(&key) {
            return Err(DriverError::open(name, failure.clone()));
        }
        if !state.available.contains_key(&key) {
            return Err(DriverError::open(name, OpenFailure::NotFound));
        }
        if state.open.contains_key(&key) {
            return Err(DriverError::open(name, OpenFailure::Busy));
        }
        state.open.insert(key, config.clone());
        Ok(())
    }

    async fn close_port(&self, port: &str) -> Result<(), DriverError> {
        let key = PortKey::normalize(port);
        let mut state = self.state.lock();
        let was_open = state.open.remove(&key).is_some();
        let present = state.available.contains_key(&key);
        match (was_open, present) {
            (true, true) => Ok(()),
            (_, false) => Err(DriverError::close(port, CloseFailure::Removed)),
            (false, true) => Err(DriverError::close(port, CloseFailure::AlreadyClosed)),
        }
    }

    async fn write(&self, port: &str, data: &[u8]) -> Result<usize, DriverError> {
        let key = PortKey::normalize(port);
        let echo = {
            let mut state = self.state.lock();
            if !state.open.contains_key(&key) {
                return Err(DriverError::write(port, WriteFailure::NotOpen));
            }
            if let Some(failure) = state.write_failures.get(&key) {
                return Err(DriverError::write(port, failure.clone()));
            }
            state.written.entry(key).or_default().extend_from_slice(data);
            state.echo
        };

        if echo && !data.is_empty() {
            self.fanout
                .publish(RawChunk::new(port, Bytes::copy_from_slice(data)))
                .await;
        }
        Ok(data.len())
    }

    fn subscribe(&self) -> mpsc::Receiver<RawChunk> {
        self.fanout.subscribe()
    }
}
