//! Serial driver seam
//!
//! The engine never touches hardware itself. Enumeration, open, close and
//! write go through a [`SerialDriver`], and incoming bytes arrive as
//! [`RawChunk`]s on a bounded queue per consumer. Delivery is lossless: a
//! full queue makes the producer wait instead of dropping chunks.
//!
//! Implementations:
//! - [`NativeSerialDriver`] for real ports via `tokio-serial`
//! - [`VirtualDriver`] for in-memory ports (tests, demos)

mod native;
mod virtual_driver;

pub use native::NativeSerialDriver;
pub use virtual_driver::VirtualDriver;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

/// Default capacity of each consumer's raw chunk queue
pub const DEFAULT_CHUNK_CAPACITY: usize = 1024;

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

impl std::str::FromStr for SerialFlowControl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" | "0" => Ok(Self::None),
            "hardware" | "hw" | "rtscts" | "1" => Ok(Self::Hardware),
            "software" | "sw" | "xonxoff" | "2" => Ok(Self::Software),
            other => Err(format!("unknown flow control: {}", other)),
        }
    }
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::str::FromStr for SerialParity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" | "0" => Ok(Self::None),
            "odd" | "o" | "1" => Ok(Self::Odd),
            "even" | "e" | "2" => Ok(Self::Even),
            other => Err(format!("unknown parity: {}", other)),
        }
    }
}

/// Configuration used to open one port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Raw port name as the OS knows it (e.g. `COM3`, `\\.\COM3`, `/dev/ttyUSB0`)
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
}

impl PortConfig {
    /// Create a configuration with 8N1 and no flow control
    pub fn new(port_name: &str, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
        }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    /// Same settings for a different port
    #[must_use]
    pub fn for_port(&self, port_name: &str) -> Self {
        Self {
            port_name: port_name.to_string(),
            ..self.clone()
        }
    }

    /// Check the settings before handing them to a driver
    pub fn validate(&self) -> Result<(), OpenFailure> {
        if self.port_name.trim().is_empty() {
            return Err(OpenFailure::InvalidConfig("empty port name".into()));
        }
        if self.baud_rate == 0 {
            return Err(OpenFailure::InvalidConfig("baud rate must be non-zero".into()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(OpenFailure::InvalidConfig(format!(
                "unsupported data bits: {}",
                self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(OpenFailure::InvalidConfig(format!(
                "unsupported stop bits: {}",
                self.stop_bits
            )));
        }
        Ok(())
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self::new("COM1", 9600)
    }
}

impl fmt::Display for PortConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {} baud ({}{}{} {})",
            self.port_name,
            self.baud_rate,
            self.data_bits,
            match self.parity {
                SerialParity::None => "N",
                SerialParity::Odd => "O",
                SerialParity::Even => "E",
            },
            self.stop_bits,
            match self.flow_control {
                SerialFlowControl::None => "No FC",
                SerialFlowControl::Hardware => "HW FC",
                SerialFlowControl::Software => "SW FC",
            }
        )
    }
}

/// Bytes read from one port in one driver read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    /// Raw (not normalized) port identifier
    pub port: String,
    /// Bytes in arrival order
    pub data: Bytes,
}

impl RawChunk {
    /// Create a chunk
    pub fn new(port: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            port: port.into(),
            data: data.into(),
        }
    }
}

/// Delivers raw chunks to every live consumer in publish order
#[derive(Debug)]
pub struct ChunkFanout {
    capacity: usize,
    consumers: Mutex<Vec<mpsc::Sender<RawChunk>>>,
}

impl ChunkFanout {
    /// Create a fan-out whose consumer queues hold `capacity` chunks
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            consumers: Mutex::new(Vec::new()),
        }
    }

    /// Register a consumer. It sees chunks published from now on.
    pub fn subscribe(&self) -> mpsc::Receiver<RawChunk> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.consumers.lock().push(tx);
        rx
    }

    /// Number of live consumers
    pub fn consumer_count(&self) -> usize {
        let mut consumers = self.consumers.lock();
        consumers.retain(|tx| !tx.is_closed());
        consumers.len()
    }

    /// Hand a chunk to every consumer, waiting while a queue is full.
    ///
    /// Returns how many consumers received it. Zero means nobody was
    /// listening and the chunk is gone.
    pub async fn publish(&self, chunk: RawChunk) -> usize {
        let consumers: Vec<_> = {
            let mut consumers = self.consumers.lock();
            consumers.retain(|tx| !tx.is_closed());
            consumers.clone()
        };

        let mut delivered = 0;
        for tx in consumers {
            if tx.send(chunk.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            trace!(port = %chunk.port, len = chunk.data.len(), "no consumer, chunk dropped");
        }
        delivered
    }
}

/// Why an open failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenFailure {
    /// Settings rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Port already open
    #[error("port busy")]
    Busy,
    /// No such device
    #[error("device not found")]
    NotFound,
    /// OS refused access
    #[error("permission denied")]
    PermissionDenied,
    /// Other I/O failure
    #[error("{0}")]
    Io(String),
}

/// Why a close failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloseFailure {
    /// Port was not open
    #[error("already closed")]
    AlreadyClosed,
    /// Device disappeared
    #[error("device removed")]
    Removed,
    /// Other I/O failure
    #[error("{0}")]
    Io(String),
}

/// Why a write failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteFailure {
    /// Port is not open
    #[error("port not open")]
    NotOpen,
    /// I/O failure
    #[error("{0}")]
    Io(String),
}

/// Driver error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Port enumeration failed
    #[error("Port enumeration failed: {0}")]
    Enumerate(String),

    /// Open failed
    #[error("Failed to open {port}: {reason}")]
    Open {
        /// Raw port name
        port: String,
        /// Cause
        reason: OpenFailure,
    },

    /// Close failed
    #[error("Failed to close {port}: {reason}")]
    Close {
        /// Raw port name
        port: String,
        /// Cause
        reason: CloseFailure,
    },

    /// Write failed
    #[error("Failed to write to {port}: {reason}")]
    Write {
        /// Raw port name
        port: String,
        /// Cause
        reason: WriteFailure,
    },
}

impl DriverError {
    /// Open error for a port
    pub fn open(port: &str, reason: OpenFailure) -> Self {
        Self::Open {
            port: port.to_string(),
            reason,
        }
    }

    /// Close error for a port
    pub fn close(port: &str, reason: CloseFailure) -> Self {
        Self::Close {
            port: port.to_string(),
            reason,
        }
    }

    /// Write error for a port
    pub fn write(port: &str, reason: WriteFailure) -> Self {
        Self::Write {
            port: port.to_string(),
            reason,
        }
    }
}

/// OS-level serial driver
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SerialDriver: Send + Sync {
    /// Enumerate available ports by raw name
    async fn list_ports(&self) -> Result<Vec<String>, DriverError>;

    /// Open a port
    async fn open_port(&self, config: &PortConfig) -> Result<(), DriverError>;

    /// Close a port
    async fn close_port(&self, port: &str) -> Result<(), DriverError>;

    /// Write raw bytes, returning the count written
    async fn write(&self, port: &str, data: &[u8]) -> Result<usize, DriverError>;

    /// Receive raw byte arrivals for every open port, from this call on.
    ///
    /// Chunks arrive in the order the driver read them. A consumer that
    /// stops reading holds the producer back rather than losing bytes.
    fn subscribe(&self) -> mpsc::Receiver<RawChunk>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fanout_reaches_every_consumer_in_order() {
        let fanout = ChunkFanout::new(4);
        let mut first = fanout.subscribe();
        let mut second = fanout.subscribe();

        assert_eq!(fanout.publish(RawChunk::new("COM1", &b"a"[..])).await, 2);
        assert_eq!(fanout.publish(RawChunk::new("COM1", &b"b"[..])).await, 2);

        for rx in [&mut first, &mut second] {
            assert_eq!(rx.recv().await.unwrap().data, Bytes::from_static(b"a"));
            assert_eq!(rx.recv().await.unwrap().data, Bytes::from_static(b"b"));
        }
    }

    #[tokio::test]
    async fn test_fanout_forgets_closed_consumers() {
        let fanout = ChunkFanout::new(4);
        assert_eq!(fanout.publish(RawChunk::new("COM1", &b"x"[..])).await, 0);

        let rx = fanout.subscribe();
        assert_eq!(fanout.consumer_count(), 1);
        drop(rx);
        assert_eq!(fanout.consumer_count(), 0);
        assert_eq!(fanout.publish(RawChunk::new("COM1", &b"x"[..])).await, 0);
    }

    #[tokio::test]
    async fn test_fanout_full_queue_waits_for_reader() {
        let fanout = std::sync::Arc::new(ChunkFanout::new(1));
        let mut rx = fanout.subscribe();

        let producer = {
            let fanout = fanout.clone();
            tokio::spawn(async move {
                for byte in 0..10u8 {
                    fanout.publish(RawChunk::new("COM1", vec![byte])).await;
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < 10 {
            received.extend_from_slice(&rx.recv().await.unwrap().data);
        }
        producer.await.unwrap();
        assert_eq!(received, (0..10u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_port_config_defaults() {
        let config = PortConfig::new("COM5", 9600);
        assert_eq!(config.data_bits, 8);
        assert_eq!(config.stop_bits, 1);
        assert_eq!(config.parity, SerialParity::None);
        assert_eq!(config.flow_control, SerialFlowControl::None);
        assert!(config.validate().is_ok());
        assert_eq!(config.to_string(), "COM5 @ 9600 baud (8N1 No FC)");
    }

    #[test]
    fn test_port_config_validation() {
        assert!(matches!(
            PortConfig::new("COM1", 0).validate(),
            Err(OpenFailure::InvalidConfig(_))
        ));
        assert!(PortConfig::new("COM1", 9600).data_bits(9).validate().is_err());
        assert!(PortConfig::new("COM1", 9600).stop_bits(3).validate().is_err());
        assert!(PortConfig::new(" ", 9600).validate().is_err());
    }

    #[test]
    fn test_parse_line_settings() {
        assert_eq!("even".parse::<SerialParity>(), Ok(SerialParity::Even));
        assert_eq!("0".parse::<SerialParity>(), Ok(SerialParity::None));
        assert!("mark".parse::<SerialParity>().is_err());
        assert_eq!("hw".parse::<SerialFlowControl>(), Ok(SerialFlowControl::Hardware));
    }

    #[test]
    fn test_error_messages() {
        let err = DriverError::open("COM3", OpenFailure::Busy);
        assert_eq!(err.to_string(), "Failed to open COM3: port busy");
        let err = DriverError::write("COM3", WriteFailure::NotOpen);
        assert_eq!(err.to_string(), "Failed to write to COM3: port not open");
    }
}
