//! Serial driver backed by `tokio-serial`

use super::{
    ChunkFanout, CloseFailure, DriverError, OpenFailure, PortConfig, RawChunk, SerialDriver, SerialFlowControl,
    SerialParity, WriteFailure, DEFAULT_CHUNK_CAPACITY,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 1024;

type Writer = Arc<tokio::sync::Mutex<WriteHalf<SerialStream>>>;

struct OpenPort {
    writer: Writer,
    reader: JoinHandle<()>,
}

/// Driver for physical serial ports
///
/// Each open port gets a reader task that publishes every read as a
/// [`RawChunk`]. Chunks for one port are sent from that single task, so they
/// arrive in order. While a consumer queue is full the reader stops pulling
/// from the device and the OS buffer absorbs the backlog.
pub struct NativeSerialDriver {
    ports: Mutex<HashMap<String, OpenPort>>,
    fanout: Arc<ChunkFanout>,
}

impl NativeSerialDriver {
    /// Create a driver with the default chunk channel capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHUNK_CAPACITY)
    }

    /// Create a driver with a specific per-consumer queue capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ports: Mutex::new(HashMap::new()),
            fanout: Arc::new(ChunkFanout::new(capacity)),
        }
    }

    fn spawn_reader(
        port: String,
        mut reader: ReadHalf<SerialStream>,
        fanout: Arc<ChunkFanout>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer).await {
                    Ok(0) => {
                        debug!(port = %port, "end of stream");
                        break;
                    }
                    Ok(n) => {
                        let chunk = RawChunk::new(port.clone(), Bytes::copy_from_slice(&buffer[..n]));
                        fanout.publish(chunk).await;
                    }
                    Err(ref e)
                        if matches!(
                            e.kind(),
                            ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                        ) => {}
                    Err(e) => {
                        warn!(port = %port, error = %e, "read failed, stopping reader");
                        break;
                    }
                }
            }
        })
    }
}

impl Default for NativeSerialDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NativeSerialDriver {
    fn drop(&mut self) {
        for (_, port) in self.ports.get_mut().drain() {
            port.reader.abort();
        }
    }
}

fn open_failure(err: &serialport::Error) -> OpenFailure {
    match err.kind() {
        serialport::ErrorKind::NoDevice => OpenFailure::NotFound,
        serialport::ErrorKind::InvalidInput => OpenFailure::InvalidConfig(err.to_string()),
        serialport::ErrorKind::Io(ErrorKind::NotFound) => OpenFailure::NotFound,
        serialport::ErrorKind::Io(ErrorKind::PermissionDenied) => OpenFailure::PermissionDenied,
        _ => OpenFailure::Io(err.to_string()),
    }
}

fn write_failure(err: &std::io::Error) -> WriteFailure {
    match err.kind() {
        ErrorKind::NotConnected | ErrorKind::BrokenPipe => WriteFailure::NotOpen,
        _ => WriteFailure::Io(err.to_string()),
    }
}

#[async_trait]
impl SerialDriver for NativeSerialDriver {
    async fn list_ports(&self) -> Result<Vec<String>, DriverError> {
        let ports = serialport::available_ports().map_err(|e| DriverError::Enumerate(e.to_string()))?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    async fn open_port(&self, config: &PortConfig) -> Result<(), DriverError> {
        config
            .validate()
            .map_err(|reason| DriverError::open(&config.port_name, reason))?;

        if self.ports.lock().contains_key(&config.port_name) {
            return Err(DriverError::open(&config.port_name, OpenFailure::Busy));
        }

        let data_bits = match config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stop_bits = match config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let parity = match config.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let flow_control = match config.flow_control {
            SerialFlowControl::Hardware => FlowControl::Hardware,
            SerialFlowControl::Software => FlowControl::Software,
            SerialFlowControl::None => FlowControl::None,
        };

        let stream = tokio_serial::new(&config.port_name, config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .open_native_async()
            .map_err(|e| DriverError::open(&config.port_name, open_failure(&e)))?;

        let (reader, writer) = tokio::io::split(stream);
        let reader = Self::spawn_reader(config.port_name.clone(), reader, self.fanout.clone());

        let mut ports = self.ports.lock();
        if ports.contains_key(&config.port_name) {
            // Lost a race with a concurrent open of the same port
            reader.abort();
            return Err(DriverError::open(&config.port_name, OpenFailure::Busy));
        }
        ports.insert(
            config.port_name.clone(),
            OpenPort {
                writer: Arc::new(tokio::sync::Mutex::new(writer)),
                reader,
            },
        );
        info!(config = %config, "port opened");
        Ok(())
    }

    async fn close_port(&self, port: &str) -> Result<(), DriverError> {
        let open = self
            .ports
            .lock()
            .remove(port)
            .ok_or_else(|| DriverError::close(port, CloseFailure::AlreadyClosed))?;

        open.reader.abort();
        let mut writer = open.writer.lock().await;
        let result = writer.shutdown().await;
        drop(writer);

        match result {
            Ok(()) => {
                info!(port = %port, "port closed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(DriverError::close(port, CloseFailure::Removed)),
            Err(e) => Err(DriverError::close(port, CloseFailure::Io(e.to_string()))),
        }
    }

    async fn write(&self, port: &str, data: &[u8]) -> Result<usize, DriverError> {
        let writer = self
            .ports
            .lock()
            .get(port)
            .map(|open| open.writer.clone())
            .ok_or_else(|| DriverError::write(port, WriteFailure::NotOpen))?;

        if data.is_empty() {
            return Ok(0);
        }

        let mut writer = writer.lock().await;
        writer
            .write_all(data)
            .await
            .map_err(|e| DriverError::write(port, write_failure(&e)))?;
        writer
            .flush()
            .await
            .map_err(|e| DriverError::write(port, write_failure(&e)))?;
        Ok(data.len())
    }

    fn subscribe(&self) -> mpsc::Receiver<RawChunk> {
        self.fanout.subscribe()
    }
}
