//! # Comframe Core Library
//!
//! Multi-port serial line framing and session state:
//! - Port identifiers normalized to canonical keys (`\\.\COM3` → `COM3`)
//! - Raw byte streams framed into text lines at LF, CR and FF
//! - Per-port connection status and last received line with timestamp
//! - Driver seam over `tokio-serial`, plus an in-memory driver
//!
//! ## Example
//!
//! ```rust,no_run
//! use comframe_core::{Dispatcher, NativeSerialDriver, PortConfig, SessionRegistry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(SessionRegistry::new());
//!     let dispatcher = Arc::new(Dispatcher::new(
//!         Arc::new(NativeSerialDriver::new()),
//!         registry.clone(),
//!     ));
//!     let _subscription = dispatcher.attach();
//!
//!     dispatcher.connect(&[PortConfig::new("COM3", 9600)]).await;
//!     dispatcher.send("COM3", "AT\r\n").await?;
//!
//!     let mut events = registry.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         if let comframe_core::PortEvent::MessageReceived(msg) = event {
//!             println!("{}: {}", msg.port, msg.text);
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;
pub mod logging;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, OutputFormat};
pub use crate::config::{AppConfig, ConfigError};
pub use crate::core::dispatch::{ConnectOutcome, Dispatcher, LineEnding, Subscription};
pub use crate::core::driver::{
    ChunkFanout, CloseFailure, DriverError, NativeSerialDriver, OpenFailure, PortConfig, RawChunk,
    SerialDriver, SerialFlowControl, SerialParity, VirtualDriver, WriteFailure,
};
pub use crate::core::framing::{CompletedMessage, FramerArena, LineFramer};
pub use crate::core::port_key::{normalize_port, PortKey};
pub use crate::core::registry::{ConnectionStatus, PortEvent, SessionRecord, SessionRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
