//! Core module containing the framing engine
//!
//! This module provides:
//! - Port key normalization
//! - Line framing with per-port buffers
//! - Session registry with connection status and last message per port
//! - Dispatch between a serial driver and consumers
//! - Driver seam with native and virtual implementations

pub mod dispatch;
pub mod driver;
pub mod framing;
pub mod port_key;
pub mod registry;
