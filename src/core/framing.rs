//! Line framing for raw serial byte streams
//!
//! Bytes are processed strictly in order. LF, CR and FF terminate the current
//! line, other control bytes below 0x20 are dropped, and everything else is
//! appended as a Latin-1 character. Every terminator produces a message, so
//! `\r\n` yields a line followed by an empty line.

use super::port_key::PortKey;
use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::iter::FusedIterator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::codec::Decoder;

// ============ Terminators ============
const LF: u8 = 0x0A;
const FF: u8 = 0x0C;
const CR: u8 = 0x0D;

/// Lowest byte value that is kept in a line
const FIRST_PRINTABLE: u8 = 0x20;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Whether a byte ends the current line
pub fn is_terminator(byte: u8) -> bool {
    matches!(byte, LF | CR | FF)
}

/// A line produced at a terminator boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedMessage {
    /// Port the line arrived on
    pub port: PortKey,
    /// Line text, terminator excluded
    pub text: String,
    /// Wall-clock time the terminator was processed
    pub received_at: DateTime<Utc>,
    /// Process-wide monotonic sequence number
    pub seq: u64,
}

impl CompletedMessage {
    /// Stamp a new message with the current time and next sequence number
    pub fn new(port: PortKey, text: String) -> Self {
        Self {
            port,
            text,
            received_at: Utc::now(),
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// Accumulation buffer for one port
#[derive(Debug, Default, Clone)]
pub struct LineFramer {
    buffer: String,
}

impl LineFramer {
    /// Create an empty framer
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, yielding completed messages lazily.
    ///
    /// Bytes are consumed as the iterator advances. Dropping the iterator
    /// early leaves the remaining bytes unprocessed.
    pub fn feed<'a>(&'a mut self, port: &'a PortKey, bytes: &'a [u8]) -> Feed<'a> {
        Feed {
            framer: self,
            port,
            bytes: bytes.iter(),
        }
    }

    /// Feed bytes and collect every completed message
    pub fn feed_all(&mut self, port: &PortKey, bytes: &[u8]) -> Vec<CompletedMessage> {
        self.feed(port, bytes).collect()
    }

    /// Process a single byte, returning the finished line on a terminator
    pub fn push(&mut self, byte: u8) -> Option<String> {
        if is_terminator(byte) {
            return Some(std::mem::take(&mut self.buffer));
        }
        if byte >= FIRST_PRINTABLE {
            self.buffer.push(char::from(byte));
        }
        None
    }

    /// Text accumulated since the last terminator
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Drop the in-progress line without emitting it
    pub fn discard(&mut self) {
        self.buffer.clear();
    }
}

/// Lazy sequence of messages produced by [`LineFramer::feed`]
pub struct Feed<'a> {
    framer: &'a mut LineFramer,
    port: &'a PortKey,
    bytes: std::slice::Iter<'a, u8>,
}

impl Iterator for Feed<'_> {
    type Item = CompletedMessage;

    fn next(&mut self) -> Option<Self::Item> {
        for &byte in self.bytes.by_ref() {
            if let Some(text) = self.framer.push(byte) {
                return Some(CompletedMessage::new(self.port.clone(), text));
            }
        }
        None
    }
}

impl FusedIterator for Feed<'_> {}

/// Lines as a `tokio_util` codec, for framing any `AsyncRead` directly
impl Decoder for LineFramer {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while src.has_remaining() {
            if let Some(line) = self.push(src.get_u8()) {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }
}

/// Per-port framers, each behind its own lock
#[derive(Debug, Default)]
pub struct FramerArena {
    framers: RwLock<HashMap<PortKey, Arc<Mutex<LineFramer>>>>,
}

impl FramerArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Framer for a port, created on first use
    pub fn framer(&self, port: &PortKey) -> Arc<Mutex<LineFramer>> {
        if let Some(framer) = self.framers.read().get(port) {
            return framer.clone();
        }
        self.framers
            .write()
            .entry(port.clone())
            .or_default()
            .clone()
    }

    /// Feed bytes for a port under that port's lock
    pub fn feed(&self, port: &PortKey, bytes: &[u8]) -> Vec<CompletedMessage> {
        let framer = self.framer(port);
        let mut framer = framer.lock();
        framer.feed_all(port, bytes)
    }

    /// In-progress text for a port, if the port has been seen
    pub fn pending(&self, port: &PortKey) -> Option<String> {
        let framer = self.framers.read().get(port).cloned()?;
        let pending = framer.lock().pending().to_string();
        Some(pending)
    }

    /// Discard the in-progress text for a port
    pub fn discard(&self, port: &PortKey) {
        let framer = self.framers.read().get(port).cloned();
        if let Some(framer) = framer {
            framer.lock().discard();
        }
    }

    /// Ports with a buffer
    pub fn ports(&self) -> Vec<PortKey> {
        self.framers.read().keys().cloned().collect()
    }
}
