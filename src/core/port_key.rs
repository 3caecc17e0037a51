//! Port key normalization
//!
//! Serial drivers hand out port identifiers in several shapes: `COM3`,
//! `com3`, or device-namespace paths such as `\\.\COM3`. Everything inside the
//! engine is keyed by the canonical form produced here.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

const COM_MARKER: &str = "COM";

/// Canonicalize a raw port identifier.
///
/// The input is uppercased and, if it contains `COM`, everything before the
/// first occurrence is stripped. Identifiers without `COM` (for example
/// `/dev/ttyUSB0`) are returned uppercased in full. An empty input is
/// returned unchanged.
///
/// ```
/// use comframe_core::normalize_port;
///
/// assert_eq!(normalize_port(r"\\.\COM3"), "COM3");
/// assert_eq!(normalize_port("com7"), "COM7");
/// assert_eq!(normalize_port(""), "");
/// ```
pub fn normalize_port(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    // Slice the uppercased copy; its byte length may differ from `raw`
    let upper = raw.to_uppercase();
    match upper.find(COM_MARKER) {
        Some(idx) => upper[idx..].to_string(),
        None => upper,
    }
}

/// Canonical identifier of a physical serial port
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortKey(String);

impl PortKey {
    /// Normalize a raw identifier into a key
    pub fn normalize(raw: &str) -> Self {
        Self(normalize_port(raw))
    }

    /// Key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the key is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PortKey {
    fn from(raw: &str) -> Self {
        Self::normalize(raw)
    }
}

impl From<String> for PortKey {
    fn from(raw: String) -> Self {
        Self::normalize(&raw)
    }
}

impl AsRef<str> for PortKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PortKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}
