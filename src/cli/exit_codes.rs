//! CLI Exit Codes
//!
//! Standard exit codes for CLI operations and automation.

use crate::config::ConfigError;
use crate::core::driver::{CloseFailure, DriverError, OpenFailure, WriteFailure};
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Port enumeration failed
    pub const ENUMERATION_FAILED: u8 = 9;

    /// Write failed
    pub const WRITE_FAILED: u8 = 10;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Device busy
    pub const DEVICE_BUSY: u8 = 13;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Failure with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// No port could be opened
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::Error(ExitCodes::CONNECTION_FAILED, msg.into())
    }

    /// Stopped by Ctrl+C
    pub fn cancelled() -> Self {
        Self::Error(ExitCodes::CANCELLED, "Interrupted".to_string())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) => Some(msg),
            Self::Error(_, msg) => Some(msg),
            _ => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<&DriverError> for CliResult {
    fn from(err: &DriverError) -> Self {
        let code = match err {
            DriverError::Enumerate(_) => ExitCodes::ENUMERATION_FAILED,
            DriverError::Open { reason, .. } => match reason {
                OpenFailure::NotFound => ExitCodes::PORT_NOT_FOUND,
                OpenFailure::Busy => ExitCodes::DEVICE_BUSY,
                OpenFailure::PermissionDenied => ExitCodes::PERMISSION_DENIED,
                OpenFailure::InvalidConfig(_) => ExitCodes::INVALID_ARGS,
                OpenFailure::Io(_) => ExitCodes::CONNECTION_FAILED,
            },
            DriverError::Close { reason, .. } => match reason {
                CloseFailure::Removed => ExitCodes::PORT_NOT_FOUND,
                CloseFailure::AlreadyClosed | CloseFailure::Io(_) => ExitCodes::ERROR,
            },
            DriverError::Write { reason, .. } => match reason {
                WriteFailure::NotOpen => ExitCodes::CONNECTION_FAILED,
                WriteFailure::Io(_) => ExitCodes::WRITE_FAILED,
            },
        };
        Self::Error(code, err.to_string())
    }
}

impl From<DriverError> for CliResult {
    fn from(err: DriverError) -> Self {
        Self::from(&err)
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

/// Every code the binary can return, with its meaning
pub const EXIT_CODE_TABLE: &[(u8, &str)] = &[
    (ExitCodes::SUCCESS, "Success"),
    (ExitCodes::ERROR, "General error"),
    (ExitCodes::INVALID_ARGS, "Invalid arguments or line settings"),
    (ExitCodes::CONNECTION_FAILED, "No port could be opened"),
    (ExitCodes::PERMISSION_DENIED, "Permission denied"),
    (ExitCodes::CONFIG_ERROR, "Configuration error"),
    (ExitCodes::ENUMERATION_FAILED, "Port enumeration failed"),
    (ExitCodes::WRITE_FAILED, "Write failed"),
    (ExitCodes::CANCELLED, "Interrupted"),
    (ExitCodes::DEVICE_BUSY, "Port busy"),
    (ExitCodes::PORT_NOT_FOUND, "Port not found"),
    (ExitCodes::INTERNAL_ERROR, "Internal error"),
];

/// Meaning of an exit code
pub fn exit_code_description(code: u8) -> &'static str {
    EXIT_CODE_TABLE
        .iter()
        .find(|(c, _)| *c == code)
        .map_or("Unknown error", |&(_, desc)| desc)
}

/// Print the exit code table
pub fn print_exit_codes() {
    println!("Exit codes:");
    for (code, desc) in EXIT_CODE_TABLE {
        println!("  {code:>3}  {desc}");
    }
}
