//! CLI Module
//!
//! Provides command-line interface support:
//! - Exit codes for automation
//! - Output formatting for received lines

pub mod exit_codes;
pub mod output;

pub use exit_codes::{exit_code_description, print_exit_codes, CliResult, ExitCodes};
pub use output::{format_message, format_port_list, OutputFormat};
