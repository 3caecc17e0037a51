//! Output formatting for received lines and port lists

use crate::core::framing::CompletedMessage;
use chrono::SecondsFormat;

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// `[timestamp] PORT: text`
    #[default]
    Text,
    /// Text only, no decoration
    Raw,
    /// One JSON object per line
    Json,
    /// `timestamp,port,seq,text`
    Csv,
}

/// Format a completed line for stdout
pub fn format_message(message: &CompletedMessage, format: OutputFormat) -> String {
    let timestamp = message.received_at.to_rfc3339_opts(SecondsFormat::Millis, true);
    match format {
        OutputFormat::Text => format!("[{}] {}: {}", timestamp, message.port, message.text),
        OutputFormat::Raw => message.text.clone(),
        OutputFormat::Json => serde_json::json!({
            "port": message.port,
            "text": message.text,
            "timestamp": timestamp,
            "seq": message.seq,
        })
        .to_string(),
        OutputFormat::Csv => format!(
            "{},{},{},{}",
            timestamp,
            csv_field(message.port.as_str()),
            message.seq,
            csv_field(&message.text)
        ),
    }
}

/// Format a port list for stdout
pub fn format_port_list(ports: &[String], format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => serde_json::json!(ports).to_string(),
        OutputFormat::Csv => std::iter::once("name".to_string())
            .chain(ports.iter().map(|p| csv_field(p)))
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Text | OutputFormat::Raw => ports.join("\n"),
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
