//! Comframe CLI - monitor serial ports as line streams
//!
//! Opens one or more ports, prints every completed line with its port and
//! timestamp, and forwards stdin lines to the open ports.

use clap::{Parser, Subcommand};
use comframe_core::cli::{format_message, format_port_list, print_exit_codes};
use comframe_core::{
    logging, AppConfig, CliResult, Dispatcher, ExitCodes, NativeSerialDriver, OutputFormat,
    PortConfig, PortEvent, PortKey, SerialDriver, SerialFlowControl, SerialParity,
    SessionRegistry, VirtualDriver,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Comframe CLI
#[derive(Parser, Debug)]
#[command(
    name = "comframe",
    author = "Comframe Team",
    version,
    about = "Multi-port serial line monitor",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "COMFRAME_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output (status changes, debug logging)
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    quiet: bool,

    /// Use in-memory ports that echo whatever is sent to them
    #[arg(long = "virtual", global = true)]
    virtual_ports: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Line settings overriding the config defaults
#[derive(clap::Args, Debug, Clone, Default)]
struct LineArgs {
    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Data bits (5-8)
    #[arg(long)]
    data_bits: Option<u8>,

    /// Stop bits (1, 2)
    #[arg(long)]
    stop_bits: Option<u8>,

    /// Parity (none, odd, even)
    #[arg(long)]
    parity: Option<SerialParity>,

    /// Flow control (none, hw, sw)
    #[arg(long)]
    flow: Option<SerialFlowControl>,
}

impl LineArgs {
    fn apply(&self, mut config: PortConfig) -> PortConfig {
        if let Some(baud) = self.baud {
            config.baud_rate = baud;
        }
        if let Some(bits) = self.data_bits {
            config.data_bits = bits;
        }
        if let Some(bits) = self.stop_bits {
            config.stop_bits = bits;
        }
        if let Some(parity) = self.parity {
            config.parity = parity;
        }
        if let Some(flow) = self.flow {
            config.flow_control = flow;
        }
        config
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts,

    /// Open ports and print received lines until interrupted
    Monitor {
        /// Port names or preset names (repeatable)
        #[arg(short, long = "port", required = true)]
        ports: Vec<String>,

        #[command(flatten)]
        line: LineArgs,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Send one line of text to a port
    Send {
        /// Port name or preset name
        #[arg(short, long)]
        port: String,

        /// Text to send
        text: String,

        #[command(flatten)]
        line: LineArgs,

        /// Print received lines for this many seconds before closing
        #[arg(long, default_value = "0")]
        wait: u64,
    },

    /// Print the exit code table
    ExitCodes,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    let mut config = match config {
        Ok(config) => config,
        Err(e) => return finish(&cli, CliResult::from(e)),
    };

    if cli.verbose {
        config.logging.level = "debug".to_string();
    } else if cli.quiet {
        config.logging.level = "error".to_string();
    }
    let _log_guard = match logging::init(&config.logging) {
        Ok(guard) => guard,
        Err(e) => return finish(&cli, CliResult::error(ExitCodes::CONFIG_ERROR, e.to_string())),
    };

    debug!("Starting comframe v{}", env!("CARGO_PKG_VERSION"));

    let result = match &cli.command {
        Commands::ListPorts => list_ports(&cli, &config).await,
        Commands::Monitor {
            ports,
            line,
            duration,
        } => monitor(&cli, &config, ports, line, *duration).await,
        Commands::Send {
            port,
            text,
            line,
            wait,
        } => send(&cli, &config, port, text, line, *wait).await,
        Commands::ExitCodes => {
            print_exit_codes();
            CliResult::success()
        }
    };

    finish(&cli, result)
}

fn finish(cli: &Cli, result: CliResult) -> ExitCode {
    match &result {
        CliResult::Error(_, msg) => eprintln!("Error: {}", msg),
        CliResult::Success(Some(msg)) if !cli.quiet => eprintln!("{}", msg),
        CliResult::Success(_) => {}
    }
    result.to_exit_code()
}

fn build_driver(cli: &Cli, config: &AppConfig, ports: &[PortConfig]) -> Arc<dyn SerialDriver> {
    if cli.virtual_ports {
        let driver = VirtualDriver::with_ports(ports.iter().map(|p| p.port_name.as_str()));
        driver.set_echo(true);
        Arc::new(driver)
    } else {
        Arc::new(NativeSerialDriver::with_capacity(config.dispatch.chunk_capacity))
    }
}

fn build_dispatcher(config: &AppConfig, driver: Arc<dyn SerialDriver>) -> Arc<Dispatcher> {
    let registry = Arc::new(SessionRegistry::with_capacity(config.dispatch.event_capacity));
    Arc::new(Dispatcher::new(driver, registry).with_line_ending(config.dispatch.line_ending))
}

fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let handler_token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        warn!(error = %e, "could not install Ctrl+C handler");
    }
    token
}

async fn sleep_for(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

async fn list_ports(cli: &Cli, config: &AppConfig) -> CliResult {
    let presets: Vec<PortConfig> = config.presets.iter().map(|p| p.config.clone()).collect();
    let dispatcher = build_dispatcher(config, build_driver(cli, config, &presets));

    match dispatcher.list_ports().await {
        Ok(ports) if ports.is_empty() => {
            if !cli.quiet {
                eprintln!("No serial ports found.");
            }
            CliResult::success()
        }
        Ok(ports) => {
            println!("{}", format_port_list(&ports, cli.format));
            CliResult::success()
        }
        Err(e) => CliResult::from(e),
    }
}

async fn monitor(
    cli: &Cli,
    config: &AppConfig,
    ports: &[String],
    line: &LineArgs,
    duration: Option<u64>,
) -> CliResult {
    let configs: Vec<PortConfig> = ports
        .iter()
        .map(|p| line.apply(config.port_config(p)))
        .collect();

    let dispatcher = build_dispatcher(config, build_driver(cli, config, &configs));
    let mut events = dispatcher.registry().subscribe();
    let subscription = dispatcher.attach();
    let interrupted = interrupt_token();

    let connected: Vec<PortKey> = dispatcher
        .connect(&configs)
        .await
        .into_iter()
        .filter_map(|outcome| match outcome.result {
            Ok(()) => Some(outcome.port),
            Err(e) => {
                eprintln!("Failed to connect to {}: {}", outcome.port, e);
                None
            }
        })
        .collect();

    if connected.is_empty() {
        subscription.shutdown().await;
        return CliResult::connection_failed("No port could be opened");
    }
    if !cli.quiet {
        let names: Vec<&str> = connected.iter().map(PortKey::as_str).collect();
        eprintln!("Connected to {}. Press Ctrl+C to exit.", names.join(", "));
    }

    let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(64);
    let stdin_task = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stdin_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    let deadline = sleep_for(duration.map(Duration::from_secs));
    tokio::pin!(deadline);
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = interrupted.cancelled() => break,
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(PortEvent::MessageReceived(message)) => {
                    println!("{}", format_message(&message, cli.format));
                }
                Ok(PortEvent::StatusChanged { port, status }) if cli.verbose => {
                    eprintln!("{}: {}", port, status);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "output fell behind, lines skipped");
                }
                Err(RecvError::Closed) => break,
            },
            input = stdin_rx.recv(), if stdin_open => match input {
                Some(text) => {
                    for port in &connected {
                        if let Err(e) = dispatcher.send(port.as_str(), &text).await {
                            eprintln!("{}", e);
                        }
                    }
                }
                None => stdin_open = false,
            },
        }
    }

    stdin_task.abort();
    for port in &connected {
        if let Err(e) = dispatcher.disconnect(port.as_str()).await {
            eprintln!("{}", e);
        }
    }
    subscription.shutdown().await;

    if !cli.quiet {
        eprintln!("Disconnected.");
    }
    if interrupted.is_cancelled() {
        CliResult::cancelled()
    } else {
        CliResult::success()
    }
}

async fn send(
    cli: &Cli,
    config: &AppConfig,
    port: &str,
    text: &str,
    line: &LineArgs,
    wait: u64,
) -> CliResult {
    let port_config = line.apply(config.port_config(port));
    let dispatcher = build_dispatcher(config, build_driver(cli, config, std::slice::from_ref(&port_config)));
    let mut events = dispatcher.registry().subscribe();
    let subscription = dispatcher.attach();

    let key = match dispatcher.connect_one(&port_config).await {
        Ok(key) => key,
        Err(e) => {
            subscription.shutdown().await;
            return CliResult::from(e);
        }
    };

    let result = match dispatcher.send(key.as_str(), text).await {
        Ok(written) => {
            debug!(port = %key, written, "sent");
            CliResult::success()
        }
        Err(e) => CliResult::from(e),
    };

    if result.is_success() && wait > 0 {
        let deadline = tokio::time::sleep(Duration::from_secs(wait));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => match event {
                    Ok(PortEvent::MessageReceived(message)) if message.port == key => {
                        println!("{}", format_message(&message, cli.format));
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    if let Err(e) = dispatcher.disconnect(key.as_str()).await {
        warn!(port = %key, error = %e, "close after send failed");
    }
    subscription.shutdown().await;
    result
}
