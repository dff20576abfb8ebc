// Main entry point - Configuration, dependency injection and console startup
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use injector_bench::application::device_session::DeviceSession;
use injector_bench::domain::command::CommandTable;
use injector_bench::infrastructure::config::load_device_config;
use injector_bench::infrastructure::serial_transport::{available_ports, SerialConnector};
use injector_bench::presentation::console;

#[derive(Parser, Debug)]
#[command(author, version, about = "Console for the fuel injector test bench", long_about = None)]
struct Args {
    /// Configuration file, without extension
    #[arg(long, default_value = "config/device")]
    config: String,

    /// Serial port, overrides the configuration
    #[arg(long)]
    port: Option<String>,

    /// Bit rate, overrides the configuration
    #[arg(long)]
    baud: Option<u32>,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so they do not interleave with console output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.list_ports {
        for port in available_ports()? {
            println!("{}", port);
        }
        return Ok(());
    }

    // Load configuration
    let mut config = load_device_config(&args.config)?;
    if let Some(port) = args.port {
        config.serial.port = port;
    }
    if let Some(baud) = args.baud {
        config.serial.baud_rate = baud;
    }

    let connector = Arc::new(SerialConnector::new(config.serial));
    let session = DeviceSession::new(connector, config.session);
    let printer = console::spawn_printer(&session);

    session.open().await?;
    let outcome = console::run(&session, &CommandTable).await;

    if session.close().await.is_err() {
        tracing::info!("Link was already closed");
    }
    printer.abort();
    outcome
}
