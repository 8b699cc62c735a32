//! tsircd - P10 IRC daemon binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tsircd_core::{Capabilities, Config, Server};
use tsircd_modules::default_modules;

/// tsircd - a timestamp-synchronised P10 IRC daemon
#[derive(Parser)]
#[command(name = "tsircd")]
#[command(about = "A P10 IRC daemon with timestamped channel synchronisation")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "tsircd.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Test configuration and exit
    #[arg(long)]
    test_config: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a default configuration file
    Config {
        /// Output file path
        #[arg(short, long, default_value = "tsircd.toml")]
        output: PathBuf,
    },
    /// Show server information
    Info,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    if let Some(command) = cli.command {
        match command {
            Commands::Config { output } => {
                generate_config(&output)?;
                return Ok(());
            }
            Commands::Info => {
                show_info();
                return Ok(());
            }
            Commands::Version => {
                show_version();
                return Ok(());
            }
        }
    }

    let config = if cli.config.exists() {
        info!("Loading configuration from {:?}", cli.config);
        Config::from_file(&cli.config)?
    } else {
        info!("Configuration file not found, using defaults");
        Config::default()
    };
    config.validate()?;

    if cli.test_config {
        let caps = config.capabilities();
        info!(
            "Configuration is valid: {} ({}), oplevels {}",
            config.server.name,
            config.server.numeric,
            if caps.contains(Capabilities::OPLEVELS) { "on" } else { "off" }
        );
        return Ok(());
    }

    let mut server = Server::new(config);
    for module in default_modules() {
        server.load_module(module).await?;
    }
    server.init().await?;

    info!("Starting tsircd...");
    server.start().await?;

    Ok(())
}

/// Initialize logging
fn init_logging(level: &str) -> anyhow::Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    Ok(())
}

/// Generate default configuration file
fn generate_config(output: &PathBuf) -> anyhow::Result<()> {
    let config = Config::default();
    config.to_file(output)?;
    println!("Generated default configuration file: {:?}", output);
    Ok(())
}

/// Show server information
fn show_info() {
    println!("tsircd");
    println!("======");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Description: {}", env!("CARGO_PKG_DESCRIPTION"));
    println!("Repository: {}", env!("CARGO_PKG_REPOSITORY"));
    println!("License: {}", env!("CARGO_PKG_LICENSE"));
    println!();
    println!("Features:");
    println!("  - P10 server protocol with numeric nicks");
    println!("  - Channel timestamps and net burst merging");
    println!("  - Op levels with channel admin/user passwords");
    println!("  - Delayed join channels");
}

/// Show version information
fn show_version() {
    println!("tsircd {}", env!("CARGO_PKG_VERSION"));
}
