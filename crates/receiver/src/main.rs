//! Mirrorwall receiver
//!
//! Accepts screen-mirroring devices and shows their feeds on one wall.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use receiver::config::{default_config_path, Config, LoggingConfig};
use receiver::devices::TrustStore;
use receiver::orchestrator::{load_or_generate_identity, ReceiverRuntime, IDENTITY_FILE};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Mirrorwall - multi-device screen-mirroring receiver.
#[derive(Parser, Debug)]
#[command(name = "mirrorwall")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the receiver
    Start {
        /// Port for the mirroring protocol
        #[arg(long, short)]
        port: Option<u16>,

        /// Name advertised to devices
        #[arg(long, short)]
        name: Option<String>,
    },

    /// Manage paired devices
    #[command(subcommand)]
    Devices(DevicesCommands),

    /// Inspect the configuration
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Show the receiver identity
    Identity,
}

/// Subcommands for device management.
#[derive(Subcommand, Debug, Clone)]
pub enum DevicesCommands {
    /// List all paired devices
    List,

    /// Revoke a paired device; it must pair again with the PIN
    Revoke {
        /// Identifier the device paired as
        identifier: String,
    },
}

/// Subcommands for configuration.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Print the configuration file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    if let Commands::Start { port, name } = &cli.command {
        if let Some(port) = port {
            config.receiver.port = *port;
        }
        if let Some(name) = name {
            config.receiver.display_name = name.clone();
        }
    }
    config.validate()?;

    let _log_guard = init_logging(cli.verbose, &config.logging)?;
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Start { .. } => run_receiver(config).await?,
        Commands::Devices(cmd) => {
            let store = TrustStore::open(&config.receiver.data_dir)?;
            match cmd {
                DevicesCommands::List => {
                    let devices = store.list_devices();
                    if devices.is_empty() {
                        println!("No paired devices.");
                    } else {
                        println!("Paired devices:");
                        for device in devices {
                            println!(
                                "  {} - {} [{}] ({:?})",
                                device.identifier,
                                device.display_name.as_deref().unwrap_or("unnamed"),
                                device.fingerprint(),
                                device.trust_level
                            );
                        }
                    }
                }
                DevicesCommands::Revoke { identifier } => {
                    store.revoke(&identifier)?;
                    store.save()?;
                    println!("Device {} has been revoked", identifier);
                }
            }
        }
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show => print!("{}", config.to_toml()?),
            ConfigCommands::Path => println!("{}", config_path.display()),
        },
        Commands::Identity => {
            let identity =
                load_or_generate_identity(&config.receiver.data_dir.join(IDENTITY_FILE))?;
            println!("Identifier: {}", identity.identifier());
            println!("Public key: {}", hex::encode(identity.public_key_bytes()));
        }
    }

    Ok(())
}

/// Installs the tracing subscriber.
///
/// `--verbose` wins over `RUST_LOG`, which wins over the configured level.
/// The returned guard flushes the log file and must be kept alive.
fn init_logging(verbose: bool, logging: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    let Some(path) = &logging.file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("Invalid log file path: {}", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

/// Runs the receiver until a shutdown signal or a backend failure.
async fn run_receiver(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        name = %config.receiver.display_name,
        port = config.receiver.port,
        max_feeds = config.registry.max_feeds,
        "Mirrorwall starting"
    );

    let runtime = ReceiverRuntime::new(config)?;
    runtime.start().await?;

    let token = runtime.shutdown_token();
    let backend_failed = tokio::select! {
        result = wait_for_shutdown_signal() => {
            result?;
            false
        }
        _ = token.cancelled() => true,
    };

    runtime.stop().await?;
    if backend_failed {
        anyhow::bail!("Mirroring backend stopped unexpectedly");
    }
    Ok(())
}

/// Waits for SIGTERM or SIGINT.
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}
