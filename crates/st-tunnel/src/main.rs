//! sertun CLI
//!
//! - `connect`: expose remote serial devices as local endpoints
//! - `serve`: remote side, bridges stdin/stdout to a local device

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use st_core::config::{self, ClientConfig};
use st_core::types::{DeviceSpec, Target};
use st_tunnel::{serve, Orchestrator, SessionRunner, SshConnector};

#[derive(Parser)]
#[command(name = "sertun")]
#[command(author, version, about = "Expose serial devices across machines over SSH")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tunnel remote devices to local endpoints
    Connect {
        /// Remote host: hostname[:port] or [v6addr]:port
        target: String,

        /// Devices: path, or localPath:remotePath
        #[arg(required = true)]
        devices: Vec<String>,

        /// Remote login user
        #[arg(short = 'l', long)]
        user: Option<String>,

        /// SSH port when the target does not name one
        #[arg(short, long)]
        port: Option<u16>,

        /// Private key for authentication
        #[arg(short, long)]
        identity: Option<PathBuf>,

        /// Record unknown host keys in known_hosts
        #[arg(short = 'a', long)]
        accept_new_hosts: bool,

        /// Executable to run on the remote host
        #[arg(short, long)]
        exec: Option<String>,

        /// Replace existing local symlinks
        #[arg(short, long)]
        force: bool,

        /// Ask the remote side to replace existing symlinks
        #[arg(long)]
        force_remote: bool,

        /// Known hosts file
        #[arg(long)]
        known_hosts: Option<PathBuf>,
    },

    /// Bridge stdin/stdout to a local device (run on the remote host)
    Serve {
        /// Device path; a pseudo-terminal is linked here if it does not exist
        device: PathBuf,

        /// Replace an existing symlink
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries device data in serve mode, so logs go to stderr
    let log_level = if cli.verbose { "debug" } else { &cli.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Connect {
            target,
            devices,
            user,
            port,
            identity,
            accept_new_hosts,
            exec,
            force,
            force_remote,
            known_hosts,
        } => {
            let mut config = load_client_config(cli.config.as_deref())?;

            if let Some(user) = user {
                config.username = user;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if identity.is_some() {
                config.identity_file = identity;
            }
            if let Some(known_hosts) = known_hosts {
                config.known_hosts = known_hosts;
            }
            if let Some(exec) = exec {
                config.remote_exec = exec;
            }
            config.accept_new_hosts |= accept_new_hosts;
            config.force_link |= force;
            config.force_remote_link |= force_remote;

            connect(config, &target, &devices, cli.verbose).await
        }

        Commands::Serve { device, force } => {
            let result = serve::serve(&device, force).await;
            // A pending stdin read would block runtime shutdown
            match result {
                Ok(()) => std::process::exit(0),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}

/// Load the client configuration: an explicit path must load, the default
/// path is used when present
fn load_client_config(path: Option<&Path>) -> Result<ClientConfig> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            ClientConfig::default()
        }))
    } else {
        tracing::debug!("Using default configuration");
        Ok(ClientConfig::default())
    }
}

async fn connect(
    config: ClientConfig,
    target: &str,
    devices: &[String],
    verbose: bool,
) -> Result<()> {
    let target = Target::parse_with_port(target, config.port)?;
    let devices = devices
        .iter()
        .map(|spec| spec.parse::<DeviceSpec>())
        .collect::<Result<Vec<_>, _>>()?;

    let runner = SessionRunner::new(config.remote_command().debug(verbose));
    let force_link = config.force_link;
    let connector = SshConnector::new(config)?;

    Orchestrator::new(connector, runner)
        .force_link(force_link)
        .run(&target, &devices)
        .await?;

    Ok(())
}
