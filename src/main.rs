//! SSH Gateway
//!
//! An SSH bastion that authenticates users, shows each one the internal
//! hosts their groups may reach, and relays their terminal to the chosen
//! host, through a chain of proxy hosts where configured.

mod authz;
mod broker;
mod config;
mod credentials;
mod policy;
mod relay;
mod ssh;
mod transport;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::Broker;
use crate::config::{GatewayConfig, HostKeyCheck};
use crate::credentials::Credentials;
use crate::policy::PolicyStore;
use crate::transport::SshConnector;

/// SSH Gateway - policy-driven SSH bastion
#[derive(Parser, Debug)]
#[command(name = "sshgateway", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value_os_t = GatewayConfig::default_path())]
    config: PathBuf,

    /// Print the effective configuration and exit
    #[arg(long)]
    show_config: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Override listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    // Logs go to stderr so --show-config output stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if !cli.config.exists() {
        warn!(
            "Config file {} not found, using defaults",
            cli.config.display()
        );
    }
    let mut config = GatewayConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    if cli.show_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    let policy = Arc::new(
        PolicyStore::from_config(&config)
            .with_context(|| format!("Invalid policy in {}", cli.config.display()))?,
    );
    let credentials = Arc::new(Credentials::load(&config)?);

    let (host, port) = config.bind_addr();
    info!("Starting sshgateway");
    info!("  Listen address: {}:{}", host, port);
    info!(
        "  Policy: {} host(s), {} group(s), {} permission(s)",
        policy.hosts().len(),
        policy.groups().len(),
        policy.permissions().len()
    );
    if config.host_key_check == HostKeyCheck::None {
        warn!("Internal host keys are not verified (host_key_check = \"none\")");
    }

    let config = Arc::new(config);
    let broker = Arc::new(Broker::new(policy, SshConnector::new(config.clone())));

    ssh::run_server(config, credentials, broker).await?;

    Ok(())
}
