#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::Parser;
use stratus::{Config, RelayError, RelayService, config::find_config_file};
use stratus_common::{internal, tracing};

/// Relay mail from trusted networks through a cloud e-mail service
#[derive(Parser, Debug)]
#[command(name = "stratus")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $STRATUS_CONFIG, ./stratus.toml, then /etc/stratus/stratus.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Address to listen on
    #[arg(long)]
    address: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Sender address for every relayed message
    #[arg(long)]
    from_address: Option<String>,

    /// Destination domains to relay to, comma separated
    #[arg(long, value_delimiter = ',')]
    domains: Option<Vec<String>>,

    /// Source subnets allowed to relay, comma separated
    #[arg(long, value_delimiter = ',')]
    subnets: Option<Vec<String>>,
}

impl Cli {
    fn load(&self) -> anyhow::Result<Config> {
        let mut config = match find_config_file(self.config.as_deref())? {
            Some(path) => Config::load(&path)
                .with_context(|| format!("Unable to load {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(address) = &self.address {
            config.relay.address.clone_from(address);
        }
        if let Some(port) = self.port {
            config.relay.port = port;
        }
        if let Some(from_address) = &self.from_address {
            config.relay.from_address.clone_from(from_address);
        }
        if let Some(domains) = &self.domains {
            config.relay.allowed_dest_domains.clone_from(domains);
        }
        if let Some(subnets) = &self.subnets {
            config.relay.allowed_subnets.clone_from(subnets);
        }
        if let Some(level) = &self.log_level {
            config.relay.log_level = Some(level.clone());
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

async fn shutdown(service: Arc<RelayService>) -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    service.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = cli.load()?;

    stratus_common::logging::init(config.relay.log_level.as_deref());

    let service = Arc::new(RelayService::from_config(config)?);
    let signals = tokio::spawn(shutdown(Arc::clone(&service)));

    let result = service.run().await;
    signals.abort();

    match result {
        Ok(()) => {
            internal!(level = INFO, "Relay stopped");
            Ok(ExitCode::SUCCESS)
        }
        Err(err @ RelayError::RestartStorm { .. }) => {
            tracing::error!("{err}");
            Ok(ExitCode::from(2))
        }
        Err(err) => Err(err.into()),
    }
}
