//! Relay configuration, read from TOML.
//!
//! ```toml
//! [relay]
//! address = "0.0.0.0"
//! port = 10025
//! from_address = "relay@example.com"
//! allowed_dest_domains = ["example.com"]
//! allowed_subnets = ["192.168.0.0/16"]
//!
//! [server]
//! server_restart_per_hour = 5
//!
//! [transport]
//! endpoint = "https://example.communication.azure.com"
//! api_key = "..."
//! # or a service principal:
//! # tenant_id = "..."
//! # client_id = "..."
//! # client_secret = "..."
//! ```

use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use stratus_common::address::{is_valid_address, is_valid_domain};
use stratus_delivery::{Credential, CredentialError, DeliveryConfig, HttpTransportConfig, QueueConfig};
use stratus_smtp::{PolicyConfig, SessionConfig, Subnet};
use thiserror::Error;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "STRATUS_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config from {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("STRATUS_CONFIG points to non-existent file: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("Invalid from_address: '{0}'")]
    InvalidFromAddress(String),

    #[error("Invalid destination domain: '{0}'")]
    InvalidDomain(String),

    #[error("Invalid subnet: '{0}'")]
    InvalidSubnet(String),

    #[error("Invalid listen address: '{0}'")]
    InvalidListenAddress(String),

    #[error("Port 0 is not a valid listening port")]
    InvalidPort,

    #[error("max_queue_length must be at least 1")]
    InvalidQueueLength,

    #[error("Invalid server_restart_email: '{0}'")]
    InvalidRestartEmail(String),

    #[error("Transport {0} is required")]
    MissingTransport(&'static str),

    #[error("Invalid transport credentials: {0}")]
    Credentials(#[from] CredentialError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelaySection {
    #[serde(default = "defaults::address")]
    pub address: String,

    #[serde(default = "defaults::port")]
    pub port: u16,

    /// The sender every relayed message is sent as.
    #[serde(default)]
    pub from_address: String,

    #[serde(default, alias = "domains")]
    pub allowed_dest_domains: Vec<String>,

    #[serde(default, alias = "subnets")]
    pub allowed_subnets: Vec<String>,

    /// Replace each message's reply-to with its `From:` addresses.
    #[serde(default = "defaults::move_from_replyto")]
    pub move_from_replyto: bool,

    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(flatten)]
    pub delivery: DeliveryConfig,

    #[serde(flatten)]
    pub queue: QueueConfig,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            address: defaults::address(),
            port: defaults::port(),
            from_address: String::new(),
            allowed_dest_domains: Vec::new(),
            allowed_subnets: Vec::new(),
            move_from_replyto: defaults::move_from_replyto(),
            log_level: None,
            delivery: DeliveryConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerSection {
    #[serde(default = "SessionConfig::default_banner")]
    pub banner: String,

    #[serde(default = "SessionConfig::default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "defaults::command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Seconds between liveness checks of the SMTP engine.
    #[serde(default = "defaults::watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,

    /// Restarts tolerated in any rolling hour before giving up.
    #[serde(default = "defaults::server_restart_per_hour")]
    pub server_restart_per_hour: u32,

    #[serde(default = "defaults::restart_delay_secs")]
    pub restart_delay_secs: u64,

    /// Where to report a restart after an engine failure.
    #[serde(default)]
    pub server_restart_email: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            banner: SessionConfig::default_banner(),
            max_message_size: SessionConfig::default_max_message_size(),
            command_timeout_secs: defaults::command_timeout_secs(),
            watchdog_interval_secs: defaults::watchdog_interval_secs(),
            server_restart_per_hour: defaults::server_restart_per_hour(),
            restart_delay_secs: defaults::restart_delay_secs(),
            server_restart_email: None,
        }
    }
}

impl ServerSection {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            banner: self.banner.clone(),
            max_message_size: self.max_message_size,
            command_timeout: Duration::from_secs(self.command_timeout_secs),
        }
    }

    pub const fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub const fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

mod defaults {
    pub fn address() -> String {
        String::from("0.0.0.0")
    }

    pub const fn port() -> u16 {
        10025
    }

    pub const fn move_from_replyto() -> bool {
        true
    }

    pub const fn command_timeout_secs() -> u64 {
        300
    }

    pub const fn watchdog_interval_secs() -> u64 {
        1
    }

    pub const fn server_restart_per_hour() -> u32 {
        5
    }

    pub const fn restart_delay_secs() -> u64 {
        5
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default, alias = "azure")]
    pub transport: HttpTransportConfig,
}

impl Config {
    /// Parse a configuration document.
    ///
    /// # Errors
    ///
    /// Fails if `content` is not valid TOML or does not match the expected shape.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content)
    }

    /// The socket the SMTP engine listens on.
    ///
    /// # Errors
    ///
    /// Fails if the configured address is not an IP address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .relay
            .address
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddress(self.relay.address.clone()))?;

        Ok(SocketAddr::new(ip, self.relay.port))
    }

    /// # Errors
    ///
    /// Fails on the first destination domain or subnet that does not validate.
    pub fn policy(&self) -> Result<PolicyConfig, ConfigError> {
        PolicyConfig::new(&self.relay.allowed_dest_domains, &self.relay.allowed_subnets).map_err(
            |err| match err {
                stratus_smtp::PolicyError::InvalidDomain(domain) => {
                    ConfigError::InvalidDomain(domain)
                }
                stratus_smtp::PolicyError::InvalidSubnet(subnet)
                | stratus_smtp::PolicyError::InvalidPrefix(subnet) => {
                    ConfigError::InvalidSubnet(subnet)
                }
            },
        )
    }

    /// Check everything that can be checked before the relay starts.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_address(self.relay.from_address.trim()) {
            return Err(ConfigError::InvalidFromAddress(
                self.relay.from_address.clone(),
            ));
        }

        if let Some(domain) = self
            .relay
            .allowed_dest_domains
            .iter()
            .find(|domain| !is_valid_domain(domain.trim()))
        {
            return Err(ConfigError::InvalidDomain(domain.clone()));
        }

        if let Some(subnet) = self
            .relay
            .allowed_subnets
            .iter()
            .find(|subnet| subnet.parse::<Subnet>().is_err())
        {
            return Err(ConfigError::InvalidSubnet(subnet.clone()));
        }

        self.listen_addr()?;
        if self.relay.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self.relay.queue.max_queue_length == 0 {
            return Err(ConfigError::InvalidQueueLength);
        }

        if let Some(email) = &self.server.server_restart_email
            && !is_valid_address(email.trim())
        {
            return Err(ConfigError::InvalidRestartEmail(email.clone()));
        }

        if self.transport.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingTransport("endpoint"));
        }
        Credential::from_config(&self.transport)?;

        Ok(())
    }
}

/// Find the configuration file using the following precedence:
/// 1. An explicitly provided path
/// 2. `STRATUS_CONFIG` environment variable
/// 3. ./stratus.toml (current working directory)
/// 4. /etc/stratus/stratus.toml (system-wide config)
///
/// Returns `None` if no file was asked for and none of the default locations
/// exist.
///
/// # Errors
///
/// Fails if an explicitly requested file does not exist.
pub fn find_config_file(explicit: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
    if let Some(path) = explicit {
        return if path.exists() {
            Ok(Some(path.to_path_buf()))
        } else {
            Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: std::io::ErrorKind::NotFound.into(),
            })
        };
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(Some(path));
        }
        return Err(ConfigError::MissingFile(path));
    }

    Ok([
        PathBuf::from("./stratus.toml"),
        PathBuf::from("/etc/stratus/stratus.toml"),
    ]
    .into_iter()
    .find(|path| path.exists()))
}
