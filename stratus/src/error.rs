use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The SMTP engine failed more often than the configured hourly limit.
    #[error("Restarted {restarts} times in the last hour (limit {limit}), giving up")]
    RestartStorm { restarts: usize, limit: u32 },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("SMTP engine failed: {0}")]
    Engine(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] stratus_delivery::TransportError),
}

impl RelayError {
    /// Returns `true` for errors that must end the process.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::RestartStorm { .. })
    }
}
