//! Errors raised while scheduling and sending relayed mail.

use std::time::Duration;

use thiserror::Error;

/// Transport credentials that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("No transport credentials: set either api_key or tenant_id, client_id and client_secret")]
    Missing,

    #[error("Incomplete service principal: {0} is not set")]
    Incomplete(&'static str),

    #[error("api_key is not valid base64")]
    InvalidKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Send queue is full ({capacity} jobs waiting)")]
    Full { capacity: usize },
}

/// A failed hand-off to the cloud e-mail service.
///
/// Every variant consumes one unit of the retry budget; the classification
/// helpers only inform logging.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Connection(String),

    /// The service answered, but refused the request.
    #[error("Rejected with HTTP {code}: {detail}")]
    Rejected { code: u16, detail: String },

    #[error("Unexpected response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl TransportError {
    /// Returns `true` if sending the same request again may succeed.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) => true,
            Self::Rejected { code, .. } => *code == 429 || *code >= 500,
            Self::Protocol(_) | Self::Credential(_) => false,
        }
    }

    pub const fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}
