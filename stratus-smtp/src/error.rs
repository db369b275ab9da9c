//! Error types for the stratus-smtp crate.

use std::io;

use stratus_common::{AddressError, RequestError};
use thiserror::Error;

use crate::envelope::MimeMetadata;

/// Reasons a raw message could not be turned into a delivery request.
///
/// Every variant is a malformed envelope; the SMTP layer answers all of them
/// the same way but logs the specific reason.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Message is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("No message body found")]
    NoBody,

    #[error("MIME header block is not terminated by a blank line")]
    UnterminatedMimeHeaders,

    #[error("Unable to decode message MIME data: {mime}, error: {source}")]
    Base64 {
        #[source]
        source: base64::DecodeError,
        mime: MimeMetadata,
    },

    #[error("Unable to decode message MIME data: {mime}, error: unknown charset {label:?}")]
    UnknownCharset { label: String, mime: MimeMetadata },

    #[error("Unable to decode message MIME data: {mime}, error: content is not valid {label}")]
    Charset { label: String, mime: MimeMetadata },

    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),

    #[error("Incomplete message: {0}")]
    Incomplete(#[from] RequestError),
}

/// Invalid relay policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("Invalid subnet {0:?}")]
    InvalidSubnet(String),

    #[error("Invalid prefix length in subnet {0:?}")]
    InvalidPrefix(String),

    #[error("Invalid destination domain {0:?}")]
    InvalidDomain(String),
}

/// Errors that end an SMTP session early.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    #[error("Session timed out after {0} seconds")]
    Timeout(u64),

    #[error("Shutdown requested")]
    Shutdown,
}

impl SessionError {
    /// Returns `true` if the error indicates a graceful shutdown.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}
