//! Error types shared by every stratus crate.

use thiserror::Error;

/// Errors raised while building an [`AddressList`](crate::AddressList).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// A structured record carried an address that failed validation.
    #[error("Invalid address input: {0:?}")]
    InvalidAddressInput(String),

    /// The first address was requested from an empty list.
    #[error("Address list is empty")]
    EmptyAddressList,
}

/// Reasons a [`DeliveryRequest`](crate::DeliveryRequest) could not be assembled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("Subject is missing")]
    MissingSubject,

    #[error("No valid `to` recipients")]
    NoRecipients,

    #[error("Sender address is empty")]
    MissingSender,
}
