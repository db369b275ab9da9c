//! SMTP intake for the relay: the wire protocol engine, the recipient policy
//! applied at `RCPT`, and the parser that turns submitted mail into a
//! [`DeliveryRequest`](stratus_common::DeliveryRequest).

pub mod command;
pub mod envelope;
pub mod error;
pub mod hooks;
pub mod policy;
pub mod server;
pub mod session;

pub use envelope::{EnvelopeParser, EnvelopeSeed, MimeMetadata};
pub use error::{EnvelopeError, PolicyError, SessionError};
pub use hooks::{SmtpHooks, Transaction};
pub use policy::{PolicyConfig, PolicyDecision, PolicyFilter, Subnet};
pub use server::SmtpServer;
pub use session::SessionConfig;
