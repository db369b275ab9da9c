//! An SMTP relay that accepts mail from trusted local networks and forwards
//! it through a cloud e-mail service.

pub mod config;
pub mod error;
pub mod handler;
pub mod service;

pub use config::Config;
pub use error::RelayError;
pub use service::RelayService;
