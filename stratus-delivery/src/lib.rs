//! Reliable delivery of parsed messages: a bounded delay queue, the retry
//! state machine that drives attempts through a [`Transport`], and the audit
//! log those attempts leave behind.

pub mod auth;
pub mod clock;
pub mod error;
pub mod manager;
pub mod queue;
pub mod retry;
pub mod sendlog;
pub mod transport;
pub mod types;

pub use auth::{AccessKey, Credential, RequestSignature, ServicePrincipal};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CredentialError, QueueError, TransportError};
pub use manager::{AttemptOutcome, DeliveryConfig, DeliveryManager};
pub use queue::{DelayQueue, QueueConfig, Scheduler};
pub use retry::RetryPolicy;
pub use sendlog::{AuditLogEntry, AuditStatus, SendLog};
pub use transport::{HttpTransport, HttpTransportConfig, Transport, TransportReceipt};
pub use types::RetryJob;
