//! The seam between the SMTP dialogue and whatever decides what to do with mail.

use std::net::SocketAddr;

use async_trait::async_trait;
use stratus_common::Reply;

/// A completed `MAIL`/`RCPT`/`DATA` exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub peer: SocketAddr,
    /// `None` for the null reverse-path.
    pub mail_from: Option<String>,
    /// Only the recipients the RCPT hook accepted.
    pub rcpt_tos: Vec<String>,
    /// The message with dot-stuffing removed and the final CRLF stripped.
    pub content: Vec<u8>,
}

/// Business decisions made during an SMTP session.
///
/// The session owns protocol state and I/O; implementors only decide how to
/// answer. A positive reply to [`SmtpHooks::on_rcpt`] records the recipient
/// in the transaction, anything else leaves it out.
#[async_trait]
pub trait SmtpHooks: Send + Sync {
    async fn on_rcpt(&self, peer: SocketAddr, address: &str) -> Reply;

    async fn on_data(&self, transaction: &Transaction) -> Reply;
}
