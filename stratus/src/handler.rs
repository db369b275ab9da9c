//! The relay's answers to the SMTP engine's `RCPT` and `DATA` hooks.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use stratus_common::{Reply, Status, incoming, tracing};
use stratus_delivery::DeliveryManager;
use stratus_smtp::{
    EnvelopeParser, EnvelopeSeed, PolicyDecision, PolicyFilter, SmtpHooks, Transaction,
};

pub struct RelayHandler {
    policy: Arc<PolicyFilter>,
    parser: Arc<EnvelopeParser>,
    manager: Arc<DeliveryManager>,
}

impl RelayHandler {
    pub const fn new(
        policy: Arc<PolicyFilter>,
        parser: Arc<EnvelopeParser>,
        manager: Arc<DeliveryManager>,
    ) -> Self {
        Self {
            policy,
            parser,
            manager,
        }
    }
}

#[async_trait]
impl SmtpHooks for RelayHandler {
    async fn on_rcpt(&self, peer: SocketAddr, address: &str) -> Reply {
        match self.policy.check_recipient(address, peer.ip()) {
            PolicyDecision::Accept => Reply::ok(),
            PolicyDecision::RejectSource => {
                Reply::new(Status::Error, format!("{} not permitted", peer.ip()))
            }
            PolicyDecision::RejectDomain => {
                Reply::new(Status::Error, "not relaying to that domain")
            }
        }
    }

    async fn on_data(&self, transaction: &Transaction) -> Reply {
        let seed = EnvelopeSeed {
            mail_from: transaction.mail_from.clone(),
            rcpt_tos: transaction.rcpt_tos.clone(),
        };

        let request = match self.parser.parse(&transaction.content, &seed) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(
                    peer = %transaction.peer,
                    from = transaction.mail_from.as_deref().unwrap_or_default(),
                    to = ?transaction.rcpt_tos,
                    "Unable to process message: {err}"
                );
                return Reply::new(Status::Unprocessable, "Unable to process");
            }
        };

        incoming!(
            level = INFO,
            "Accepted '{}' from {} for {}",
            request.subject(),
            transaction.peer,
            request.recipients().to
        );

        match self.manager.submit(request) {
            Ok(()) => Reply::new(Status::Ok, "Message accepted for delivery"),
            Err(err) => {
                tracing::error!(peer = %transaction.peer, "Unable to queue message: {err}");
                Reply::new(Status::Unprocessable, "Queue error")
            }
        }
    }
}
