use serde::Serialize;

use crate::{AddressList, error::RequestError};

/// The body of a relayed message. Exactly one representation is carried.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Body {
    PlainText(String),
    Html { content: String, charset: String },
}

impl Body {
    /// The textual content, whichever form it is in.
    pub fn content(&self) -> &str {
        match self {
            Self::PlainText(text) => text,
            Self::Html { content, .. } => content,
        }
    }

    pub const fn is_html(&self) -> bool {
        matches!(self, Self::Html { .. })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Recipients {
    pub to: AddressList,
    pub cc: AddressList,
    pub bcc: AddressList,
}

impl Recipients {
    pub fn is_empty(&self) -> bool {
        self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty()
    }

    /// Total recipient count across every list.
    pub fn count(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }
}

/// A fully-parsed outbound message, ready to hand to a transport.
///
/// Instances are only built through [`DeliveryRequest::new`], so a request
/// always has a subject, a sender, and at least one `to` recipient.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRequest {
    subject: String,
    body: Body,
    sender_address: String,
    reply_to: AddressList,
    recipients: Recipients,
}

impl DeliveryRequest {
    /// # Errors
    ///
    /// Fails if the subject or sender is empty, or if no recipients remain.
    pub fn new(
        subject: impl Into<String>,
        body: Body,
        sender_address: impl Into<String>,
        reply_to: AddressList,
        recipients: Recipients,
    ) -> Result<Self, RequestError> {
        let subject = subject.into();
        let sender_address = sender_address.into();

        if subject.is_empty() {
            return Err(RequestError::MissingSubject);
        }
        if sender_address.is_empty() {
            return Err(RequestError::MissingSender);
        }
        if recipients.to.is_empty() {
            return Err(RequestError::NoRecipients);
        }

        Ok(Self {
            subject,
            body,
            sender_address,
            reply_to,
            recipients,
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub const fn body(&self) -> &Body {
        &self.body
    }

    pub fn sender_address(&self) -> &str {
        &self.sender_address
    }

    pub const fn reply_to(&self) -> &AddressList {
        &self.reply_to
    }

    pub const fn recipients(&self) -> &Recipients {
        &self.recipients
    }
}
