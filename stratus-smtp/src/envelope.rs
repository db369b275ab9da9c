//! Turn a raw submitted message into a [`DeliveryRequest`].
//!
//! Only a small subset of RFC 5322 and MIME is understood: a flat header
//! block, and optionally a single base64 encoded part introduced by a
//! `MIME_boundary_*` marker. Anything richer is out of scope for the relay.
//!
//! The parser walks the message line by line through four states:
//!
//! ```text
//! Headers ──blank──▶ PlainBody                          (no Mime-Version)
//!    │
//!    └──blank──▶ MimeHeaders ──blank──▶ MimeBody        (Mime-Version seen)
//! ```

use std::fmt::{self, Display};

use base64::{
    Engine,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use charset::Charset;
use stratus_common::{AddressInput, AddressList, Body, DeliveryRequest, Recipients};

use crate::error::EnvelopeError;

const BOUNDARY_MARKER: &str = "MIME_boundary_";

/// The transport-level sender and recipients, as given to `MAIL FROM` and `RCPT TO`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvelopeSeed {
    pub mail_from: Option<String>,
    pub rcpt_tos: Vec<String>,
}

/// What was learned from the secondary MIME header block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MimeMetadata {
    pub content_type: Option<String>,
    pub charset: Option<String>,
    pub encoding: Option<String>,
    pub disposition: Option<String>,
    pub boundary: Option<String>,
}

impl MimeMetadata {
    fn capture(&mut self, line: &str) {
        if let Some(value) = line.strip_prefix("Content-Type:") {
            let mut parts = value.split(';').map(str::trim);
            self.content_type = parts
                .next()
                .filter(|kind| !kind.is_empty())
                .map(ToString::to_string);
            if let Some(charset) = parts.find_map(|part| part.strip_prefix("charset=")) {
                self.charset = Some(charset.trim_matches('"').to_string());
            }
        } else if let Some(value) = line.strip_prefix("Content-Transfer-Encoding:") {
            self.encoding = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Content-Disposition:") {
            self.disposition = Some(value.trim().to_string());
        } else if let Some(boundary) = find_boundary(line) {
            self.boundary = Some(boundary.to_string());
        }
    }
}

impl Display for MimeMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = [
            ("type", &self.content_type),
            ("charset", &self.charset),
            ("encoding", &self.encoding),
            ("disposition", &self.disposition),
            ("boundary", &self.boundary),
        ];

        write!(f, "{{")?;
        let mut first = true;
        for (name, value) in fields {
            if let Some(value) = value {
                if !first {
                    write!(f, ", ")?;
                }
                first = false;
                write!(f, "{name}: {value}")?;
            }
        }
        write!(f, "}}")
    }
}

/// Find a `MIME_boundary_<alnum>` token anywhere in `line`.
fn find_boundary(line: &str) -> Option<&str> {
    let start = line.find(BOUNDARY_MARKER)?;
    let token = &line[start..];
    let suffix = token[BOUNDARY_MARKER.len()..]
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(token.len() - BOUNDARY_MARKER.len());

    (suffix > 0).then(|| &token[..BOUNDARY_MARKER.len() + suffix])
}

enum State {
    Headers,
    MimeHeaders(MimeMetadata),
    MimeBody(MimeMetadata),
    PlainBody,
    Done(Body),
}

#[derive(Default)]
struct Headers {
    subject: Option<String>,
    from: AddressList,
    to: AddressList,
    cc: AddressList,
    bcc: AddressList,
    reply_to: AddressList,
    mime_present: bool,
}

impl Headers {
    fn seeded(seed: &EnvelopeSeed) -> Result<Self, EnvelopeError> {
        let mut headers = Self::default();
        if let Some(mail_from) = &seed.mail_from {
            headers.from.add(mail_from)?;
        }
        headers
            .to
            .add(AddressInput::Sequence(seed.rcpt_tos.iter().map(Into::into).collect()))?;
        Ok(headers)
    }

    fn capture(&mut self, line: &str) -> Result<(), EnvelopeError> {
        let Some((name, value)) = line.split_once(':') else {
            return Ok(());
        };
        let value = value.trim_start();

        match name {
            "Subject" => self.subject = Some(value.to_string()),
            "To" => self.to.add(value)?,
            "Cc" => self.cc.add(value)?,
            "Bcc" => self.bcc.add(value)?,
            "From" => self.from.add(value)?,
            "Reply-To" => self.reply_to.add(value)?,
            "Mime-Version" => self.mime_present = true,
            _ => {}
        }

        Ok(())
    }
}

/// Converts raw messages into delivery requests sent as the relay's own identity.
#[derive(Clone, Debug)]
pub struct EnvelopeParser {
    from_address: String,
    move_from_replyto: bool,
}

impl EnvelopeParser {
    pub fn new(from_address: impl Into<String>, move_from_replyto: bool) -> Self {
        Self {
            from_address: from_address.into(),
            move_from_replyto,
        }
    }

    /// Parse `raw` into a request, seeding the address lists from `seed`.
    ///
    /// The sender is always the configured `from_address`. When
    /// `move_from_replyto` is set, whoever the message claimed to be from
    /// becomes the reply-to list instead.
    ///
    /// # Errors
    ///
    /// Any [`EnvelopeError`]; the message should be rejected as a whole.
    pub fn parse(&self, raw: &[u8], seed: &EnvelopeSeed) -> Result<DeliveryRequest, EnvelopeError> {
        let text = std::str::from_utf8(raw)?;
        let mut lines = text.split("\r\n");
        let mut headers = Headers::seeded(seed)?;

        let mut state = State::Headers;
        let body = loop {
            state = match state {
                State::Headers => match lines.next() {
                    None => return Err(EnvelopeError::NoBody),
                    Some("") => {
                        let mut ahead = lines.clone();
                        if matches!((ahead.next(), ahead.next()), (None, _) | (Some(""), None)) {
                            return Err(EnvelopeError::NoBody);
                        }

                        if headers.mime_present {
                            State::MimeHeaders(MimeMetadata::default())
                        } else {
                            State::PlainBody
                        }
                    }
                    Some(line) => {
                        headers.capture(line)?;
                        State::Headers
                    }
                },
                State::PlainBody => State::Done(Body::PlainText(
                    lines.by_ref().collect::<Vec<_>>().join("\r\n"),
                )),
                State::MimeHeaders(mut mime) => match lines.next() {
                    None => return Err(EnvelopeError::UnterminatedMimeHeaders),
                    Some("") => State::MimeBody(mime),
                    Some(line) => {
                        mime.capture(line);
                        State::MimeHeaders(mime)
                    }
                },
                State::MimeBody(mime) => {
                    let encoded: String = lines
                        .by_ref()
                        .take_while(|line| {
                            mime.boundary
                                .as_deref()
                                .is_none_or(|boundary| !line.contains(boundary))
                        })
                        .flat_map(|line| line.split_ascii_whitespace())
                        .collect();

                    State::Done(decode_html(&encoded, mime)?)
                }
                State::Done(body) => break body,
            };
        };

        let reply_to = if self.move_from_replyto {
            headers.from
        } else {
            headers.reply_to
        };
        let sender = AddressList::from_input(self.from_address.as_str())?;

        Ok(DeliveryRequest::new(
            headers.subject.unwrap_or_default(),
            body,
            sender.first_address()?,
            reply_to,
            Recipients {
                to: headers.to,
                cc: headers.cc,
                bcc: headers.bcc,
            },
        )?)
    }
}

/// Mail clients wrap and pad base64 inconsistently, so padding is optional.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

fn decode_html(encoded: &str, mime: MimeMetadata) -> Result<Body, EnvelopeError> {
    // Characters outside the base64 alphabet are skipped.
    let encoded: String = encoded
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        .collect();

    let bytes = match LENIENT_BASE64.decode(encoded) {
        Ok(bytes) => bytes,
        Err(source) => return Err(EnvelopeError::Base64 { source, mime }),
    };

    let (charset, label) = match mime.charset.clone() {
        None => (Charset::for_encoding(encoding_rs::UTF_8), "utf-8".to_string()),
        Some(label) => match Charset::for_label(label.as_bytes()) {
            Some(charset) => (charset, label),
            None => return Err(EnvelopeError::UnknownCharset { label, mime }),
        },
    };

    match charset.decode_without_bom_handling(&bytes) {
        (content, false) => Ok(Body::Html {
            content: content.into_owned(),
            charset: label,
        }),
        (_, true) => Err(EnvelopeError::Charset { label, mime }),
    }
}
