//! Hand-off of delivery requests to the cloud e-mail service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url, header::CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use stratus_common::{AddressList, Body, DeliveryRequest, Recipients, outgoing, tracing};
use tokio::time::Instant;

use crate::{auth::Credential, error::TransportError};

const USER_AGENT: &str = concat!("stratus/", env!("CARGO_PKG_VERSION"));

/// What the service reported about a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportReceipt {
    pub status: String,
    pub id: Option<String>,
    pub error: Option<String>,
}

impl TransportReceipt {
    pub fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case("succeeded")
    }

    fn is_terminal(&self) -> bool {
        ["succeeded", "failed", "canceled"]
            .iter()
            .any(|terminal| self.status.eq_ignore_ascii_case(terminal))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request`, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the service could not be reached or
    /// refused the request. A reachable service reporting a failed send is an
    /// `Ok` receipt with a non-success status.
    async fn send(
        &self,
        request: &DeliveryRequest,
        timeout: Duration,
    ) -> Result<TransportReceipt, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HttpTransportConfig {
    /// Base URL of the e-mail service, e.g. `https://name.communication.azure.com`.
    #[serde(default)]
    pub endpoint: String,
    /// Base64 access key used to sign requests.
    #[serde(default, alias = "key")]
    pub api_key: String,
    /// Service principal credentials. When `client_secret` is set all three
    /// are required and take precedence over `api_key`.
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Identity service that issues service principal tokens.
    #[serde(default = "defaults::authority_host")]
    pub authority_host: String,
    #[serde(default = "defaults::api_version")]
    pub api_version: String,
    /// Seconds between status polls of a running send operation.
    ///
    /// Default: 2
    #[serde(default = "defaults::poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Default: 10
    #[serde(default = "defaults::connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            tenant_id: None,
            client_id: None,
            client_secret: None,
            authority_host: defaults::authority_host(),
            api_version: defaults::api_version(),
            poll_interval_secs: defaults::poll_interval_secs(),
            connect_timeout_secs: defaults::connect_timeout_secs(),
        }
    }
}

mod defaults {
    pub fn api_version() -> String {
        String::from("2023-03-31")
    }

    pub fn authority_host() -> String {
        String::from("https://login.microsoftonline.com")
    }

    pub const fn poll_interval_secs() -> u64 {
        2
    }

    pub const fn connect_timeout_secs() -> u64 {
        10
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Content<'a> {
    subject: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    plain_text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<&'a str>,
}

#[derive(Serialize)]
struct Headers {
    #[serde(rename = "X-Stratus-Relay")]
    relay: &'static str,
}

/// The message shape accepted by the service's `emails:send` operation.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmailMessage<'a> {
    sender_address: &'a str,
    content: Content<'a>,
    recipients: &'a Recipients,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a AddressList>,
    headers: Headers,
}

impl<'a> From<&'a DeliveryRequest> for EmailMessage<'a> {
    fn from(request: &'a DeliveryRequest) -> Self {
        let (plain_text, html) = match request.body() {
            Body::PlainText(text) => (Some(text.as_str()), None),
            Body::Html { content, .. } => (None, Some(content.as_str())),
        };

        Self {
            sender_address: request.sender_address(),
            content: Content {
                subject: request.subject(),
                plain_text,
                html,
            },
            recipients: request.recipients(),
            reply_to: Some(request.reply_to()).filter(|list| !list.is_empty()),
            headers: Headers { relay: "1" },
        }
    }
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

/// Body of both the send response and the operation status response.
#[derive(Deserialize)]
struct OperationStatus {
    #[serde(default)]
    id: Option<String>,
    status: String,
    #[serde(default)]
    error: Option<ErrorDetail>,
}

impl From<OperationStatus> for TransportReceipt {
    fn from(operation: OperationStatus) -> Self {
        Self {
            status: operation.status,
            id: operation.id,
            error: operation.error.map(|detail| match (detail.code, detail.message) {
                (Some(code), Some(message)) => format!("{code}: {message}"),
                (Some(text), None) | (None, Some(text)) => text,
                (None, None) => String::from("unspecified error"),
            }),
        }
    }
}

/// JSON-over-HTTPS client for the cloud e-mail service.
pub struct HttpTransport {
    client: Client,
    credential: Credential,
    send_url: Url,
    config: HttpTransportConfig,
}

impl HttpTransport {
    /// # Errors
    ///
    /// Fails if the credentials are unusable, the endpoint is not a URL, or
    /// the HTTP client cannot be constructed.
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let credential = Credential::from_config(&config)?;
        let send_url = Url::parse(&format!(
            "{}/emails:send?api-version={}",
            config.endpoint.trim_end_matches('/'),
            config.api_version
        ))
        .map_err(|err| TransportError::Connection(format!("invalid endpoint {}: {err}", config.endpoint)))?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| TransportError::Connection(format!("failed to create HTTP client: {err}")))?;

        Ok(Self {
            client,
            credential,
            send_url,
            config,
        })
    }

    async fn read_status(
        response: reqwest::Response,
        timeout: Duration,
    ) -> Result<TransportReceipt, TransportError> {
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(rejected(status, detail));
        }

        response
            .json::<OperationStatus>()
            .await
            .map(TransportReceipt::from)
            .map_err(|err| classify(&err, timeout))
    }

    async fn poll(
        &self,
        location: &str,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<TransportReceipt, TransportError> {
        let interval = Duration::from_secs(self.config.poll_interval_secs);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining < interval {
                return Err(TransportError::Timeout(timeout));
            }
            tokio::time::sleep(interval).await;

            outgoing!(level = DEBUG, "Polling send status at {location}");
            let url = Url::parse(location)
                .map_err(|err| TransportError::Protocol(format!("invalid operation-location {location}: {err}")))?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let builder = self.client.get(url.clone()).timeout(remaining);
            let response = self
                .credential
                .authorize(&self.client, builder, &Method::GET, &url, &[], remaining)
                .await?
                .send()
                .await
                .map_err(|err| classify(&err, timeout))?;

            let receipt = Self::read_status(response, timeout).await?;
            if receipt.is_terminal() {
                return Ok(receipt);
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[tracing::instrument(level = tracing::Level::DEBUG, skip_all, fields(subject = request.subject()), err)]
    async fn send(
        &self,
        request: &DeliveryRequest,
        timeout: Duration,
    ) -> Result<TransportReceipt, TransportError> {
        let deadline = Instant::now() + timeout;

        // Serialised once so the signed bytes are the bytes sent.
        let body = serde_json::to_vec(&EmailMessage::from(request))
            .map_err(|err| TransportError::Protocol(err.to_string()))?;

        outgoing!(level = DEBUG, "Sending to {} recipients via {}", request.recipients().count(), self.config.endpoint);
        let builder = self
            .client
            .post(self.send_url.clone())
            .timeout(timeout)
            .header(CONTENT_TYPE, "application/json");
        let response = self
            .credential
            .authorize(&self.client, builder, &Method::POST, &self.send_url, &body, timeout)
            .await?
            .body(body)
            .send()
            .await
            .map_err(|err| classify(&err, timeout))?;

        let location = response
            .headers()
            .get("operation-location")
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);

        let receipt = Self::read_status(response, timeout).await?;
        match location {
            Some(location) if !receipt.is_terminal() => {
                self.poll(&location, deadline, timeout).await
            }
            _ => Ok(receipt),
        }
    }
}

fn rejected(status: StatusCode, detail: String) -> TransportError {
    TransportError::Rejected {
        code: status.as_u16(),
        detail,
    }
}

fn classify(err: &reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_decode() {
        TransportError::Protocol(err.to_string())
    } else {
        TransportError::Connection(err.to_string())
    }
}
