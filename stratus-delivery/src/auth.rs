//! Credentials for the cloud e-mail service.
//!
//! Two modes are supported. An access key signs every request with
//! HMAC-SHA256 over the method, path, date, host and body hash. A service
//! principal trades its client secret for a bearer token, which is cached
//! until shortly before it expires.

use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use stratus_common::outgoing;
use tokio::{sync::Mutex, time::Instant};

use crate::{
    error::{CredentialError, TransportError},
    transport::HttpTransportConfig,
};

/// Scope requested for service principal tokens.
const TOKEN_SCOPE: &str = "https://communication.azure.com/.default";

/// Tokens are refreshed this long before the service says they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Headers that authenticate one request made with an access key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSignature {
    pub date: String,
    pub content_hash: String,
    pub authorization: String,
}

pub struct AccessKey {
    secret: Vec<u8>,
}

impl AccessKey {
    /// # Errors
    ///
    /// Fails if `key` is not base64.
    pub fn new(key: &str) -> Result<Self, CredentialError> {
        let secret = STANDARD
            .decode(key.trim())
            .map_err(|_| CredentialError::InvalidKey)?;

        Ok(Self { secret })
    }

    /// Sign a `method` request for `url` carrying `body`, dated `now`.
    pub fn sign(&self, method: &Method, url: &Url, body: &[u8], now: DateTime<Utc>) -> RequestSignature {
        let date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let content_hash = STANDARD.encode(Sha256::digest(body));

        let path_and_query = url
            .query()
            .map_or_else(|| url.path().to_string(), |query| format!("{}?{query}", url.path()));
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };

        let string_to_sign = format!("{method}\n{path_and_query}\n{date};{host};{content_hash}");

        // HMAC accepts keys of any length.
        let signature = Hmac::<Sha256>::new_from_slice(&self.secret).map_or_else(
            |_| String::new(),
            |mut mac| {
                mac.update(string_to_sign.as_bytes());
                STANDARD.encode(mac.finalize().into_bytes())
            },
        );

        RequestSignature {
            date,
            content_hash,
            authorization: format!(
                "HMAC-SHA256 SignedHeaders=x-ms-date;host;x-ms-content-sha256&Signature={signature}"
            ),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub struct ServicePrincipal {
    token_url: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl ServicePrincipal {
    pub fn new(
        authority: &str,
        tenant_id: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                authority.trim_end_matches('/'),
                tenant_id.trim()
            ),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token: Mutex::new(None),
        }
    }

    /// A bearer token, fetched from the identity service when the cached one
    /// is missing or about to expire.
    async fn bearer(&self, client: &Client, timeout: Duration) -> Result<String, TransportError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.value.clone());
        }

        outgoing!(level = DEBUG, "Requesting access token from {}", self.token_url);
        let response = client
            .post(&self.token_url)
            .timeout(timeout)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", TOKEN_SCOPE),
            ])
            .send()
            .await
            .map_err(|err| TransportError::Connection(format!("token request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                code: status.as_u16(),
                detail: format!("token request refused: {detail}"),
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| TransportError::Protocol(format!("invalid token response: {err}")))?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or_default());
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN),
        });

        Ok(token.access_token)
    }
}

/// How requests to the e-mail service are authenticated.
pub enum Credential {
    AccessKey(AccessKey),
    ServicePrincipal(ServicePrincipal),
}

impl Credential {
    /// Pick the credential described by `config`. A client secret selects
    /// the service principal, even when an access key is also present.
    ///
    /// # Errors
    ///
    /// Fails when no credential is configured, the service principal is
    /// incomplete, or the access key is not base64.
    pub fn from_config(config: &HttpTransportConfig) -> Result<Self, CredentialError> {
        let present = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
        };

        let tenant_id = present(config.tenant_id.as_deref());
        let client_id = present(config.client_id.as_deref());
        let client_secret = present(config.client_secret.as_deref());

        if tenant_id.is_some() || client_id.is_some() || client_secret.is_some() {
            let tenant_id = tenant_id.ok_or(CredentialError::Incomplete("tenant_id"))?;
            let client_id = client_id.ok_or(CredentialError::Incomplete("client_id"))?;
            let client_secret = client_secret.ok_or(CredentialError::Incomplete("client_secret"))?;

            return Ok(Self::ServicePrincipal(ServicePrincipal::new(
                &config.authority_host,
                &tenant_id,
                client_id,
                client_secret,
            )));
        }

        if config.api_key.trim().is_empty() {
            return Err(CredentialError::Missing);
        }

        AccessKey::new(&config.api_key).map(Self::AccessKey)
    }

    /// Attach authentication to a request whose exact `body` is already known.
    pub(crate) async fn authorize(
        &self,
        client: &Client,
        builder: RequestBuilder,
        method: &Method,
        url: &Url,
        body: &[u8],
        timeout: Duration,
    ) -> Result<RequestBuilder, TransportError> {
        match self {
            Self::AccessKey(key) => {
                let signature = key.sign(method, url, body, Utc::now());
                Ok(builder
                    .header("x-ms-date", signature.date)
                    .header("x-ms-content-sha256", signature.content_hash)
                    .header("Authorization", signature.authorization))
            }
            Self::ServicePrincipal(principal) => {
                let token = principal.bearer(client, timeout).await?;
                Ok(builder.bearer_auth(token))
            }
        }
    }
}
