//! HTTP delta source.
//!
//! ### Endpoint
//!
//! - **Request**: `GET {base_url}/v1/strings/delta?lang=<code>&since=<version>`
//!   (`since` omitted for a full fetch)
//! - **Headers**: `Authorization: Bearer <token>`, `X-Device-Id`, `User-Agent`
//! - **Response**: JSON [`DeltaResponse`]
//! - **Status mapping**: 401/403 auth, 429 rate limited, other 4xx/5xx HTTP error.
//!   No retries; the caller decides.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header;
use stringboot_core::{ClientConfig, DeltaRequest, DeltaResponse, Error};

use super::{DeltaSource, RemoteError};

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default user agent.
const DEFAULT_USER_AGENT: &str = "stringboot-rs/0.1";

/// HTTP delta source configuration.
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    /// API base URL, e.g. `https://api.stringboot.com`.
    pub base_url: String,
    /// Bearer token.
    pub api_token: String,
    /// Request timeout (default: 10s).
    pub timeout: Duration,
    /// User-agent string.
    pub user_agent: String,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.stringboot.com".to_string(),
            api_token: String::new(),
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl HttpSourceConfig {
    /// Derive transport settings from the client configuration.
    pub fn from_client_config(config: &ClientConfig) -> Result<Self, RemoteError> {
        let api_token = config.require_api_token().map_err(|_| RemoteError::MissingToken)?;
        Ok(Self {
            base_url: config.api_url.clone(),
            api_token: api_token.to_string(),
            timeout: config.timeout(),
            user_agent: config.user_agent.clone(),
        })
    }
}

/// Delta source backed by the Stringboot HTTP API.
#[derive(Debug, Clone)]
pub struct HttpDeltaSource {
    http: reqwest::Client,
    endpoint: url::Url,
    config: HttpSourceConfig,
}

impl HttpDeltaSource {
    /// Create a new source with the given configuration.
    pub fn new(config: HttpSourceConfig) -> Result<Self, RemoteError> {
        if config.api_token.is_empty() {
            return Err(RemoteError::MissingToken);
        }

        let endpoint = delta_endpoint(&config.base_url)?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .gzip(true)
            .build()?;

        Ok(Self { http, endpoint, config })
    }

    /// Create a new source from the client configuration.
    pub fn from_client_config(config: &ClientConfig) -> Result<Self, RemoteError> {
        Self::new(HttpSourceConfig::from_client_config(config)?)
    }

    /// The fully resolved delta URL (without query).
    pub fn endpoint(&self) -> &url::Url {
        &self.endpoint
    }

    /// Fetch one delta, keeping the transport error detail.
    pub async fn fetch(&self, request: &DeltaRequest) -> Result<DeltaResponse, RemoteError> {
        let start = Instant::now();

        let mut builder = self
            .http
            .get(self.endpoint.clone())
            .bearer_auth(&self.config.api_token)
            .header("X-Device-Id", &request.device_id)
            .header(header::ACCEPT, "application/json")
            .query(&[("lang", request.language.as_str())]);
        if let Some(since) = request.since_version {
            builder = builder.query(&[("since", since)]);
        }

        tracing::debug!(language = %request.language, since = ?request.since_version, "requesting delta");

        let response = builder.send().await?;
        let status = response.status();

        if status == 401 || status == 403 {
            return Err(RemoteError::AuthError { status: status.as_u16() });
        }

        if status == 429 {
            return Err(RemoteError::RateLimited);
        }

        if status.is_client_error() || status.is_server_error() {
            return Err(RemoteError::HttpError { status: status.as_u16() });
        }

        let bytes = response.bytes().await?;
        let delta: DeltaResponse = serde_json::from_slice(&bytes).map_err(|e| RemoteError::Parse(e.to_string()))?;

        tracing::debug!(
            language = %request.language,
            new_version = delta.new_version,
            upserts = delta.upserts.len(),
            deletions = delta.deletions.len(),
            "delta received in {:?}",
            start.elapsed()
        );

        Ok(delta)
    }
}

#[async_trait]
impl DeltaSource for HttpDeltaSource {
    async fn fetch_delta(&self, request: &DeltaRequest) -> Result<DeltaResponse, Error> {
        self.fetch(request).await.map_err(Error::from)
    }
}

fn delta_endpoint(base_url: &str) -> Result<url::Url, RemoteError> {
    let mut base = url::Url::parse(base_url.trim()).map_err(|e| RemoteError::InvalidBaseUrl(e.to_string()))?;
    match base.scheme() {
        "http" | "https" => {}
        scheme => return Err(RemoteError::InvalidBaseUrl(format!("unsupported scheme: {scheme}"))),
    }

    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join("v1/strings/delta")
        .map_err(|e| RemoteError::InvalidBaseUrl(e.to_string()))
}
