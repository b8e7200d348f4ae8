//! Network collaborators: fetching campaigns and writing analytics.
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{StatusCode, Url};

use crate::{
    campaign::CampaignsResponse,
    events::{IdentifyPayload, TrackPayload},
    Error, Result,
};

/// Parameters of a campaigns fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    #[allow(missing_docs)]
    pub user_id: Option<String>,
    #[allow(missing_docs)]
    pub screen_name: Option<String>,
}

/// Backend the engine talks to.
///
/// Any error is treated as a failure: fetches are retried, writes are queued.
#[async_trait]
pub trait Transport: Send + Sync {
    /// `GET /campaigns`.
    async fn fetch_campaigns(&self, request: &FetchRequest) -> Result<CampaignsResponse>;
    /// `POST /track`.
    async fn track(&self, payload: &TrackPayload) -> Result<()>;
    /// `POST /identify`.
    async fn identify(&self, payload: &IdentifyPayload) -> Result<()>;
}

/// Configuration for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    #[allow(missing_docs)]
    pub base_url: String,
    #[allow(missing_docs)]
    pub api_key: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// SDK name reported to the backend.
    pub sdk_name: String,
    /// SDK version reported to the backend.
    pub sdk_version: String,
}

impl HttpTransportConfig {
    /// Default base URL for API calls.
    pub const DEFAULT_BASE_URL: &'static str = "https://api.nudge.dev/v1";
    /// Default value for [`HttpTransportConfig::timeout`].
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a default configuration using the specified API key.
    pub fn from_api_key(api_key: impl Into<String>) -> HttpTransportConfig {
        HttpTransportConfig {
            base_url: HttpTransportConfig::DEFAULT_BASE_URL.to_owned(),
            api_key: api_key.into(),
            timeout: HttpTransportConfig::DEFAULT_TIMEOUT,
            sdk_name: "rust".to_owned(),
            sdk_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    /// Override base URL for API calls.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> HttpTransportConfig {
        self.base_url = base_url.into();
        self
    }

    /// Update per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> HttpTransportConfig {
        self.timeout = timeout;
        self
    }
}

const CAMPAIGNS_ENDPOINT: &str = "/campaigns";
const TRACK_ENDPOINT: &str = "/track";
const IDENTIFY_ENDPOINT: &str = "/identify";

/// [`Transport`] over HTTP.
pub struct HttpTransport {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    config: HttpTransportConfig,
    /// If we receive a 401 Unauthorized error during a request, it means the API key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl HttpTransport {
    #[allow(missing_docs)]
    pub fn new(config: HttpTransportConfig) -> Result<HttpTransport> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(HttpTransport {
            client,
            config,
            unauthorized: AtomicBool::new(false),
        })
    }

    fn url(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}{}", self.config.base_url, endpoint))
            .map_err(Error::InvalidBaseUrl)?;
        url.query_pairs_mut()
            .append_pair("sdkName", &self.config.sdk_name)
            .append_pair("sdkVersion", &self.config.sdk_version)
            .extend_pairs(params);
        Ok(url)
    }

    fn check_authorized(&self) -> Result<()> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }
        Ok(())
    }

    fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED => {
                log::warn!(target: "nudge", "client is not authorized. Check your API key");
                self.unauthorized.store(true, Ordering::Relaxed);
                Err(Error::Unauthorized)
            }
            status => {
                log::warn!(target: "nudge", status = status.as_u16(); "received non-2xx response");
                Err(Error::HttpStatus(status.as_u16()))
            }
        }
    }

    async fn post<T: serde::Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<()> {
        self.check_authorized()?;
        let url = self.url(endpoint, &[])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await?;
        self.check_status(response)?;
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_campaigns(&self, request: &FetchRequest) -> Result<CampaignsResponse> {
        self.check_authorized()?;

        let mut params = Vec::new();
        if let Some(user_id) = &request.user_id {
            params.push(("userId", user_id.as_str()));
        }
        if let Some(screen_name) = &request.screen_name {
            params.push(("screenName", screen_name.as_str()));
        }
        let url = self.url(CAMPAIGNS_ENDPOINT, &params)?;

        log::debug!(target: "nudge", "fetching campaigns");
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;
        let response = self.check_status(response)?;
        let campaigns = response.json().await?;

        log::debug!(target: "nudge", "successfully fetched campaigns");
        Ok(campaigns)
    }

    async fn track(&self, payload: &TrackPayload) -> Result<()> {
        self.post(TRACK_ENDPOINT, payload).await
    }

    async fn identify(&self, payload: &IdentifyPayload) -> Result<()> {
        self.post(IDENTIFY_ENDPOINT, payload).await
    }
}
