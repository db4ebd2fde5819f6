//! Sentinel Hub Process API client.
//!
//! Authenticates with OAuth2 client credentials and posts one
//! [`ImageRequest`] payload per call to `{base_url}/api/v1/process`. The
//! access token is cached and refreshed shortly before it expires, or
//! immediately if the service answers 401.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use spill_chips_request_models::ImageRequest;
use tokio::sync::Mutex;

use crate::retry::{RetryPolicy, send_with_retry};
use crate::{DownloadResponse, ImageryClient, TransferError};

/// Default service root.
pub const DEFAULT_BASE_URL: &str = "https://services.sentinel-hub.com";

/// Default OAuth2 token endpoint.
pub const DEFAULT_TOKEN_URL: &str =
    "https://services.sentinel-hub.com/auth/realms/main/protocol/openid-connect/token";

/// Environment variable holding the OAuth client id.
pub const CLIENT_ID_ENV: &str = "SH_CLIENT_ID";

/// Environment variable holding the OAuth client secret.
pub const CLIENT_SECRET_ENV: &str = "SH_CLIENT_SECRET";

/// Refresh tokens this long before their reported expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Response headers copied into the download manifest.
const RECORDED_HEADERS: &[&str] = &["content-type", "content-length", "x-processingunits-spent"];

/// Connection settings for [`SentinelHubClient`].
#[derive(Debug, Clone)]
pub struct SentinelHubConfig {
    /// Service root, e.g. [`DEFAULT_BASE_URL`].
    pub base_url: String,
    /// OAuth2 token endpoint.
    pub token_url: String,
    /// OAuth client id.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retry policy applied to every HTTP call.
    pub retry: RetryPolicy,
}

impl SentinelHubConfig {
    /// Builds a config with credentials taken from `client_id`/
    /// `client_secret` if given, else from [`CLIENT_ID_ENV`] and
    /// [`CLIENT_SECRET_ENV`].
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Auth`] if a credential is missing from both
    /// places.
    pub fn resolve(
        base_url: Option<String>,
        token_url: Option<String>,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Result<Self, TransferError> {
        let client_id = client_id
            .or_else(|| std::env::var(CLIENT_ID_ENV).ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| TransferError::Auth {
                message: format!("{CLIENT_ID_ENV} is not set"),
            })?;
        let client_secret = client_secret
            .or_else(|| std::env::var(CLIENT_SECRET_ENV).ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| TransferError::Auth {
                message: format!("{CLIENT_SECRET_ENV} is not set"),
            })?;

        Ok(Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            token_url: token_url.unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            client_id,
            client_secret,
            timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

const fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// [`ImageryClient`] backed by the Sentinel Hub Process API.
///
/// One instance is shared by all dispatch workers; the token cache is the
/// only state and is guarded by a mutex.
pub struct SentinelHubClient {
    http: reqwest::Client,
    config: SentinelHubConfig,
    process_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl SentinelHubClient {
    /// Creates the client.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Http`] if the HTTP client cannot be built.
    pub fn new(config: SentinelHubConfig) -> Result<Self, TransferError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("spill-chips/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .map_err(TransferError::Http)?;
        let process_url = format!("{}/api/v1/process", config.base_url.trim_end_matches('/'));

        Ok(Self {
            http,
            config,
            process_url,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, TransferError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.value.clone());
        }

        log::debug!("Requesting Sentinel Hub access token");
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        let response = send_with_retry(&self.config.retry, || {
            self.http.post(&self.config.token_url).form(&form)
        })
        .await
        .map_err(|e| TransferError::Auth {
            message: format!("token request failed: {e}"),
        })?;

        let token: TokenResponse = response.json().await.map_err(TransferError::Http)?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });

        Ok(token.access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn post_process(
        &self,
        request: &ImageRequest,
        payload: &serde_json::Value,
    ) -> Result<reqwest::Response, TransferError> {
        let token = self.access_token().await?;
        send_with_retry(&self.config.retry, || {
            self.http
                .post(&self.process_url)
                .bearer_auth(&token)
                .header(reqwest::header::ACCEPT, request.output_format.as_ref())
                .json(payload)
        })
        .await
    }
}

#[async_trait]
impl ImageryClient for SentinelHubClient {
    fn endpoint(&self) -> &str {
        &self.process_url
    }

    async fn download(&self, request: &ImageRequest) -> Result<DownloadResponse, TransferError> {
        let payload = serde_json::to_value(request.payload())?;
        let started = Instant::now();

        let response = match self.post_process(request, &payload).await {
            Err(TransferError::Status { status: 401, .. }) => {
                log::info!("Access token rejected, refreshing");
                self.invalidate_token().await;
                self.post_process(request, &payload).await?
            }
            other => other?,
        };

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = RECORDED_HEADERS
            .iter()
            .filter_map(|name| {
                response
                    .headers()
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| ((*name).to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(TransferError::Http)?;

        Ok(DownloadResponse {
            body: body.to_vec(),
            status,
            headers,
            elapsed: started.elapsed(),
        })
    }
}
