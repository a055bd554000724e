use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::SourceError;
use crate::geofence::BoundingBox;

pub const DEFAULT_STATES_URL: &str = "https://opensky-network.org/api/states/all";
pub const DEFAULT_TOKEN_URL: &str =
    "https://auth.opensky-network.org/auth/realms/opensky-network/protocol/openid-connect/token";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// OpenSky's own rate-limit hint, sent alongside 429 responses.
const RATE_LIMIT_RETRY_AFTER: &str = "x-rate-limit-retry-after-seconds";

/// One fetched batch of raw state vectors.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Upstream snapshot time (unix seconds), when reported
    pub time: Option<i64>,
    pub states: Vec<Value>,
}

/// `/api/states/all` response body. `states` is `null` when nothing matched.
#[derive(Debug, Deserialize)]
pub struct StatesResponse {
    pub time: Option<i64>,
    pub states: Option<Vec<Value>>,
}

impl From<StatesResponse> for Snapshot {
    fn from(response: StatesResponse) -> Self {
        Self {
            time: response.time,
            states: response.states.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// OAuth2 client-credentials pair
#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Where snapshots come from.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch the current state vectors, pre-filtered to `bbox` where the
    /// source supports it.
    async fn fetch_snapshot(&self, bbox: &BoundingBox) -> Result<Snapshot, SourceError>;

    /// Obtain fresh credentials after a failure where
    /// [`SourceError::needs_reauth`] holds.
    async fn reauthenticate(&self) -> Result<(), SourceError>;
}

/// OpenSky Network REST client
pub struct OpenSkyClient {
    client: Client,
    states_url: String,
    token_url: String,
    credentials: Option<Credentials>,
    token: RwLock<Option<String>>,
}

impl OpenSkyClient {
    /// Create a client. Without credentials requests are made anonymously.
    pub fn new(credentials: Option<Credentials>) -> Result<Self, SourceError> {
        Self::with_urls(credentials, DEFAULT_STATES_URL, DEFAULT_TOKEN_URL)
    }

    pub fn with_urls(
        credentials: Option<Credentials>,
        states_url: &str,
        token_url: &str,
    ) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("flightview/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Http {
                url: states_url.to_string(),
                source: e,
            })?;
        Ok(Self {
            client,
            states_url: states_url.to_string(),
            token_url: token_url.to_string(),
            credentials,
            token: RwLock::new(None),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_some()
    }

    /// Request a new access token using the client-credentials grant
    async fn request_token(&self, credentials: &Credentials) -> Result<String, SourceError> {
        debug!("Requesting OpenSky access token");
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SourceError::Auth(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Auth(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Auth(format!("invalid token response: {}", e)))?;
        Ok(token.access_token)
    }

    /// Current token, fetching one on first use
    async fn bearer_token(&self) -> Result<Option<String>, SourceError> {
        let Some(credentials) = &self.credentials else {
            return Ok(None);
        };
        if let Some(token) = self.token.read().await.clone() {
            return Ok(Some(token));
        }
        let token = self.request_token(credentials).await?;
        *self.token.write().await = Some(token.clone());
        Ok(Some(token))
    }
}

#[async_trait]
impl SnapshotSource for OpenSkyClient {
    async fn fetch_snapshot(&self, bbox: &BoundingBox) -> Result<Snapshot, SourceError> {
        let mut request = self
            .client
            .get(&self.states_url)
            .query(&bbox.query_params());
        if let Some(token) = self.bearer_token().await? {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| SourceError::Http {
            url: self.states_url.clone(),
            source: e,
        })?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED => return Err(SourceError::Unauthorized),
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(SourceError::RateLimited {
                    retry_after: retry_after(response.headers()),
                });
            }
            s if !s.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(SourceError::Status {
                    status: s.as_u16(),
                    body,
                });
            }
            _ => {}
        }

        let body = response.text().await.map_err(|e| SourceError::Http {
            url: self.states_url.clone(),
            source: e,
        })?;
        parse_states_response(&body)
    }

    async fn reauthenticate(&self) -> Result<(), SourceError> {
        let Some(credentials) = &self.credentials else {
            return Err(SourceError::Auth(
                "no OpenSky credentials configured".to_string(),
            ));
        };
        info!("Refreshing OpenSky access token");
        *self.token.write().await = None;
        let token = self.request_token(credentials).await?;
        *self.token.write().await = Some(token);
        Ok(())
    }
}

/// Decode a `/states/all` body into a snapshot
pub fn parse_states_response(body: &str) -> Result<Snapshot, SourceError> {
    let response: StatesResponse = serde_json::from_str(body).map_err(|e| {
        let preview: String = body.chars().take(200).collect();
        SourceError::Decode(format!("{} (body starts: {})", e, preview))
    })?;
    Ok(response.into())
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RATE_LIMIT_RETRY_AFTER)
        .or_else(|| headers.get(RETRY_AFTER))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
