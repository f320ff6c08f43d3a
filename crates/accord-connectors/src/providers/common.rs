//! Shared HTTP plumbing for the REST-based adapters

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use accord_core::{AccordError, ConnectorConfig, Result};

/// Settings keys shared by the HTTP adapters
pub mod settings {
    pub const TIMEOUT_SECS: &str = "timeout_secs";
    pub const MAX_RETRIES: &str = "max_retries";
    pub const RETRY_DELAY_MS: &str = "retry_delay_ms";
}

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// HTTP client wrapper with status mapping and read retries
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    max_retries: u32,
    retry_delay_ms: u64,
}

impl HttpClient {
    pub fn new(timeout: Duration, max_retries: u32, retry_delay_ms: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("accord/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AccordError::internal_error(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_retries,
            retry_delay_ms,
        })
    }

    /// Client tuned by the connector's `timeout_secs`, `max_retries` and
    /// `retry_delay_ms` settings
    pub fn from_config(config: &ConnectorConfig) -> Result<Self> {
        let timeout = config
            .setting_u64(settings::TIMEOUT_SECS)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let max_retries = config
            .setting_u64(settings::MAX_RETRIES)
            .map(|n| u32::try_from(n).unwrap_or(DEFAULT_MAX_RETRIES))
            .unwrap_or(DEFAULT_MAX_RETRIES);
        let retry_delay_ms = config
            .setting_u64(settings::RETRY_DELAY_MS)
            .unwrap_or(DEFAULT_RETRY_DELAY_MS);

        Self::new(Duration::from_secs(timeout), max_retries, retry_delay_ms)
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before read retry `attempt` (0-based), doubling and saturating
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.retry_delay_ms
                .saturating_mul(2u64.saturating_pow(attempt)),
        )
    }

    /// Send once. Used for every mutating call.
    pub async fn send(&self, request_builder: reqwest::RequestBuilder) -> Result<Response> {
        let response = request_builder.send().await.map_err(transport_error)?;
        check_status(response).await
    }

    /// Send an idempotent read, retrying transient failures with exponential delay
    pub async fn execute_with_retry(
        &self,
        request_builder: reqwest::RequestBuilder,
    ) -> Result<Response> {
        let mut attempt = 0;

        loop {
            let request = request_builder.try_clone().ok_or_else(|| {
                AccordError::internal_error("Request cannot be cloned for retry")
            })?;

            match self.send(request).await {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.retry_delay(attempt);
                    attempt += 1;
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying read after transient failure: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

/// Map a non-success response onto the error taxonomy
pub async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let path = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &path, &body))
}

pub fn status_error(status: StatusCode, path: &str, body: &str) -> AccordError {
    let detail = truncate(body, 256);

    match status {
        StatusCode::UNAUTHORIZED => AccordError::unauthenticated(format!("HTTP 401 - {}", detail)),
        StatusCode::FORBIDDEN => AccordError::forbidden(format!("HTTP 403 - {}", detail)),
        StatusCode::NOT_FOUND => AccordError::not_found("remote resource", path),
        StatusCode::CONFLICT => AccordError::conflict(format!("HTTP 409 - {}", detail)),
        StatusCode::TOO_MANY_REQUESTS => {
            AccordError::transient(format!("HTTP 429 - {}", detail))
        }
        s if s.is_server_error() => {
            AccordError::transient(format!("HTTP {} - {}", s.as_u16(), detail))
        }
        s => AccordError::permanent(format!("HTTP {} - {}", s.as_u16(), detail)),
    }
}

/// Connection failures and timeouts are transient; request construction and
/// decoding failures are not
pub fn transport_error(e: reqwest::Error) -> AccordError {
    if e.is_builder() || e.is_decode() {
        AccordError::permanent(format!("HTTP request failed: {}", e))
    } else {
        AccordError::transient(format!("HTTP request failed: {}", e))
    }
}

pub async fn decode_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| AccordError::permanent(format!("Failed to parse {}: {}", what, e)))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Join a base URL and a path without doubling the slash
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

// =============================================================================
// Access Tokens
// =============================================================================

/// An access token and its lifetime in seconds
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_in: i64,
}

struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Single-slot access token cache. Refreshes are serialized so concurrent
/// callers share one token fetch.
pub struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
    refresh_margin: ChronoDuration,
}

impl TokenCache {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            refresh_margin: ChronoDuration::seconds(60),
        }
    }

    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<IssuedToken>>,
    {
        let mut slot = self.slot.lock().await;

        if let Some(cached) = slot.as_ref() {
            if Utc::now() + self.refresh_margin < cached.expires_at {
                return Ok(cached.access_token.clone());
            }
            debug!("Access token near expiry, refreshing");
        }

        let issued = fetch().await?;
        if issued.expires_in <= 0 {
            warn!("Token endpoint returned non-positive expires_in");
        }

        *slot = Some(CachedToken {
            access_token: issued.access_token.clone(),
            expires_at: Utc::now() + ChronoDuration::seconds(issued.expires_in),
        });

        Ok(issued.access_token)
    }

    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}
