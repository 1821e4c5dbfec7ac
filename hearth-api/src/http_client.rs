//! Retrying outbound HTTP client.
//!
//! Every attempt is bounded by the request timeout. Retryable failures
//! (timeouts, transport errors, 5xx, 408, 429) are retried after
//! `retry_delay * 2^attempt`; anything else is returned at once. Attempts are
//! strictly sequential.

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::HttpClientConfig;
use crate::telemetry::metrics::with_metrics;

/// Longest response body kept in a status error.
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HttpClientError {
    #[error("Request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("Could not reach {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16, body: String },

    #[error("Undecodable response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl HttpClientError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpClientError::Timeout { .. } | HttpClientError::Connect { .. } => true,
            HttpClientError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            HttpClientError::Decode { .. } | HttpClientError::InvalidRequest { .. } => false,
        }
    }

    /// HTTP status of a rejected request, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Delay before retry number `attempt + 1`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

// ============================================================================
// REQUEST DESCRIPTION
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

/// One logical request, including its retry policy.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    /// Metrics label naming the remote service.
    pub target: String,
}

impl RequestConfig {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        let defaults = HttpClientConfig::default();
        Self {
            url: url.into(),
            method,
            headers: Vec::new(),
            body: RequestBody::Empty,
            timeout: defaults.timeout,
            retries: defaults.retries,
            retry_delay: defaults.retry_delay,
            target: "default".to_string(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Apply timeout and retry settings from configuration.
    pub fn with_defaults(mut self, defaults: &HttpClientConfig) -> Self {
        self.timeout = defaults.timeout;
        self.retries = defaults.retries;
        self.retry_delay = defaults.retry_delay;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {}", token))
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, HttpClientError> {
        let value = serde_json::to_value(body).map_err(|e| HttpClientError::InvalidRequest {
            reason: format!("body is not serializable: {}", e),
        })?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = RequestBody::Form(fields);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }
}

// ============================================================================
// CLIENT
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryingHttpClient {
    client: reqwest::Client,
    defaults: HttpClientConfig,
}

impl RetryingHttpClient {
    pub fn new(defaults: HttpClientConfig) -> Result<Self, HttpClientError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("hearth/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HttpClientError::InvalidRequest {
                reason: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client, defaults })
    }

    pub fn defaults(&self) -> &HttpClientConfig {
        &self.defaults
    }

    /// Send `config`, retrying retryable failures; returns the response body.
    pub async fn request(&self, config: &RequestConfig) -> Result<Vec<u8>, HttpClientError> {
        let mut attempt: u32 = 0;
        loop {
            match self.send_once(config).await {
                Ok(body) => {
                    with_metrics(|m| m.record_http_attempt(&config.target, "success"));
                    tracing::debug!(
                        target_service = %config.target,
                        url = %config.url,
                        attempt = attempt + 1,
                        "Outbound request succeeded"
                    );
                    return Ok(body);
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    let outcome = if retryable { "retryable_error" } else { "terminal_error" };
                    with_metrics(|m| m.record_http_attempt(&config.target, outcome));

                    if !retryable || attempt >= config.retries {
                        tracing::warn!(
                            target_service = %config.target,
                            url = %config.url,
                            attempt = attempt + 1,
                            status = ?err.status(),
                            error = %err,
                            "Outbound request failed"
                        );
                        return Err(err);
                    }

                    let delay = backoff_delay(config.retry_delay, attempt);
                    tracing::warn!(
                        target_service = %config.target,
                        url = %config.url,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Outbound request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Like [`request`](Self::request), decoding the body as JSON. A body
    /// that does not decode is terminal and is not retried.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        config: &RequestConfig,
    ) -> Result<T, HttpClientError> {
        let body = self.request(config).await?;
        serde_json::from_slice(&body).map_err(|e| HttpClientError::Decode {
            url: config.url.clone(),
            reason: e.to_string(),
        })
    }

    async fn send_once(&self, config: &RequestConfig) -> Result<Vec<u8>, HttpClientError> {
        let mut builder = self.client.request(config.method.clone(), &config.url);
        for (name, value) in &config.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &config.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Form(fields) => builder.form(fields),
        };

        let attempt = async {
            let response = builder
                .send()
                .await
                .map_err(|e| transport_error(&config.url, e))?;
            let status = response.status();
            let body = response
                .bytes()
                .await
                .map_err(|e| transport_error(&config.url, e))?;
            if !status.is_success() {
                let text = String::from_utf8_lossy(&body);
                return Err(HttpClientError::Status {
                    url: config.url.clone(),
                    status: status.as_u16(),
                    body: text.chars().take(ERROR_BODY_LIMIT).collect(),
                });
            }
            Ok::<Vec<u8>, HttpClientError>(body.to_vec())
        };

        match tokio::time::timeout(config.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(HttpClientError::Timeout {
                url: config.url.clone(),
                timeout_ms: config.timeout.as_millis() as u64,
            }),
        }
    }
}

fn transport_error(url: &str, err: reqwest::Error) -> HttpClientError {
    if err.is_timeout() {
        HttpClientError::Timeout {
            url: url.to_string(),
            timeout_ms: 0,
        }
    } else if err.is_builder() {
        HttpClientError::InvalidRequest {
            reason: err.to_string(),
        }
    } else {
        HttpClientError::Connect {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}
