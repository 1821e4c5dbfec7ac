//! Store-backed Request Rate Limiting
//!
//! Counters live in the shared key-value store under
//! `ratelimit:<profile>:<identity>`, so every API instance enforces the same
//! budget. Two strategies are available:
//!
//! - `FixedWindow` (default): one counter per key, created with the window as
//!   its expiry. A fresh window starts when the key is absent.
//! - `SlidingWindow`: one counter per fixed bucket; the estimate weights the
//!   previous bucket by the share of it still inside the trailing window.
//!
//! A store failure never blocks traffic: the request is allowed and a warning
//! is logged.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use hearth_core::{Clock, ConfigError, StoreResult, SystemClock, UserId};
use hearth_storage::CacheStore;
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{
    API_RATE_LIMIT_MAX, API_RATE_LIMIT_WINDOW_SECS, AUTH_RATE_LIMIT_MAX,
    AUTH_RATE_LIMIT_WINDOW_SECS, HEADER_RATE_LIMIT_LIMIT, HEADER_RATE_LIMIT_REMAINING,
    HEADER_RATE_LIMIT_RESET, RATE_LIMIT_KEY_PREFIX, SEARCH_RATE_LIMIT_MAX,
    SEARCH_RATE_LIMIT_WINDOW_SECS, USER_ID_HEADER,
};
use crate::error::ApiError;
use crate::telemetry::metrics::with_metrics;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitStrategy {
    #[default]
    FixedWindow,
    SlidingWindow,
}

impl FromStr for RateLimitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" | "fixed_window" => Ok(RateLimitStrategy::FixedWindow),
            "sliding" | "sliding_window" => Ok(RateLimitStrategy::SlidingWindow),
            other => Err(format!("unknown rate limit strategy: {}", other)),
        }
    }
}

/// One named limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Profile name; part of the store key and the metrics label.
    pub name: String,
    pub window: Duration,
    /// Requests allowed per window.
    pub max: u64,
    pub strategy: RateLimitStrategy,
}

impl RateLimitConfig {
    /// A fixed-window limit. The window must be at least one millisecond.
    pub fn new(name: impl Into<String>, window: Duration, max: u64) -> Result<Self, ConfigError> {
        let name = name.into();
        if window.as_millis() == 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("rate_limit.{}.window", name),
                value: format!("{:?}", window),
                reason: "window must be at least 1ms".to_string(),
            });
        }
        Ok(Self::preset(name, window, max))
    }

    fn preset(name: impl Into<String>, window: Duration, max: u64) -> Self {
        Self {
            name: name.into(),
            window,
            max,
            strategy: RateLimitStrategy::FixedWindow,
        }
    }

    /// General API traffic: 60 per minute.
    pub fn api() -> Self {
        Self::preset(
            "api",
            Duration::from_secs(API_RATE_LIMIT_WINDOW_SECS),
            API_RATE_LIMIT_MAX,
        )
    }

    /// Credential and plan changes: 5 per 15 minutes.
    pub fn auth() -> Self {
        Self::preset(
            "auth",
            Duration::from_secs(AUTH_RATE_LIMIT_WINDOW_SECS),
            AUTH_RATE_LIMIT_MAX,
        )
    }

    /// Search endpoints: 30 per minute.
    pub fn search() -> Self {
        Self::preset(
            "search",
            Duration::from_secs(SEARCH_RATE_LIMIT_WINDOW_SECS),
            SEARCH_RATE_LIMIT_MAX,
        )
    }

    pub fn with_strategy(mut self, strategy: RateLimitStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

// ============================================================================
// REQUEST IDENTITY
// ============================================================================

/// What a limiter may key on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub client_ip: IpAddr,
    pub path: String,
    pub user_id: Option<UserId>,
}

impl RequestIdentity {
    pub fn new(client_ip: IpAddr, path: impl Into<String>) -> Self {
        Self {
            client_ip,
            path: path.into(),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn from_request(request: &Request) -> Self {
        let fallback = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let user_id = request
            .headers()
            .get(USER_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse().ok());

        Self {
            client_ip: extract_client_ip(request.headers(), fallback),
            path: request.uri().path().to_string(),
            user_id,
        }
    }
}

/// Extract client IP, considering proxy headers.
fn extract_client_ip(headers: &HeaderMap, fallback: IpAddr) -> IpAddr {
    // X-Forwarded-For can contain multiple IPs, take the first one
    if let Some(first_ip) = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        if let Ok(ip) = first_ip.trim().parse() {
            return ip;
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|h| h.to_str().ok()) {
        if let Ok(ip) = real_ip.trim().parse() {
            return ip;
        }
    }

    fallback
}

/// Maps a request to the identity part of its counter key.
pub type KeyFn = Arc<dyn Fn(&RequestIdentity) -> String + Send + Sync>;

/// Default key: client IP plus route path.
pub fn ip_and_path_key() -> KeyFn {
    Arc::new(|identity: &RequestIdentity| format!("{}:{}", identity.client_ip, identity.path))
}

/// Per-user key, falling back to the client IP for anonymous callers.
pub fn user_key() -> KeyFn {
    Arc::new(|identity: &RequestIdentity| match identity.user_id {
        Some(user_id) => format!("user:{}", user_id),
        None => format!("ip:{}", identity.client_ip),
    })
}

// ============================================================================
// LIMITER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Window end in seconds since the epoch.
    pub reset_at: i64,
}

impl RateLimitDecision {
    /// Whole seconds until the window resets, at least 1.
    pub fn retry_after_secs(&self, now_secs: i64) -> u64 {
        (self.reset_at - now_secs).max(1) as u64
    }
}

fn ceil_secs(ms: i64) -> i64 {
    (ms + 999).div_euclid(1000)
}

#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    cache: CacheStore,
    key_fn: KeyFn,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, cache: CacheStore) -> Self {
        Self {
            config,
            cache,
            key_fn: ip_and_path_key(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = key_fn;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn now_secs(&self) -> i64 {
        self.clock.now_ms().div_euclid(1000)
    }

    pub fn key_for(&self, identity: &RequestIdentity) -> String {
        format!(
            "{}:{}:{}",
            RATE_LIMIT_KEY_PREFIX,
            self.config.name,
            (self.key_fn)(identity)
        )
    }

    /// Count this request and decide whether it may proceed.
    pub async fn check(&self, identity: &RequestIdentity) -> RateLimitDecision {
        let key = self.key_for(identity);
        let result = match self.config.strategy {
            RateLimitStrategy::FixedWindow => self.check_fixed(&key).await,
            RateLimitStrategy::SlidingWindow => self.check_sliding(&key).await,
        };

        match result {
            Ok(decision) => {
                let label = if decision.allowed { "allowed" } else { "rejected" };
                with_metrics(|m| m.record_rate_limit_decision(&self.config.name, label));
                if !decision.allowed {
                    tracing::debug!(
                        profile = %self.config.name,
                        key = %key,
                        limit = decision.limit,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => {
                tracing::warn!(
                    profile = %self.config.name,
                    key = %key,
                    error = %e,
                    "Rate limit store unavailable, allowing request"
                );
                with_metrics(|m| m.record_rate_limit_decision(&self.config.name, "fail_open"));
                RateLimitDecision {
                    allowed: true,
                    limit: self.config.max,
                    remaining: self.config.max,
                    reset_at: ceil_secs(self.clock.now_ms() + self.window_ms()),
                }
            }
        }
    }

    fn window_ms(&self) -> i64 {
        (self.config.window.as_millis() as i64).max(1)
    }

    fn decide(&self, count: u64, reset_at: i64) -> RateLimitDecision {
        RateLimitDecision {
            allowed: count <= self.config.max,
            limit: self.config.max,
            remaining: self.config.max.saturating_sub(count),
            reset_at,
        }
    }

    async fn check_fixed(&self, key: &str) -> StoreResult<RateLimitDecision> {
        let window = self.cache.increment_window(key, self.config.window).await?;
        let reset_at = ceil_secs(self.clock.now_ms() + window.resets_in.as_millis() as i64);
        Ok(self.decide(window.count.max(0) as u64, reset_at))
    }

    async fn check_sliding(&self, key: &str) -> StoreResult<RateLimitDecision> {
        let window_ms = self.window_ms();
        let now_ms = self.clock.now_ms();
        let bucket = now_ms.div_euclid(window_ms);
        let elapsed = now_ms.rem_euclid(window_ms);

        // Buckets must outlive the following bucket, which still reads them.
        let current = self
            .cache
            .increment(
                &format!("{}:{}", key, bucket),
                Some(self.config.window.saturating_mul(2)),
            )
            .await?;
        let previous: i64 = self
            .cache
            .kv()
            .get(&format!("{}:{}", key, bucket - 1))
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);

        let weight = 1.0 - elapsed as f64 / window_ms as f64;
        let estimate = (previous.max(0) as f64 * weight).floor() as u64 + current.max(0) as u64;
        Ok(self.decide(estimate, ceil_secs((bucket + 1) * window_ms)))
    }
}

// ============================================================================
// MIDDLEWARE
// ============================================================================

fn set_header(headers: &mut HeaderMap, name: &'static str, value: impl ToString) {
    headers.insert(
        HeaderName::from_static(name),
        HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    set_header(headers, HEADER_RATE_LIMIT_LIMIT, decision.limit);
    set_header(headers, HEADER_RATE_LIMIT_REMAINING, decision.remaining);
    set_header(headers, HEADER_RATE_LIMIT_RESET, decision.reset_at);
}

/// Error type for rate limit middleware.
#[derive(Debug, Clone)]
pub struct RateLimitError {
    pub decision: RateLimitDecision,
    /// Seconds until the window resets
    pub retry_after: u64,
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        let error = ApiError::too_many_requests(Some(self.retry_after));
        let mut response = (StatusCode::TOO_MANY_REQUESTS, axum::Json(error)).into_response();
        let headers = response.headers_mut();
        apply_rate_limit_headers(headers, &self.decision);
        headers.insert(
            HeaderName::from_static("retry-after"),
            HeaderValue::from_str(&self.retry_after.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("60")),
        );
        response
    }
}

/// Rate limiting middleware.
///
/// Every response carries `X-RateLimit-Limit`, `X-RateLimit-Remaining` and
/// `X-RateLimit-Reset`; rejected requests get 429 with `Retry-After`.
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Result<Response, RateLimitError> {
    let identity = RequestIdentity::from_request(&request);
    let decision = limiter.check(&identity).await;

    if !decision.allowed {
        return Err(RateLimitError {
            decision,
            retry_after: decision.retry_after_secs(limiter.now_secs()),
        });
    }

    let mut response = next.run(request).await;
    apply_rate_limit_headers(response.headers_mut(), &decision);
    Ok(response)
}

// ============================================================================
// TESTS
// ============================================================================
