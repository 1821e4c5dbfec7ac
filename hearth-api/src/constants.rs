//! Constants for Hearth API
//!
//! Defaults, key prefixes and header names used across the service.

// ============================================================================
// SERVER
// ============================================================================

/// Default listen port when neither `PORT` nor `HEARTH_API_PORT` is set
pub const DEFAULT_PORT: u16 = 3000;

/// Default CORS max age in seconds (24 hours)
pub const DEFAULT_CORS_MAX_AGE_SECS: u64 = 86400;

// ============================================================================
// RATE LIMITING
// ============================================================================

/// Prefix of every rate limit window key
pub const RATE_LIMIT_KEY_PREFIX: &str = "ratelimit";

/// General API profile: 60 requests per minute
pub const API_RATE_LIMIT_MAX: u64 = 60;
pub const API_RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Authentication-sensitive profile: 5 requests per 15 minutes
pub const AUTH_RATE_LIMIT_MAX: u64 = 5;
pub const AUTH_RATE_LIMIT_WINDOW_SECS: u64 = 15 * 60;

/// Search profile: 30 requests per minute
pub const SEARCH_RATE_LIMIT_MAX: u64 = 30;
pub const SEARCH_RATE_LIMIT_WINDOW_SECS: u64 = 60;

pub const HEADER_RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

// ============================================================================
// OUTBOUND HTTP
// ============================================================================

/// Per-attempt timeout for outbound requests
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;

/// Additional attempts after the first one
pub const DEFAULT_HTTP_RETRIES: u32 = 2;

/// Base delay before the first retry; doubled per attempt
pub const DEFAULT_HTTP_RETRY_DELAY_MS: u64 = 250;

/// Default worker service base URL
pub const DEFAULT_WORKER_URL: &str = "http://localhost:8080";

/// Header carrying the webhook HMAC signature
pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-hearth-signature";

// ============================================================================
// BILLING
// ============================================================================

/// Default billing provider API base
pub const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com";

/// Cache key prefix for the user → provider customer mapping
pub const CUSTOMER_CACHE_PREFIX: &str = "billing:customer:";

/// How long a resolved customer id stays cached (1 hour)
pub const CUSTOMER_CACHE_TTL_SECS: u64 = 3600;

/// How long a usage summary stays cached
pub const USAGE_SUMMARY_CACHE_TTL_SECS: u64 = 60;

/// Default TTL of the per-user billing locks
pub const DEFAULT_BILLING_LOCK_TTL_SECS: u64 = 30;

/// Default interval between usage reconciliation passes (1 hour)
pub const DEFAULT_USAGE_SYNC_INTERVAL_SECS: u64 = 3600;

// ============================================================================
// USER CONTEXT
// ============================================================================

/// Header the upstream gateway sets to the authenticated user id
pub const USER_ID_HEADER: &str = "x-user-id";
