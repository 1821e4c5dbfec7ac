//! API Configuration Module
//!
//! Configuration for the HTTP surface, the shared store, outbound calls and
//! billing. Every struct loads from `HEARTH_*` environment variables with
//! defaults suitable for local development.

use hearth_core::{ConfigError, PriceTable, PriceTier};
use std::time::Duration;

use crate::constants::{
    DEFAULT_BILLING_LOCK_TTL_SECS, DEFAULT_CORS_MAX_AGE_SECS, DEFAULT_HTTP_RETRIES,
    DEFAULT_HTTP_RETRY_DELAY_MS, DEFAULT_HTTP_TIMEOUT_MS, DEFAULT_STRIPE_API_BASE,
    DEFAULT_WORKER_URL, CUSTOMER_CACHE_TTL_SECS, USAGE_SUMMARY_CACHE_TTL_SECS,
};
use crate::middleware::RateLimitStrategy;

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|s| matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

// ============================================================================
// API CONFIGURATION
// ============================================================================

/// HTTP surface configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Allowed CORS origins. Empty means allow all (dev mode).
    pub cors_origins: Vec<String>,

    /// Max age for CORS preflight cache in seconds.
    pub cors_max_age_secs: u64,

    /// Whether rate limiting is enabled.
    pub rate_limit_enabled: bool,

    /// Counting strategy used by every rate limit profile.
    pub rate_limit_strategy: RateLimitStrategy,

    /// Mount `GET /debug/cache`. Exposes every cached value; keep off in
    /// production.
    pub debug_cache_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            cors_origins: Vec::new(),
            cors_max_age_secs: DEFAULT_CORS_MAX_AGE_SECS,
            rate_limit_enabled: true,
            rate_limit_strategy: RateLimitStrategy::FixedWindow,
            debug_cache_enabled: false,
        }
    }
}

impl ApiConfig {
    /// Create ApiConfig from environment variables.
    ///
    /// Environment variables:
    /// - `HEARTH_CORS_ORIGINS`: Comma-separated allowed origins (empty = allow all)
    /// - `HEARTH_CORS_MAX_AGE_SECS`: Preflight cache duration (default: 86400)
    /// - `HEARTH_RATE_LIMIT_ENABLED`: "true" or "false" (default: true)
    /// - `HEARTH_RATE_LIMIT_STRATEGY`: "fixed" or "sliding" (default: fixed)
    /// - `HEARTH_DEBUG_CACHE`: "true" mounts the cache dump endpoint (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cors_origins = std::env::var("HEARTH_CORS_ORIGINS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let cors_max_age_secs = std::env::var("HEARTH_CORS_MAX_AGE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.cors_max_age_secs);

        let rate_limit_strategy = std::env::var("HEARTH_RATE_LIMIT_STRATEGY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.rate_limit_strategy);

        Self {
            cors_origins,
            cors_max_age_secs,
            rate_limit_enabled: env_flag("HEARTH_RATE_LIMIT_ENABLED", defaults.rate_limit_enabled),
            rate_limit_strategy,
            debug_cache_enabled: env_flag("HEARTH_DEBUG_CACHE", defaults.debug_cache_enabled),
        }
    }
}

// ============================================================================
// STORE CONFIGURATION
// ============================================================================

/// Shared key-value store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Redis URL. `None` selects the in-process store.
    pub redis_url: Option<String>,

    /// Prefix prepended to every key.
    pub key_prefix: String,

    pub connect_timeout: Duration,

    /// Bound on every individual store command.
    pub operation_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "hearth:".to_string(),
            connect_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(2),
        }
    }
}

impl StoreConfig {
    /// Environment variables:
    /// - `HEARTH_REDIS_URL`: Redis connection URL (unset = in-process store)
    /// - `HEARTH_REDIS_PREFIX`: Key prefix (default: "hearth:")
    /// - `HEARTH_REDIS_CONNECT_TIMEOUT_MS`: Connect timeout (default: 5000)
    /// - `HEARTH_REDIS_OP_TIMEOUT_MS`: Per-command timeout (default: 2000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: env_non_empty("HEARTH_REDIS_URL"),
            key_prefix: std::env::var("HEARTH_REDIS_PREFIX").unwrap_or(defaults.key_prefix),
            connect_timeout: std::env::var("HEARTH_REDIS_CONNECT_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            operation_timeout: std::env::var("HEARTH_REDIS_OP_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.operation_timeout),
        }
    }

    #[cfg(feature = "redis")]
    pub fn redis_config(&self, url: &str) -> hearth_storage::RedisStoreConfig {
        hearth_storage::RedisStoreConfig {
            url: url.to_string(),
            prefix: self.key_prefix.clone(),
            connect_timeout: self.connect_timeout,
            operation_timeout: self.operation_timeout,
        }
    }
}

// ============================================================================
// OUTBOUND HTTP CONFIGURATION
// ============================================================================

/// Defaults applied to every outbound request.
#[derive(Debug, Clone, Copy)]
pub struct HttpClientConfig {
    /// Per-attempt timeout.
    pub timeout: Duration,

    /// Additional attempts after the first.
    pub retries: u32,

    /// Base retry delay, doubled per attempt.
    pub retry_delay: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS),
            retries: DEFAULT_HTTP_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_HTTP_RETRY_DELAY_MS),
        }
    }
}

impl HttpClientConfig {
    /// Environment variables:
    /// - `HEARTH_HTTP_TIMEOUT_MS` (default: 10000)
    /// - `HEARTH_HTTP_RETRIES` (default: 2)
    /// - `HEARTH_HTTP_RETRY_DELAY_MS` (default: 250)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout: std::env::var("HEARTH_HTTP_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            retries: std::env::var("HEARTH_HTTP_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.retries),
            retry_delay: std::env::var("HEARTH_HTTP_RETRY_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
        }
    }
}

/// Worker service location.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub base_url: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_WORKER_URL.to_string(),
        }
    }
}

impl WorkerConfig {
    /// `HEARTH_WORKER_URL` (default: http://localhost:8080)
    pub fn from_env() -> Self {
        Self {
            base_url: env_non_empty("HEARTH_WORKER_URL")
                .unwrap_or_else(|| DEFAULT_WORKER_URL.to_string()),
        }
    }
}

/// Webhook delivery settings.
#[derive(Debug, Clone, Default)]
pub struct WebhookConfig {
    /// HMAC-SHA256 key for the signature header; unsigned when `None`.
    pub signing_secret: Option<String>,
}

impl WebhookConfig {
    /// `HEARTH_WEBHOOK_SECRET` (default: unset)
    pub fn from_env() -> Self {
        Self {
            signing_secret: env_non_empty("HEARTH_WEBHOOK_SECRET"),
        }
    }
}

// ============================================================================
// BILLING CONFIGURATION
// ============================================================================

/// Billing provider credentials, price tiers and metering timings.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Provider API base URL.
    pub api_base: String,

    /// Provider secret key. Billing provider calls are disabled when `None`.
    pub secret_key: Option<String>,

    /// Price tiers; the first is assigned to new accounts.
    pub tiers: Vec<PriceTier>,

    /// TTL of the `customer:<user>` and `usage:<user>` locks.
    pub lock_ttl: Duration,

    pub customer_cache_ttl: Duration,

    pub usage_summary_ttl: Duration,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_STRIPE_API_BASE.to_string(),
            secret_key: None,
            tiers: vec![
                PriceTier::new("price_free", "free", 100),
                PriceTier::new("price_pro", "pro", 5_000),
                PriceTier::new("price_team", "team", 50_000),
            ],
            lock_ttl: Duration::from_secs(DEFAULT_BILLING_LOCK_TTL_SECS),
            customer_cache_ttl: Duration::from_secs(CUSTOMER_CACHE_TTL_SECS),
            usage_summary_ttl: Duration::from_secs(USAGE_SUMMARY_CACHE_TTL_SECS),
        }
    }
}

impl BillingConfig {
    /// Environment variables:
    /// - `HEARTH_STRIPE_API_BASE` (default: https://api.stripe.com)
    /// - `HEARTH_STRIPE_SECRET_KEY` (default: unset)
    /// - `HEARTH_PRICE_{FREE,PRO,TEAM}_ID`: Provider price ids
    /// - `HEARTH_PRICE_{FREE,PRO,TEAM}_QUOTA`: Per-period quota of each tier
    /// - `HEARTH_BILLING_LOCK_TTL_SECS` (default: 30)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let tiers = defaults
            .tiers
            .iter()
            .map(|tier| {
                let upper = tier.name.to_uppercase();
                let price_id = env_non_empty(&format!("HEARTH_PRICE_{}_ID", upper))
                    .unwrap_or_else(|| tier.price_id.clone());
                let quota = std::env::var(format!("HEARTH_PRICE_{}_QUOTA", upper))
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(tier.quota_limit);
                PriceTier::new(price_id, tier.name.clone(), quota)
            })
            .collect();

        Self {
            api_base: env_non_empty("HEARTH_STRIPE_API_BASE").unwrap_or(defaults.api_base),
            secret_key: env_non_empty("HEARTH_STRIPE_SECRET_KEY"),
            tiers,
            lock_ttl: std::env::var("HEARTH_BILLING_LOCK_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_ttl),
            customer_cache_ttl: defaults.customer_cache_ttl,
            usage_summary_ttl: defaults.usage_summary_ttl,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.secret_key.is_some()
    }

    pub fn price_table(&self) -> Result<PriceTable, ConfigError> {
        PriceTable::new(self.tiers.clone()).ok_or_else(|| ConfigError::MissingRequired {
            field: "HEARTH_PRICE_FREE_ID".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_config_defaults() {
        let config = ApiConfig::default();
        assert!(config.cors_origins.is_empty());
        assert!(config.rate_limit_enabled);
        assert_eq!(config.rate_limit_strategy, RateLimitStrategy::FixedWindow);
        assert!(!config.debug_cache_enabled);
    }

    #[test]
    fn test_http_client_config_defaults() {
        let config = HttpClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.retries, 2);
        assert_eq!(config.retry_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_billing_price_table() {
        let config = BillingConfig::default();
        assert!(!config.is_configured());
        let table = config.price_table().unwrap();
        assert_eq!(table.default_tier().name, "free");
        assert_eq!(table.quota_for("price_pro"), Some(5_000));
    }

    #[test]
    fn test_empty_tiers_are_a_config_error() {
        let config = BillingConfig {
            tiers: Vec::new(),
            ..BillingConfig::default()
        };
        assert!(matches!(
            config.price_table(),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_store_config_from_env_reads_timeout() {
        std::env::set_var("HEARTH_REDIS_OP_TIMEOUT_MS", "750");
        let config = StoreConfig::from_env();
        std::env::remove_var("HEARTH_REDIS_OP_TIMEOUT_MS");
        assert_eq!(config.operation_timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_env_flag_parsing() {
        std::env::set_var("HEARTH_TEST_FLAG_YES", "YES");
        std::env::set_var("HEARTH_TEST_FLAG_NO", "off");
        assert!(env_flag("HEARTH_TEST_FLAG_YES", false));
        assert!(!env_flag("HEARTH_TEST_FLAG_NO", true));
        assert!(env_flag("HEARTH_TEST_FLAG_UNSET", true));
        std::env::remove_var("HEARTH_TEST_FLAG_YES");
        std::env::remove_var("HEARTH_TEST_FLAG_NO");
    }
}
