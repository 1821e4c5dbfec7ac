//! REST API Routes Module
//!
//! - `/api/v1/agent-runs`: run submission and worker results
//! - `/api/v1/billing`: usage view, customer resolution, tier changes
//! - `/health`: liveness and store readiness
//! - `/metrics`: Prometheus exposition
//! - `/debug/cache`: cache dump, only when enabled
//!
//! `/api/v1` sits behind the general rate limit profile; plan changes
//! additionally use the stricter auth profile.

pub mod agent_run;
pub mod billing;
pub mod debug;
pub mod health;

use std::time::Duration;

use axum::{
    http::{header, header::HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::config::ApiConfig;
use crate::constants::USER_ID_HEADER;
use crate::middleware::{rate_limit_middleware, user_key, RateLimitConfig, RateLimiter};
use crate::state::AppState;
use crate::telemetry::{metrics_handler, observability_middleware};

/// Build CORS layer from configuration.
///
/// Empty origins allow any origin.
fn build_cors_layer(config: &ApiConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(USER_ID_HEADER),
        ])
        .expose_headers([
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderName::from_static("x-ratelimit-reset"),
            HeaderName::from_static("retry-after"),
        ])
        .max_age(Duration::from_secs(config.cors_max_age_secs));

    if config.cors_origins.is_empty() {
        tracing::info!("CORS: allowing all origins");
        cors.allow_origin(Any)
    } else {
        tracing::info!(origins = ?config.cors_origins, "CORS: restricting origins");
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(origins)
    }
}

fn limiter(state: &AppState, profile: RateLimitConfig, config: &ApiConfig) -> RateLimiter {
    RateLimiter::new(profile.with_strategy(config.rate_limit_strategy), state.cache.clone())
        .with_key_fn(user_key())
}

/// Assemble the full application router.
pub fn create_api_router(state: AppState, config: &ApiConfig) -> Router {
    let (api_limiter, auth_limiter) = if config.rate_limit_enabled {
        (
            Some(limiter(&state, RateLimitConfig::api(), config)),
            Some(limiter(&state, RateLimitConfig::auth(), config)),
        )
    } else {
        tracing::warn!("Rate limiting disabled");
        (None, None)
    };

    let mut api_routes = Router::new()
        .nest("/agent-runs", agent_run::create_router())
        .nest("/billing", billing::create_router(auth_limiter));
    if let Some(limiter) = api_limiter {
        api_routes = api_routes.layer(from_fn_with_state(limiter, rate_limit_middleware));
    }

    let mut router = Router::new()
        .nest("/api/v1", api_routes)
        .nest("/health", health::create_router())
        .route("/metrics", get(metrics_handler));

    if config.debug_cache_enabled {
        tracing::warn!("Cache debug endpoint mounted at /debug/cache");
        router = router.nest("/debug", debug::create_router());
    }

    router
        .with_state(state)
        .layer(from_fn(observability_middleware))
        .layer(build_cors_layer(config))
}
