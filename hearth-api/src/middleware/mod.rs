//! Middleware modules for Hearth API
//!
//! - `rate_limit`: store-backed rate limiting with per-profile limiters
//! - `user`: caller identity extracted from the gateway's `x-user-id` header
//!
//! # Middleware Order
//!
//! ```ignore
//! Router::new()
//!     .route("/api/v1/billing/plan", post(handler))
//!     // Per-route profile, innermost
//!     .layer(middleware::from_fn_with_state(auth_limiter, rate_limit_middleware))
//!     // General API profile
//!     .layer(middleware::from_fn_with_state(api_limiter, rate_limit_middleware))
//!     // Outermost
//! ```

pub mod rate_limit;
pub mod user;

pub use rate_limit::{
    ip_and_path_key, rate_limit_middleware, user_key, KeyFn, RateLimitConfig, RateLimitDecision,
    RateLimitError, RateLimitStrategy, RateLimiter, RequestIdentity,
};
pub use user::UserContext;
