//! Hearth API - HTTP Service Layer
//!
//! Axum server exposing agent runs and billing on top of the shared
//! infrastructure in `hearth-storage`:
//!
//! - store-backed rate limiting on every `/api/v1` route
//! - a retrying HTTP client for the worker service, webhooks and the billing
//!   provider
//! - local usage metering, reconciled with the billing provider by a
//!   periodic job
//!
//! Configuration comes from `HEARTH_*` environment variables; see [`config`].

pub mod billing;
pub mod config;
pub mod constants;
pub mod error;
pub mod http_client;
pub mod jobs;
pub mod macros;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod webhooks;
pub mod worker;

// Re-export commonly used types
pub use billing::{
    BillingContext, StripeClient, SubscriptionSync, SyncOutcome, SyncReport, UsageRecorder,
    UsageSummary,
};
pub use config::{ApiConfig, BillingConfig, HttpClientConfig, StoreConfig, WebhookConfig, WorkerConfig};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use http_client::{HttpClientError, RequestConfig, RetryingHttpClient};
pub use jobs::{usage_sync_task, UsageSyncConfig};
pub use middleware::{RateLimitConfig, RateLimitDecision, RateLimiter, UserContext};
pub use routes::create_api_router;
pub use state::AppState;
pub use webhooks::{WebhookDelivery, WebhookPayload};
pub use worker::{JobSubmission, WorkerClient};
