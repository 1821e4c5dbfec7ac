//! Billing REST API Routes
//!
//! Usage view, provider customer resolution, subscription linking and price
//! tier changes for the calling user.

use axum::{
    extract::State,
    middleware::from_fn_with_state,
    routing::{get, post},
    Json, Router,
};
use hearth_core::{BillingAccount, BillingPeriod, UsageMetric};
use serde::{Deserialize, Serialize};

use crate::billing::{SubscriptionSync, UsageRecorder, UsageSummary};
use crate::error::{ApiError, ApiResult};
use crate::middleware::{rate_limit_middleware, RateLimiter, UserContext};
use crate::state::AppState;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerRequest {
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerResponse {
    pub customer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePlanRequest {
    pub price_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSubscriptionRequest {
    pub subscription_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResponse {
    pub subscription_id: Option<String>,
    pub price_id: String,
    pub metric: UsageMetric,
    pub quota_limit: u64,
    pub current_period_usage: u64,
    pub period: BillingPeriod,
}

impl From<BillingAccount> for PlanResponse {
    fn from(account: BillingAccount) -> Self {
        Self {
            subscription_id: account.subscription_id,
            price_id: account.price_id,
            metric: account.metric,
            quota_limit: account.quota_limit,
            current_period_usage: account.current_period_usage,
            period: account.period,
        }
    }
}

fn validate_email(email: &str) -> ApiResult<()> {
    let email = email.trim();
    if email.is_empty() {
        return Err(ApiError::missing_field("email"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(ApiError::invalid_format("email", "name@domain")),
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /api/v1/billing/usage
pub async fn get_usage(
    State(recorder): State<UsageRecorder>,
    user: UserContext,
) -> ApiResult<Json<UsageSummary>> {
    let summary = recorder.usage_summary(user.user_id).await?;
    Ok(Json(summary))
}

/// POST /api/v1/billing/customer
pub async fn resolve_customer(
    State(recorder): State<UsageRecorder>,
    user: UserContext,
    Json(req): Json<CustomerRequest>,
) -> ApiResult<Json<CustomerResponse>> {
    validate_email(&req.email)?;
    let customer_id = recorder
        .resolve_customer(user.user_id, req.email.trim())
        .await?;
    Ok(Json(CustomerResponse { customer_id }))
}

/// POST /api/v1/billing/plan
pub async fn change_plan(
    State(sync): State<SubscriptionSync>,
    user: UserContext,
    Json(req): Json<ChangePlanRequest>,
) -> ApiResult<Json<PlanResponse>> {
    if req.price_id.trim().is_empty() {
        return Err(ApiError::missing_field("priceId"));
    }
    let account = sync.change_price_tier(user.user_id, req.price_id.trim()).await?;
    Ok(Json(account.into()))
}

/// POST /api/v1/billing/subscription
///
/// Attach a subscription created at the provider (for example by checkout)
/// to the caller's account.
pub async fn link_subscription(
    State(recorder): State<UsageRecorder>,
    State(sync): State<SubscriptionSync>,
    user: UserContext,
    Json(req): Json<LinkSubscriptionRequest>,
) -> ApiResult<Json<PlanResponse>> {
    let subscription_id = req.subscription_id.trim();
    if subscription_id.is_empty() {
        return Err(ApiError::missing_field("subscriptionId"));
    }
    recorder.ensure_account(user.user_id, "").await?;
    let account = sync.link_subscription(user.user_id, subscription_id).await?;
    Ok(Json(account.into()))
}

// ============================================================================
// ROUTER
// ============================================================================

/// Plan changes and subscription links go through `plan_limiter` (the auth
/// profile) when given.
pub fn create_router(plan_limiter: Option<RateLimiter>) -> Router<AppState> {
    let mut plan = Router::new()
        .route("/plan", post(change_plan))
        .route("/subscription", post(link_subscription));
    if let Some(limiter) = plan_limiter {
        plan = plan.route_layer(from_fn_with_state(limiter, rate_limit_middleware));
    }

    Router::new()
        .route("/usage", get(get_usage))
        .route("/customer", post(resolve_customer))
        .merge(plan)
}
