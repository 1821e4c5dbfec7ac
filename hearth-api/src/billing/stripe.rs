//! Stripe-style billing provider over form-encoded HTTP.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hearth_core::{
    BillingError, BillingPeriod, BillingProvider, BillingResult, Subscription, SubscriptionItem,
    SubscriptionItemUpdate, Timestamp, UsageRecord, UsageRecordReceipt, UserId,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::BillingConfig;
use crate::http_client::{HttpClientError, RequestConfig, RetryingHttpClient};

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Deserialize)]
struct CustomerObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PriceObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItemObject {
    id: String,
    price: PriceObject,
}

#[derive(Debug, Deserialize)]
struct ItemList {
    data: Vec<SubscriptionItemObject>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    status: String,
    current_period_start: i64,
    current_period_end: i64,
    items: ItemList,
}

#[derive(Debug, Deserialize)]
struct UsageRecordObject {
    id: String,
    quantity: u64,
    subscription_item: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

fn unix_to_timestamp(secs: i64) -> BillingResult<Timestamp> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| BillingError::InvalidResponse {
            reason: format!("timestamp out of range: {}", secs),
        })
}

impl SubscriptionObject {
    fn into_subscription(self) -> BillingResult<Subscription> {
        Ok(Subscription {
            id: self.id,
            status: self.status,
            period: BillingPeriod::new(
                unix_to_timestamp(self.current_period_start)?,
                unix_to_timestamp(self.current_period_end)?,
            ),
            items: self
                .items
                .data
                .into_iter()
                .map(|item| SubscriptionItem {
                    id: item.id,
                    price_id: item.price.id,
                })
                .collect(),
        })
    }
}

fn billing_error(err: HttpClientError) -> BillingError {
    match err {
        HttpClientError::Status { status, body, .. } => {
            let message = serde_json::from_str::<ErrorEnvelope>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            BillingError::Provider { status, message }
        }
        HttpClientError::Decode { reason, .. } => BillingError::InvalidResponse { reason },
        other => BillingError::Transport {
            reason: other.to_string(),
        },
    }
}

// ============================================================================
// CLIENT
// ============================================================================

#[derive(Debug, Clone)]
pub struct StripeClient {
    http: RetryingHttpClient,
    api_base: String,
    secret_key: String,
}

impl StripeClient {
    pub fn new(http: RetryingHttpClient, api_base: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into(),
            secret_key: secret_key.into(),
        }
    }

    /// `None` when no secret key is configured.
    pub fn from_config(http: RetryingHttpClient, config: &BillingConfig) -> Option<Self> {
        config
            .secret_key
            .as_ref()
            .map(|key| Self::new(http, config.api_base.clone(), key.clone()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base.trim_end_matches('/'), path)
    }

    fn request(&self, request: RequestConfig) -> RequestConfig {
        request
            .with_defaults(self.http.defaults())
            .bearer(&self.secret_key)
            .target("billing")
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestConfig) -> BillingResult<T> {
        self.http.request_json(&request).await.map_err(billing_error)
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn create_customer(
        &self,
        user_id: UserId,
        email: &str,
        idempotency_key: &str,
    ) -> BillingResult<String> {
        let request = self
            .request(RequestConfig::post(self.url("/v1/customers")))
            .header("Idempotency-Key", idempotency_key)
            .form(vec![
                ("email".to_string(), email.to_string()),
                ("metadata[user_id]".to_string(), user_id.to_string()),
            ]);

        let customer: CustomerObject = self.send(request).await?;
        tracing::info!(user_id = %user_id, customer_id = %customer.id, "Billing customer created");
        Ok(customer.id)
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<Subscription> {
        let request = self.request(RequestConfig::get(
            self.url(&format!("/v1/subscriptions/{}", subscription_id)),
        ));
        let subscription: SubscriptionObject = self.send(request).await?;
        subscription.into_subscription()
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        items: &[SubscriptionItemUpdate],
    ) -> BillingResult<Subscription> {
        let mut form = Vec::with_capacity(items.len() * 2 + 1);
        for (i, item) in items.iter().enumerate() {
            form.push((format!("items[{}][id]", i), item.id.clone()));
            form.push((format!("items[{}][price]", i), item.price_id.clone()));
        }
        form.push(("proration_behavior".to_string(), "create_prorations".to_string()));

        let request = self
            .request(RequestConfig::post(
                self.url(&format!("/v1/subscriptions/{}", subscription_id)),
            ))
            .form(form);
        let subscription: SubscriptionObject = self.send(request).await?;
        subscription.into_subscription()
    }

    async fn create_usage_record(
        &self,
        subscription_item_id: &str,
        record: &UsageRecord,
    ) -> BillingResult<UsageRecordReceipt> {
        let request = self
            .request(RequestConfig::post(self.url(&format!(
                "/v1/subscription_items/{}/usage_records",
                subscription_item_id
            ))))
            .form(vec![
                ("quantity".to_string(), record.quantity.to_string()),
                ("timestamp".to_string(), record.timestamp.timestamp().to_string()),
                ("action".to_string(), record.action.as_str().to_string()),
            ]);

        let receipt: UsageRecordObject = self.send(request).await?;
        Ok(UsageRecordReceipt {
            id: receipt.id,
            subscription_item_id: receipt.subscription_item,
            quantity: receipt.quantity,
        })
    }
}
