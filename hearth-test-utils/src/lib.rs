//! Hearth Test Utilities
//!
//! Shared test infrastructure for the Hearth workspace:
//! - A mock billing provider with Stripe-like usage semantics
//! - Proptest generators for ids, cache entries and price tiers
//! - Fixtures for billing accounts and in-memory stores

pub use hearth_core::{
    BillingAccount, BillingError, BillingPeriod, BillingProvider, BillingResult, EntityIdType,
    PriceTable, PriceTier, Subscription, SubscriptionItem, SubscriptionItemUpdate, Timestamp,
    UsageAction, UsageMetric, UsageRecord, UsageRecordReceipt, UserId,
};
pub use hearth_storage::{InMemoryBillingAccountStore, InMemoryKvStore, InMemoryUsageLedger};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

// ============================================================================
// MOCK BILLING PROVIDER
// ============================================================================

/// In-process billing provider.
///
/// Customers are deduplicated by idempotency key. Usage records follow the
/// provider's semantics: `set` replaces the stored quantity of an item,
/// `increment` adds to it.
#[derive(Debug, Default)]
pub struct MockBillingProvider {
    customers: DashMap<String, String>,
    subscriptions: DashMap<String, Subscription>,
    item_usage: DashMap<String, u64>,
    failing: AtomicBool,
    latency_ms: AtomicU64,
    customer_calls: AtomicU64,
    retrieve_calls: AtomicU64,
    update_calls: AtomicU64,
    usage_calls: AtomicU64,
}

impl MockBillingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
        self
    }

    /// While set, every call fails with a transport error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Register a subscription with one metered item.
    pub fn seed_subscription(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
        period: BillingPeriod,
    ) -> Subscription {
        let subscription = Subscription {
            id: subscription_id.to_string(),
            status: "active".to_string(),
            items: vec![SubscriptionItem {
                id: item_id.to_string(),
                price_id: price_id.to_string(),
            }],
            period,
        };
        self.subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        subscription
    }

    /// Quantity the provider currently holds for an item.
    pub fn usage_for(&self, item_id: &str) -> Option<u64> {
        self.item_usage.get(item_id).map(|q| *q)
    }

    pub fn subscription(&self, subscription_id: &str) -> Option<Subscription> {
        self.subscriptions.get(subscription_id).map(|s| s.clone())
    }

    pub fn customer_calls(&self) -> u64 {
        self.customer_calls.load(Ordering::SeqCst)
    }

    pub fn retrieve_calls(&self) -> u64 {
        self.retrieve_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> u64 {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn usage_calls(&self) -> u64 {
        self.usage_calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, counter: &AtomicU64) -> BillingResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(BillingError::Transport {
                reason: "mock provider unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn missing(kind: &str, id: &str) -> BillingError {
        BillingError::Provider {
            status: 404,
            message: format!("No such {}: '{}'", kind, id),
        }
    }
}

#[async_trait]
impl BillingProvider for MockBillingProvider {
    async fn create_customer(
        &self,
        _user_id: UserId,
        _email: &str,
        idempotency_key: &str,
    ) -> BillingResult<String> {
        self.enter(&self.customer_calls).await?;
        let id = self
            .customers
            .entry(idempotency_key.to_string())
            .or_insert_with(|| format!("cus_{}", uuid::Uuid::now_v7().simple()))
            .clone();
        Ok(id)
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<Subscription> {
        self.enter(&self.retrieve_calls).await?;
        self.subscription(subscription_id)
            .ok_or_else(|| Self::missing("subscription", subscription_id))
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        items: &[SubscriptionItemUpdate],
    ) -> BillingResult<Subscription> {
        self.enter(&self.update_calls).await?;
        let mut subscription = self
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| Self::missing("subscription", subscription_id))?;
        for update in items {
            let item = subscription
                .items
                .iter_mut()
                .find(|i| i.id == update.id)
                .ok_or_else(|| Self::missing("subscription item", &update.id))?;
            item.price_id = update.price_id.clone();
        }
        Ok(subscription.clone())
    }

    async fn create_usage_record(
        &self,
        subscription_item_id: &str,
        record: &UsageRecord,
    ) -> BillingResult<UsageRecordReceipt> {
        self.enter(&self.usage_calls).await?;
        let known = self.subscriptions.iter().any(|s| {
            s.items.iter().any(|i| i.id == subscription_item_id)
        });
        if !known {
            return Err(Self::missing("subscription item", subscription_item_id));
        }

        let mut stored = self
            .item_usage
            .entry(subscription_item_id.to_string())
            .or_insert(0);
        *stored = match record.action {
            UsageAction::Set => record.quantity,
            UsageAction::Increment => stored.saturating_add(record.quantity),
        };

        Ok(UsageRecordReceipt {
            id: format!("mbur_{}", uuid::Uuid::now_v7().simple()),
            subscription_item_id: subscription_item_id.to_string(),
            quantity: *stored,
        })
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Hearth types.

    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    /// Generate a random UserId.
    pub fn arb_user_id() -> impl Strategy<Value = UserId> {
        any::<[u8; 16]>().prop_map(|bytes| UserId::new(Uuid::from_bytes(bytes)))
    }

    pub fn arb_usage_metric() -> impl Strategy<Value = UsageMetric> {
        prop_oneof![Just(UsageMetric::Tokens), Just(UsageMetric::Executions)]
    }

    /// Cache-safe key: lowercase segments joined by `:`.
    pub fn arb_cache_key() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z][a-z0-9_]{0,11}", 1..4).prop_map(|parts| parts.join(":"))
    }

    pub fn arb_tag() -> impl Strategy<Value = String> {
        "[a-z]{1,8}(:[a-z0-9]{1,8})?"
    }

    /// Small JSON values of every shape.
    pub fn arb_json_value() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[ -~]{0,24}".prop_map(serde_json::Value::from),
        ];
        leaf.prop_recursive(2, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::from),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(|map| {
                    serde_json::Value::Object(map.into_iter().collect())
                }),
            ]
        })
    }

    /// TTLs between one second and one day.
    pub fn arb_ttl() -> impl Strategy<Value = Duration> {
        (1u64..86_400).prop_map(Duration::from_secs)
    }

    pub fn arb_price_tier() -> impl Strategy<Value = PriceTier> {
        ("price_[a-z0-9]{4,12}", "[a-z]{3,8}", 1u64..1_000_000)
            .prop_map(|(price_id, name, quota)| PriceTier::new(price_id, name, quota))
    }

    /// Positive per-call usage quantities.
    pub fn arb_usage_quantities() -> impl Strategy<Value = Vec<u64>> {
        prop::collection::vec(1u64..10_000, 1..20)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for billing scenarios.

    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::sync::Arc;

    /// 2024-01-01T00:00:00Z in milliseconds.
    pub const FIXTURE_START_MS: i64 = 1_704_067_200_000;

    pub fn fixture_start() -> Timestamp {
        Utc.timestamp_millis_opt(FIXTURE_START_MS)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Thirty-day period starting at `start`.
    pub fn period_at(start: Timestamp) -> BillingPeriod {
        BillingPeriod::new(start, start + ChronoDuration::days(30))
    }

    /// free / pro / team with small quotas.
    pub fn price_table() -> PriceTable {
        PriceTable::new(vec![
            PriceTier::new("price_free", "free", 100),
            PriceTier::new("price_pro", "pro", 5_000),
            PriceTier::new("price_team", "team", 50_000),
        ])
        .unwrap_or_else(|| unreachable!("fixture table is not empty"))
    }

    /// An account on `price_id` linked to a subscription with one item.
    pub fn subscribed_account(
        user_id: UserId,
        price_id: &str,
        subscription_id: &str,
        item_id: &str,
        period: BillingPeriod,
    ) -> BillingAccount {
        let table = price_table();
        let tier = table.find(price_id).cloned().unwrap_or_else(|| table.default_tier().clone());
        let mut account = BillingAccount::new(user_id, "user@example.com", &tier, period.start);
        account.external_customer_id = Some(format!("cus_{}", user_id.as_uuid().simple()));
        account.subscription_id = Some(subscription_id.to_string());
        account.subscription_item_id = Some(item_id.to_string());
        account.period = period;
        account
    }

    /// Fresh in-memory store, account store and ledger.
    pub fn in_memory_stores() -> (
        Arc<InMemoryKvStore>,
        Arc<InMemoryBillingAccountStore>,
        Arc<InMemoryUsageLedger>,
    ) {
        (
            Arc::new(InMemoryKvStore::new()),
            Arc::new(InMemoryBillingAccountStore::new()),
            Arc::new(InMemoryUsageLedger::new()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn record(quantity: u64, action: UsageAction) -> UsageRecord {
        UsageRecord {
            quantity,
            timestamp: fixture_start(),
            action,
        }
    }

    #[tokio::test]
    async fn test_usage_set_replaces_and_increment_adds() {
        let provider = MockBillingProvider::new();
        provider.seed_subscription("sub_1", "si_1", "price_pro", period_at(fixture_start()));

        provider.create_usage_record("si_1", &record(10, UsageAction::Set)).await.unwrap();
        provider.create_usage_record("si_1", &record(10, UsageAction::Set)).await.unwrap();
        assert_eq!(provider.usage_for("si_1"), Some(10));

        provider.create_usage_record("si_1", &record(5, UsageAction::Increment)).await.unwrap();
        assert_eq!(provider.usage_for("si_1"), Some(15));
        assert_eq!(provider.usage_calls(), 3);
    }

    #[tokio::test]
    async fn test_customer_idempotency_key() {
        let provider = MockBillingProvider::new();
        let user = UserId::now_v7();
        let a = provider.create_customer(user, "a@example.com", "customer-1").await.unwrap();
        let b = provider.create_customer(user, "a@example.com", "customer-1").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(provider.customer_calls(), 2);
    }

    #[tokio::test]
    async fn test_failing_and_unknown_item() {
        let provider = MockBillingProvider::new();
        let err = provider
            .create_usage_record("si_missing", &record(1, UsageAction::Set))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Provider { status: 404, .. }));

        provider.set_failing(true);
        let err = provider.retrieve_subscription("sub_1").await.unwrap_err();
        assert!(matches!(err, BillingError::Transport { .. }));
    }

    #[test]
    fn test_subscribed_account_fixture() {
        let account = subscribed_account(
            UserId::now_v7(),
            "price_pro",
            "sub_1",
            "si_1",
            period_at(fixture_start()),
        );
        assert_eq!(account.quota_limit, 5_000);
        assert_eq!(account.subscription_item_id.as_deref(), Some("si_1"));
    }
}
