//! Billing account persistence.
//!
//! Writers update individual fields instead of writing whole rows back, so
//! customer resolution, usage recording and provider reconciliation can run
//! at the same time for one user without undoing each other.

use async_trait::async_trait;
use dashmap::DashMap;
use hearth_core::{
    BillingAccount, BillingPeriod, StoreError, StoreResult, UsageMetric, UserId,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::kv::{KeyValueStore, WriteOp};

/// Plan and period state adopted from the billing provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    pub price_id: String,
    pub quota_limit: u64,
    pub period: BillingPeriod,
    pub subscription_item_id: Option<String>,
    /// Billed-metric total of `period`.
    pub period_usage: u64,
}

/// Usage counters only grow within a period; a different period replaces them.
fn merged_usage(
    current_period: &BillingPeriod,
    current: u64,
    period: &BillingPeriod,
    usage: u64,
) -> u64 {
    if current_period == period {
        current.max(usage)
    } else {
        usage
    }
}

impl SubscriptionState {
    fn apply_to(&self, account: &mut BillingAccount) {
        account.current_period_usage = merged_usage(
            &account.period,
            account.current_period_usage,
            &self.period,
            self.period_usage,
        );
        account.price_id = self.price_id.clone();
        account.quota_limit = self.quota_limit;
        account.period = self.period;
        account.subscription_item_id = self.subscription_item_id.clone();
    }
}

/// Account storage. Every update returns the account as stored afterwards,
/// or `None` when the user has no account.
#[async_trait]
pub trait BillingAccountStore: Send + Sync {
    async fn get(&self, user_id: UserId) -> StoreResult<Option<BillingAccount>>;

    /// Insert or replace the whole account. Used for seeding and imports.
    async fn upsert(&self, account: BillingAccount) -> StoreResult<()>;

    /// Insert only when no account exists; returns the stored account.
    async fn insert_if_absent(&self, account: BillingAccount) -> StoreResult<BillingAccount>;

    /// Set the email when the stored one is empty.
    async fn set_email_if_empty(
        &self,
        user_id: UserId,
        email: &str,
    ) -> StoreResult<Option<BillingAccount>>;

    /// Record the provider customer id. An id that is already stored is kept,
    /// so the returned account carries whichever id was saved first.
    async fn set_customer_id(
        &self,
        user_id: UserId,
        customer_id: &str,
    ) -> StoreResult<Option<BillingAccount>>;

    async fn link_subscription(
        &self,
        user_id: UserId,
        subscription_id: &str,
        subscription_item_id: Option<&str>,
    ) -> StoreResult<Option<BillingAccount>>;

    /// Adopt the provider's plan and period.
    async fn apply_subscription_state(
        &self,
        user_id: UserId,
        state: &SubscriptionState,
    ) -> StoreResult<Option<BillingAccount>>;

    /// Move the account from `from` to `to` with `usage` as the new counter.
    /// Does nothing when another writer already moved the period.
    async fn roll_period(
        &self,
        user_id: UserId,
        from: &BillingPeriod,
        to: BillingPeriod,
        usage: u64,
    ) -> StoreResult<Option<BillingAccount>>;

    /// Raise the usage counter of `period`. Ignored once the account is in
    /// another period; never lowers the counter.
    async fn set_period_usage(
        &self,
        user_id: UserId,
        period: &BillingPeriod,
        usage: u64,
    ) -> StoreResult<()>;

    async fn list(&self) -> StoreResult<Vec<BillingAccount>>;
}

// ============================================================================
// IN-MEMORY
// ============================================================================

#[derive(Debug, Default)]
pub struct InMemoryBillingAccountStore {
    accounts: DashMap<UserId, BillingAccount>,
}

impl InMemoryBillingAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(
        &self,
        user_id: UserId,
        f: impl FnOnce(&mut BillingAccount),
    ) -> Option<BillingAccount> {
        self.accounts.get_mut(&user_id).map(|mut account| {
            f(&mut account);
            account.clone()
        })
    }
}

#[async_trait]
impl BillingAccountStore for InMemoryBillingAccountStore {
    async fn get(&self, user_id: UserId) -> StoreResult<Option<BillingAccount>> {
        Ok(self.accounts.get(&user_id).map(|a| a.clone()))
    }

    async fn upsert(&self, account: BillingAccount) -> StoreResult<()> {
        self.accounts.insert(account.user_id, account);
        Ok(())
    }

    async fn insert_if_absent(&self, account: BillingAccount) -> StoreResult<BillingAccount> {
        Ok(self
            .accounts
            .entry(account.user_id)
            .or_insert(account)
            .clone())
    }

    async fn set_email_if_empty(
        &self,
        user_id: UserId,
        email: &str,
    ) -> StoreResult<Option<BillingAccount>> {
        Ok(self.update(user_id, |account| {
            if account.email.is_empty() {
                account.email = email.to_string();
            }
        }))
    }

    async fn set_customer_id(
        &self,
        user_id: UserId,
        customer_id: &str,
    ) -> StoreResult<Option<BillingAccount>> {
        Ok(self.update(user_id, |account| {
            account
                .external_customer_id
                .get_or_insert_with(|| customer_id.to_string());
        }))
    }

    async fn link_subscription(
        &self,
        user_id: UserId,
        subscription_id: &str,
        subscription_item_id: Option<&str>,
    ) -> StoreResult<Option<BillingAccount>> {
        Ok(self.update(user_id, |account| {
            account.subscription_id = Some(subscription_id.to_string());
            account.subscription_item_id = subscription_item_id.map(str::to_string);
        }))
    }

    async fn apply_subscription_state(
        &self,
        user_id: UserId,
        state: &SubscriptionState,
    ) -> StoreResult<Option<BillingAccount>> {
        Ok(self.update(user_id, |account| state.apply_to(account)))
    }

    async fn roll_period(
        &self,
        user_id: UserId,
        from: &BillingPeriod,
        to: BillingPeriod,
        usage: u64,
    ) -> StoreResult<Option<BillingAccount>> {
        Ok(self.update(user_id, |account| {
            if account.period == *from {
                account.period = to;
                account.current_period_usage = usage;
            }
        }))
    }

    async fn set_period_usage(
        &self,
        user_id: UserId,
        period: &BillingPeriod,
        usage: u64,
    ) -> StoreResult<()> {
        self.update(user_id, |account| {
            if account.period == *period {
                account.current_period_usage = account.current_period_usage.max(usage);
            }
        });
        Ok(())
    }

    async fn list(&self) -> StoreResult<Vec<BillingAccount>> {
        let mut accounts: Vec<BillingAccount> =
            self.accounts.iter().map(|a| a.value().clone()).collect();
        accounts.sort_by_key(|a| a.user_id);
        Ok(accounts)
    }
}

// ============================================================================
// KEY-VALUE STORE
// ============================================================================

/// Store key prefix of account fields: `billing:account:<user>:<field>`.
pub const ACCOUNT_PREFIX: &str = "billing:account:";

const PROFILE: &str = "profile";
const EMAIL: &str = "email";
const CUSTOMER: &str = "customer";
const SUBSCRIPTION: &str = "subscription";
const ITEM: &str = "item";
const PLAN: &str = "plan";
const PERIOD: &str = "period";

/// Read order of [`KvBillingAccountStore::get`]. The profile marks an
/// account as present and is written last on creation.
const FIELDS: [&str; 7] = [PROFILE, EMAIL, CUSTOMER, SUBSCRIPTION, ITEM, PLAN, PERIOD];

const MAX_SWAP_ATTEMPTS: usize = 64;

fn field_key(user_id: UserId, field: &str) -> String {
    format!("{}{}:{}", ACCOUNT_PREFIX, user_id, field)
}

#[derive(Debug, Serialize, Deserialize)]
struct Profile {
    user_id: UserId,
    metric: UsageMetric,
}

#[derive(Debug, Serialize, Deserialize)]
struct Plan {
    price_id: String,
    quota_limit: u64,
}

/// Period and its usage counter share one key so they change together.
#[derive(Debug, Serialize, Deserialize)]
struct PeriodUsage {
    period: BillingPeriod,
    usage: u64,
}

fn encode<T: Serialize>(key: &str, value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> StoreResult<T> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Accounts kept in the shared key-value store, one key per field group.
///
/// Write-once fields (email, customer id) use `SET NX`. The period and its
/// usage counter are updated with compare-and-swap.
#[derive(Clone)]
pub struct KvBillingAccountStore {
    kv: Arc<dyn KeyValueStore>,
}

impl KvBillingAccountStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    async fn exists(&self, user_id: UserId) -> StoreResult<bool> {
        Ok(self.kv.get(&field_key(user_id, PROFILE)).await?.is_some())
    }

    /// Field values of `account` in [`FIELDS`] order; `None` for empty fields.
    fn encode_fields(account: &BillingAccount) -> StoreResult<Vec<(String, Option<String>)>> {
        let user_id = account.user_id;
        let key = |field: &str| field_key(user_id, field);
        let profile = Profile {
            user_id,
            metric: account.metric,
        };
        let plan = Plan {
            price_id: account.price_id.clone(),
            quota_limit: account.quota_limit,
        };
        let period = PeriodUsage {
            period: account.period,
            usage: account.current_period_usage,
        };
        Ok(vec![
            (key(PROFILE), Some(encode(&key(PROFILE), &profile)?)),
            (key(EMAIL), Some(account.email.clone()).filter(|e| !e.is_empty())),
            (key(CUSTOMER), account.external_customer_id.clone()),
            (key(SUBSCRIPTION), account.subscription_id.clone()),
            (key(ITEM), account.subscription_item_id.clone()),
            (key(PLAN), Some(encode(&key(PLAN), &plan)?)),
            (key(PERIOD), Some(encode(&key(PERIOD), &period)?)),
        ])
    }

    /// Compare-and-swap loop over the period record. `next` returns `None`
    /// to leave the record alone.
    async fn update_period<F>(&self, user_id: UserId, mut next: F) -> StoreResult<()>
    where
        F: FnMut(&PeriodUsage) -> Option<PeriodUsage> + Send,
    {
        let key = field_key(user_id, PERIOD);
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let Some(raw) = self.kv.get(&key).await? else {
                return Ok(());
            };
            let current: PeriodUsage = decode(&key, &raw)?;
            let Some(updated) = next(&current) else {
                return Ok(());
            };
            if self
                .kv
                .set_if_equals(&key, &raw, &encode(&key, &updated)?)
                .await?
            {
                return Ok(());
            }
        }
        tracing::warn!(key = %key, "Billing period update kept losing races");
        Err(StoreError::Contended { key })
    }
}

fn optional_write(key: String, value: Option<&str>) -> WriteOp {
    match value {
        Some(value) => WriteOp::set(key, value, None),
        None => WriteOp::del(key),
    }
}

#[async_trait]
impl BillingAccountStore for KvBillingAccountStore {
    async fn get(&self, user_id: UserId) -> StoreResult<Option<BillingAccount>> {
        let keys: Vec<String> = FIELDS.iter().map(|f| field_key(user_id, f)).collect();
        let values = self.kv.mget(&keys).await?;
        let field = |i: usize| values.get(i).cloned().flatten();
        let required = |i: usize| {
            field(i).ok_or_else(|| StoreError::Serialization {
                key: keys[i].clone(),
                reason: "account field missing".to_string(),
            })
        };

        let Some(profile) = field(0) else {
            return Ok(None);
        };
        let profile: Profile = decode(&keys[0], &profile)?;
        let plan: Plan = decode(&keys[5], &required(5)?)?;
        let period: PeriodUsage = decode(&keys[6], &required(6)?)?;

        Ok(Some(BillingAccount {
            user_id: profile.user_id,
            email: field(1).unwrap_or_default(),
            external_customer_id: field(2),
            subscription_id: field(3),
            subscription_item_id: field(4),
            price_id: plan.price_id,
            metric: profile.metric,
            quota_limit: plan.quota_limit,
            current_period_usage: period.usage,
            period: period.period,
        }))
    }

    async fn upsert(&self, account: BillingAccount) -> StoreResult<()> {
        let ops = Self::encode_fields(&account)?
            .into_iter()
            .map(|(key, value)| optional_write(key, value.as_deref()))
            .collect();
        self.kv.apply(ops).await
    }

    async fn insert_if_absent(&self, account: BillingAccount) -> StoreResult<BillingAccount> {
        if !self.exists(account.user_id).await? {
            let mut fields = Self::encode_fields(&account)?;
            // Profile goes last so readers never see a partial account.
            fields.rotate_left(1);
            for (key, value) in fields {
                if let Some(value) = value {
                    self.kv.set_nx(&key, &value, None).await?;
                }
            }
        }
        Ok(self.get(account.user_id).await?.unwrap_or(account))
    }

    async fn set_email_if_empty(
        &self,
        user_id: UserId,
        email: &str,
    ) -> StoreResult<Option<BillingAccount>> {
        if !self.exists(user_id).await? {
            return Ok(None);
        }
        if !email.is_empty() {
            self.kv.set_nx(&field_key(user_id, EMAIL), email, None).await?;
        }
        self.get(user_id).await
    }

    async fn set_customer_id(
        &self,
        user_id: UserId,
        customer_id: &str,
    ) -> StoreResult<Option<BillingAccount>> {
        if !self.exists(user_id).await? {
            return Ok(None);
        }
        self.kv
            .set_nx(&field_key(user_id, CUSTOMER), customer_id, None)
            .await?;
        self.get(user_id).await
    }

    async fn link_subscription(
        &self,
        user_id: UserId,
        subscription_id: &str,
        subscription_item_id: Option<&str>,
    ) -> StoreResult<Option<BillingAccount>> {
        if !self.exists(user_id).await? {
            return Ok(None);
        }
        self.kv
            .apply(vec![
                WriteOp::set(field_key(user_id, SUBSCRIPTION), subscription_id, None),
                optional_write(field_key(user_id, ITEM), subscription_item_id),
            ])
            .await?;
        self.get(user_id).await
    }

    async fn apply_subscription_state(
        &self,
        user_id: UserId,
        state: &SubscriptionState,
    ) -> StoreResult<Option<BillingAccount>> {
        if !self.exists(user_id).await? {
            return Ok(None);
        }
        let plan_key = field_key(user_id, PLAN);
        let plan = Plan {
            price_id: state.price_id.clone(),
            quota_limit: state.quota_limit,
        };
        self.kv
            .apply(vec![
                WriteOp::set(plan_key.clone(), encode(&plan_key, &plan)?, None),
                optional_write(
                    field_key(user_id, ITEM),
                    state.subscription_item_id.as_deref(),
                ),
            ])
            .await?;
        self.update_period(user_id, |current| {
            Some(PeriodUsage {
                period: state.period,
                usage: merged_usage(
                    &current.period,
                    current.usage,
                    &state.period,
                    state.period_usage,
                ),
            })
        })
        .await?;
        self.get(user_id).await
    }

    async fn roll_period(
        &self,
        user_id: UserId,
        from: &BillingPeriod,
        to: BillingPeriod,
        usage: u64,
    ) -> StoreResult<Option<BillingAccount>> {
        self.update_period(user_id, |current| {
            (current.period == *from).then_some(PeriodUsage { period: to, usage })
        })
        .await?;
        self.get(user_id).await
    }

    async fn set_period_usage(
        &self,
        user_id: UserId,
        period: &BillingPeriod,
        usage: u64,
    ) -> StoreResult<()> {
        self.update_period(user_id, |current| {
            (current.period == *period && current.usage < usage).then_some(PeriodUsage {
                period: current.period,
                usage,
            })
        })
        .await
    }

    async fn list(&self) -> StoreResult<Vec<BillingAccount>> {
        let pattern = format!("{}*:{}", ACCOUNT_PREFIX, PROFILE);
        let suffix = format!(":{}", PROFILE);
        let mut accounts = Vec::new();
        for key in self.kv.keys(&pattern).await? {
            let Some(user_id) = key
                .strip_prefix(ACCOUNT_PREFIX)
                .and_then(|rest| rest.strip_suffix(suffix.as_str()))
                .and_then(|id| id.parse::<UserId>().ok())
            else {
                continue;
            };
            if let Some(account) = self.get(user_id).await? {
                accounts.push(account);
            }
        }
        accounts.sort_by_key(|a| a.user_id);
        Ok(accounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use hearth_core::{EntityIdType, PriceTier};

    fn account(user_id: UserId) -> BillingAccount {
        BillingAccount::new(
            user_id,
            "user@example.com",
            &PriceTier::new("price_free", "free", 100),
            Utc::now(),
        )
    }

    fn stores() -> Vec<(&'static str, Arc<dyn BillingAccountStore>)> {
        vec![
            (
                "memory",
                Arc::new(InMemoryBillingAccountStore::new()) as Arc<dyn BillingAccountStore>,
            ),
            (
                "kv",
                Arc::new(KvBillingAccountStore::new(Arc::new(InMemoryKvStore::new())))
                    as Arc<dyn BillingAccountStore>,
            ),
        ]
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_first() {
        for (name, store) in stores() {
            let user = UserId::now_v7();
            let mut first = account(user);
            first.external_customer_id = Some("cus_1".to_string());
            store.insert_if_absent(first.clone()).await.unwrap();

            let kept = store.insert_if_absent(account(user)).await.unwrap();
            assert_eq!(kept, first, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_upsert_round_trips_every_field() {
        for (name, store) in stores() {
            let user = UserId::now_v7();
            let mut full = account(user);
            full.external_customer_id = Some("cus_1".to_string());
            full.subscription_id = Some("sub_1".to_string());
            full.subscription_item_id = Some("si_1".to_string());
            full.current_period_usage = 9;
            store.upsert(full.clone()).await.unwrap();
            assert_eq!(store.get(user).await.unwrap(), Some(full.clone()), "{}", name);

            let mut cleared = full;
            cleared.subscription_id = None;
            cleared.subscription_item_id = None;
            store.upsert(cleared.clone()).await.unwrap();
            assert_eq!(store.get(user).await.unwrap(), Some(cleared), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_customer_id_is_write_once() {
        for (name, store) in stores() {
            let user = UserId::now_v7();
            assert_eq!(store.set_customer_id(user, "cus_x").await.unwrap(), None);
            store.insert_if_absent(account(user)).await.unwrap();

            let first = store.set_customer_id(user, "cus_1").await.unwrap().unwrap();
            let second = store.set_customer_id(user, "cus_2").await.unwrap().unwrap();
            assert_eq!(first.external_customer_id.as_deref(), Some("cus_1"), "{}", name);
            assert_eq!(second.external_customer_id.as_deref(), Some("cus_1"), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_email_only_fills_empty() {
        for (name, store) in stores() {
            let user = UserId::now_v7();
            let mut blank = account(user);
            blank.email = String::new();
            store.insert_if_absent(blank).await.unwrap();

            let updated = store.set_email_if_empty(user, "a@example.com").await.unwrap();
            assert_eq!(updated.unwrap().email, "a@example.com", "{}", name);
            let kept = store.set_email_if_empty(user, "b@example.com").await.unwrap();
            assert_eq!(kept.unwrap().email, "a@example.com", "{}", name);
        }
    }

    #[tokio::test]
    async fn test_subscription_state_leaves_other_fields_alone() {
        for (name, store) in stores() {
            let user = UserId::now_v7();
            store.insert_if_absent(account(user)).await.unwrap();
            store.set_customer_id(user, "cus_1").await.unwrap();
            store.link_subscription(user, "sub_1", Some("si_1")).await.unwrap();

            let period = store.get(user).await.unwrap().unwrap().period;
            store.set_period_usage(user, &period, 12).await.unwrap();
            let state = SubscriptionState {
                price_id: "price_pro".to_string(),
                quota_limit: 5_000,
                period,
                subscription_item_id: Some("si_2".to_string()),
                period_usage: 10,
            };
            let after = store
                .apply_subscription_state(user, &state)
                .await
                .unwrap()
                .unwrap();

            assert_eq!(after.external_customer_id.as_deref(), Some("cus_1"), "{}", name);
            assert_eq!(after.subscription_id.as_deref(), Some("sub_1"), "{}", name);
            assert_eq!(after.subscription_item_id.as_deref(), Some("si_2"), "{}", name);
            assert_eq!((after.price_id.as_str(), after.quota_limit), ("price_pro", 5_000));
            // A snapshot older than the stored counter does not lower it.
            assert_eq!(after.current_period_usage, 12, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_period_usage_is_monotonic_and_period_scoped() {
        for (name, store) in stores() {
            let user = UserId::now_v7();
            let created = store.insert_if_absent(account(user)).await.unwrap();
            let current = created.period;
            let next = BillingPeriod::new(current.end, current.end + ChronoDuration::days(30));

            store.set_period_usage(user, &current, 5).await.unwrap();
            store.set_period_usage(user, &current, 3).await.unwrap();
            store.set_period_usage(user, &next, 50).await.unwrap();
            assert_eq!(store.get(user).await.unwrap().unwrap().current_period_usage, 5, "{}", name);

            let rolled = store.roll_period(user, &current, next, 0).await.unwrap().unwrap();
            assert_eq!((rolled.period, rolled.current_period_usage), (next, 0), "{}", name);

            // A second roll from the stale period is a no-op.
            let stale = store.roll_period(user, &current, current, 99).await.unwrap().unwrap();
            assert_eq!((stale.period, stale.current_period_usage), (next, 0), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        for (name, store) in stores() {
            let mut users = vec![UserId::now_v7(), UserId::now_v7(), UserId::now_v7()];
            for user in users.iter().rev() {
                store.insert_if_absent(account(*user)).await.unwrap();
            }
            users.sort();
            let listed: Vec<UserId> =
                store.list().await.unwrap().into_iter().map(|a| a.user_id).collect();
            assert_eq!(listed, users, "{}", name);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_field_writers_on_kv() {
        let store = Arc::new(KvBillingAccountStore::new(Arc::new(InMemoryKvStore::new())));
        let user = UserId::now_v7();
        let period = store.insert_if_absent(account(user)).await.unwrap().period;

        let mut tasks = Vec::new();
        for i in 1..=20u64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.set_period_usage(user, &period, i).await
            }));
        }
        let store_c = store.clone();
        tasks.push(tokio::spawn(async move {
            store_c.set_customer_id(user, "cus_1").await.map(|_| ())
        }));
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let account = store.get(user).await.unwrap().unwrap();
        assert_eq!(account.current_period_usage, 20);
        assert_eq!(account.external_customer_id.as_deref(), Some("cus_1"));
    }
}
