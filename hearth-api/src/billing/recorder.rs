//! Local usage recording, quota checks and customer resolution.

use hearth_core::{
    BillingAccount, BillingError, BillingPeriod, BillingResult, QuotaStatus, StoreResult,
    UsageLedgerEntry, UsageMetric, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{customer_cache_key, customer_lock, usage_summary_key, usage_tag, BillingContext};

/// Cached usage and quota view of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub user_id: UserId,
    pub price_id: String,
    pub tier: Option<String>,
    pub metric: UsageMetric,
    pub period: BillingPeriod,
    pub quota: QuotaStatus,
    /// Current-period totals keyed by metric name.
    pub totals: BTreeMap<String, u64>,
    pub customer_linked: bool,
}

#[derive(Clone)]
pub struct UsageRecorder {
    ctx: BillingContext,
}

impl UsageRecorder {
    pub fn new(ctx: BillingContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &BillingContext {
        &self.ctx
    }

    /// The user's account, created on the default tier when absent. A
    /// non-empty `email` replaces an empty stored one.
    pub async fn ensure_account(&self, user_id: UserId, email: &str) -> StoreResult<BillingAccount> {
        let now = self.ctx.clock.now();
        let fresh = BillingAccount::new(user_id, email, self.ctx.prices.default_tier(), now);
        let account = self.ctx.accounts.insert_if_absent(fresh).await?;
        if account.email.is_empty() && !email.is_empty() {
            if let Some(updated) = self.ctx.accounts.set_email_if_empty(user_id, email).await? {
                return Ok(updated);
            }
        }
        Ok(account)
    }

    /// The account with its period rolled forward to contain now.
    async fn current_account(&self, user_id: UserId) -> StoreResult<BillingAccount> {
        let now = self.ctx.clock.now();
        let account = self.ensure_account(user_id, "").await?;
        let period = match account.period.roll_forward(now) {
            Ok(period) => period,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Restarting billing period");
                BillingPeriod::starting_at(now)
            }
        };
        if period == account.period {
            return Ok(account);
        }

        tracing::info!(
            user_id = %user_id,
            period_start = %period.start,
            period_end = %period.end,
            "Billing period rolled forward"
        );
        let usage = self
            .ctx
            .ledger
            .period_total(user_id, account.metric, &period)
            .await?;
        let rolled = self
            .ctx
            .accounts
            .roll_period(user_id, &account.period, period, usage)
            .await?;
        Ok(rolled.unwrap_or(BillingAccount {
            period,
            current_period_usage: usage,
            ..account
        }))
    }

    /// Add `quantity` of `metric` to the current period. Never calls the
    /// billing provider.
    pub async fn record_usage(
        &self,
        user_id: UserId,
        metric: UsageMetric,
        quantity: u64,
    ) -> StoreResult<UsageLedgerEntry> {
        let account = self.current_account(user_id).await?;
        let entry = self
            .ctx
            .ledger
            .append(user_id, metric, quantity, account.period, self.ctx.clock.now())
            .await?;
        if metric == account.metric {
            self.ctx
                .accounts
                .set_period_usage(user_id, &account.period, entry.quantity)
                .await?;
        }
        self.ctx.cache.invalidate_by_tag(&usage_tag(user_id)).await;

        tracing::debug!(
            user_id = %user_id,
            metric = %metric,
            quantity,
            period_total = entry.quantity,
            "Usage recorded"
        );
        Ok(entry)
    }

    /// Quota of the account's billed metric, from the ledger.
    pub async fn check_quota(&self, user_id: UserId) -> StoreResult<QuotaStatus> {
        let account = self.current_account(user_id).await?;
        let used = self
            .ctx
            .ledger
            .period_total(user_id, account.metric, &account.period)
            .await?;
        Ok(QuotaStatus::new(account.quota_limit, used))
    }

    pub async fn usage_summary(&self, user_id: UserId) -> StoreResult<UsageSummary> {
        let key = usage_summary_key(user_id);
        if let Some(summary) = self.ctx.cache.get_with_stats::<UsageSummary>(&key).await {
            return Ok(summary);
        }

        let account = self.current_account(user_id).await?;
        let mut totals = BTreeMap::new();
        for metric in [UsageMetric::Executions, UsageMetric::Tokens] {
            let total = self
                .ctx
                .ledger
                .period_total(user_id, metric, &account.period)
                .await?;
            totals.insert(metric.as_str().to_string(), total);
        }
        let used = totals.get(account.metric.as_str()).copied().unwrap_or(0);

        let summary = UsageSummary {
            user_id,
            tier: self.ctx.prices.find(&account.price_id).map(|t| t.name.clone()),
            price_id: account.price_id,
            metric: account.metric,
            period: account.period,
            quota: QuotaStatus::new(account.quota_limit, used),
            totals,
            customer_linked: account.external_customer_id.is_some(),
        };
        self.ctx
            .cache
            .set_with_tags(
                &key,
                &summary,
                &[usage_tag(user_id)],
                Some(self.ctx.usage_summary_ttl),
            )
            .await;
        Ok(summary)
    }

    /// Provider customer id of `user_id`, created on first use.
    ///
    /// Lookup order is cache, persisted account, then creation under the
    /// per-user customer lock. Creation re-checks the account after taking the
    /// lock and passes a stable idempotency key.
    pub async fn resolve_customer(&self, user_id: UserId, email: &str) -> BillingResult<String> {
        let cache_key = customer_cache_key(user_id);
        if let Some(customer_id) = self.ctx.cache.get::<String>(&cache_key).await {
            return Ok(customer_id);
        }

        let account = self.ensure_account(user_id, email).await?;
        if let Some(customer_id) = account.external_customer_id {
            self.cache_customer(user_id, &customer_id).await;
            return Ok(customer_id);
        }

        let provider = self.ctx.provider()?.clone();
        let created = self
            .ctx
            .lock
            .with_lock(&customer_lock(user_id), self.ctx.lock_ttl, || async {
                let account = self.ensure_account(user_id, email).await?;
                if let Some(existing) = account.external_customer_id {
                    return Ok(existing);
                }
                let idempotency_key = format!("customer-{}", user_id);
                let customer_id = provider
                    .create_customer(user_id, &account.email, &idempotency_key)
                    .await?;
                let stored = self
                    .ctx
                    .accounts
                    .set_customer_id(user_id, &customer_id)
                    .await?
                    .and_then(|account| account.external_customer_id);
                Ok::<String, BillingError>(stored.unwrap_or(customer_id))
            })
            .await?;

        let customer_id = match created {
            Some(result) => result?,
            None => {
                tracing::debug!(user_id = %user_id, "Customer creation already in progress");
                return Err(BillingError::Busy { user_id });
            }
        };
        self.cache_customer(user_id, &customer_id).await;
        self.ctx.cache.invalidate_by_tag(&usage_tag(user_id)).await;
        Ok(customer_id)
    }

    async fn cache_customer(&self, user_id: UserId, customer_id: &str) {
        self.ctx
            .cache
            .set(
                &customer_cache_key(user_id),
                customer_id,
                Some(self.ctx.customer_cache_ttl),
            )
            .await;
    }
}
