//! Reconciliation of local usage with the billing provider.

use chrono::Duration as ChronoDuration;
use hearth_core::{
    BillingAccount, BillingError, BillingResult, Subscription, SubscriptionItem,
    SubscriptionItemUpdate, Timestamp, UsageAction, UsageMetric, UsageRecord, UserId,
};
use hearth_storage::SubscriptionState;
use serde::{Deserialize, Serialize};

use super::{usage_lock, usage_tag, BillingContext};
use crate::telemetry::metrics::with_metrics;

/// Result of one user's usage sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SyncOutcome {
    /// The provider now holds `quantity` for the current period.
    Reported { quantity: u64 },
    /// Another sync for this user holds the lock.
    LockBusy,
    /// The account has no subscription to report against.
    NoSubscription,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub accounts: u64,
    pub reported: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct SubscriptionSync {
    ctx: BillingContext,
}

/// Provider timestamps must fall inside the period being reported.
fn report_timestamp(now: Timestamp, start: Timestamp, end: Timestamp) -> Timestamp {
    let last = end - ChronoDuration::seconds(1);
    now.min(last).max(start)
}

impl SubscriptionSync {
    pub fn new(ctx: BillingContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &BillingContext {
        &self.ctx
    }

    /// Report the user's current-period total with "set" semantics.
    ///
    /// Runs under the per-user usage lock; a busy lock is not an error.
    pub async fn sync_subscription_usage(&self, user_id: UserId) -> BillingResult<SyncOutcome> {
        self.ctx.provider()?;
        let outcome = self
            .ctx
            .lock
            .with_lock(&usage_lock(user_id), self.ctx.lock_ttl, || {
                self.sync_locked(user_id)
            })
            .await?;

        match outcome {
            Some(result) => {
                let label = match &result {
                    Ok(SyncOutcome::Reported { .. }) => "reported",
                    Ok(_) => "skipped",
                    Err(_) => "failed",
                };
                with_metrics(|m| m.record_usage_report(label));
                result
            }
            None => {
                tracing::debug!(user_id = %user_id, "Usage sync already running for user");
                with_metrics(|m| m.record_usage_report("lock_busy"));
                Ok(SyncOutcome::LockBusy)
            }
        }
    }

    async fn sync_locked(&self, user_id: UserId) -> BillingResult<SyncOutcome> {
        let provider = self.ctx.provider()?;
        let now = self.ctx.clock.now();
        let account = self
            .ctx
            .accounts
            .get(user_id)
            .await?
            .ok_or(BillingError::AccountMissing { user_id })?;
        let Some(subscription_id) = account.subscription_id.as_deref() else {
            return Ok(SyncOutcome::NoSubscription);
        };

        let subscription = provider.retrieve_subscription(subscription_id).await?;
        let item = subscription
            .metered_item(account.subscription_item_id.as_deref())
            .ok_or(BillingError::SubscriptionMissing { user_id })?;

        let quota_limit = if item.price_id == account.price_id {
            account.quota_limit
        } else {
            let quota = self.quota_for(&item.price_id)?;
            tracing::info!(
                user_id = %user_id,
                old_price = %account.price_id,
                new_price = %item.price_id,
                quota,
                "Subscription price changed at provider"
            );
            quota
        };

        let period = subscription.period;
        let quantity = self
            .ctx
            .ledger
            .period_total(user_id, account.metric, &period)
            .await?;
        let record = UsageRecord {
            quantity,
            timestamp: report_timestamp(now, period.start, period.end),
            action: UsageAction::Set,
        };
        let receipt = provider.create_usage_record(&item.id, &record).await?;

        self.ctx
            .ledger
            .mark_reported(user_id, account.metric, &period, quantity, now)
            .await?;
        let state = SubscriptionState {
            price_id: item.price_id.clone(),
            quota_limit,
            period,
            subscription_item_id: Some(item.id.clone()),
            period_usage: quantity,
        };
        self.ctx.accounts.apply_subscription_state(user_id, &state).await?;
        self.ctx.cache.invalidate_by_tag(&usage_tag(user_id)).await;

        tracing::info!(
            user_id = %user_id,
            subscription_item_id = %item.id,
            usage_record_id = %receipt.id,
            quantity,
            "Usage reported"
        );
        Ok(SyncOutcome::Reported { quantity })
    }

    fn quota_for(&self, price_id: &str) -> BillingResult<u64> {
        self.ctx
            .prices
            .quota_for(price_id)
            .ok_or_else(|| BillingError::UnknownPrice {
                price_id: price_id.to_string(),
            })
    }

    /// Adopt `subscription` for the user, keeping every field the provider
    /// does not own.
    async fn adopt(
        &self,
        user_id: UserId,
        metric: UsageMetric,
        subscription: &Subscription,
        item: &SubscriptionItem,
    ) -> BillingResult<BillingAccount> {
        let quota_limit = self.quota_for(&item.price_id)?;
        let period_usage = self
            .ctx
            .ledger
            .period_total(user_id, metric, &subscription.period)
            .await?;
        let state = SubscriptionState {
            price_id: item.price_id.clone(),
            quota_limit,
            period: subscription.period,
            subscription_item_id: Some(item.id.clone()),
            period_usage,
        };
        let account = self
            .ctx
            .accounts
            .apply_subscription_state(user_id, &state)
            .await?
            .ok_or(BillingError::AccountMissing { user_id })?;
        self.ctx.cache.invalidate_by_tag(&usage_tag(user_id)).await;
        Ok(account)
    }

    /// Attach the provider subscription `subscription_id` to the user's
    /// account and adopt its price, quota and period.
    ///
    /// The account must already exist, which it does once the user has
    /// recorded usage or resolved a customer.
    pub async fn link_subscription(
        &self,
        user_id: UserId,
        subscription_id: &str,
    ) -> BillingResult<BillingAccount> {
        let provider = self.ctx.provider()?.clone();

        let linked = self
            .ctx
            .lock
            .with_lock(&usage_lock(user_id), self.ctx.lock_ttl, || async {
                let account = self
                    .ctx
                    .accounts
                    .get(user_id)
                    .await?
                    .ok_or(BillingError::AccountMissing { user_id })?;

                let subscription = provider.retrieve_subscription(subscription_id).await?;
                let item = subscription
                    .metered_item(None)
                    .ok_or(BillingError::SubscriptionMissing { user_id })?;
                self.quota_for(&item.price_id)?;

                self.ctx
                    .accounts
                    .link_subscription(user_id, &subscription.id, Some(&item.id))
                    .await?;
                self.adopt(user_id, account.metric, &subscription, item).await
            })
            .await?;

        let account = linked.ok_or(BillingError::Busy { user_id })??;
        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            price_id = %account.price_id,
            "Subscription linked"
        );
        Ok(account)
    }

    /// Move the metered item to `price_id`. The provider prorates; the new
    /// quota and period apply locally once it accepts.
    pub async fn change_price_tier(
        &self,
        user_id: UserId,
        price_id: &str,
    ) -> BillingResult<BillingAccount> {
        let tier = self
            .ctx
            .prices
            .find(price_id)
            .ok_or_else(|| BillingError::UnknownPrice {
                price_id: price_id.to_string(),
            })?
            .clone();
        let provider = self.ctx.provider()?.clone();

        let changed = self
            .ctx
            .lock
            .with_lock(&usage_lock(user_id), self.ctx.lock_ttl, || async {
                let account = self
                    .ctx
                    .accounts
                    .get(user_id)
                    .await?
                    .ok_or(BillingError::AccountMissing { user_id })?;
                let subscription_id = account
                    .subscription_id
                    .as_deref()
                    .ok_or(BillingError::SubscriptionMissing { user_id })?;

                let current = provider.retrieve_subscription(subscription_id).await?;
                let item_id = current
                    .metered_item(account.subscription_item_id.as_deref())
                    .ok_or(BillingError::SubscriptionMissing { user_id })?
                    .id
                    .clone();

                let updated = provider
                    .update_subscription(
                        subscription_id,
                        &[SubscriptionItemUpdate {
                            id: item_id.clone(),
                            price_id: tier.price_id.clone(),
                        }],
                    )
                    .await?;
                let item = updated
                    .metered_item(Some(&item_id))
                    .or_else(|| updated.metered_item(None))
                    .ok_or(BillingError::SubscriptionMissing { user_id })?;

                self.adopt(user_id, account.metric, &updated, item).await
            })
            .await?;

        let account = changed.ok_or(BillingError::Busy { user_id })??;
        tracing::info!(
            user_id = %user_id,
            price_id = %account.price_id,
            quota = account.quota_limit,
            "Price tier changed"
        );
        Ok(account)
    }

    /// Sync every account. Failures are logged per user and do not stop the
    /// loop.
    pub async fn sync_all(&self) -> BillingResult<SyncReport> {
        let accounts = self.ctx.accounts.list().await?;
        let mut report = SyncReport {
            accounts: accounts.len() as u64,
            ..SyncReport::default()
        };

        for account in accounts {
            match self.sync_subscription_usage(account.user_id).await {
                Ok(SyncOutcome::Reported { .. }) => report.reported += 1,
                Ok(SyncOutcome::LockBusy) | Ok(SyncOutcome::NoSubscription) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        user_id = %account.user_id,
                        error = %e,
                        "Usage sync failed for user"
                    );
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_report_timestamp_is_clamped_into_period() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        let mid = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 2, 3, 0, 0, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2023, 12, 3, 0, 0, 0).unwrap();

        assert_eq!(report_timestamp(mid, start, end), mid);
        assert_eq!(report_timestamp(after, start, end), end - ChronoDuration::seconds(1));
        assert_eq!(report_timestamp(before, start, end), start);
    }

    #[test]
    fn test_outcome_wire_format() {
        let json = serde_json::to_value(SyncOutcome::Reported { quantity: 7 }).unwrap();
        assert_eq!(json, serde_json::json!({ "outcome": "reported", "quantity": 7 }));
        let json = serde_json::to_value(SyncOutcome::LockBusy).unwrap();
        assert_eq!(json, serde_json::json!({ "outcome": "lock_busy" }));
    }
}
