//! Billing domain types and the billing provider seam.
//!
//! The application owns ledger entries and billing accounts; the provider only
//! ever sees the external customer id, subscription ids and reported
//! quantities.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{BillingResult, PeriodError, Timestamp, UserId};

/// Default billing period length used until the provider reports one.
pub const DEFAULT_PERIOD_DAYS: i64 = 30;

// ============================================================================
// METRICS
// ============================================================================

/// A metered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageMetric {
    /// LLM tokens consumed by agent runs
    Tokens,
    /// Agent executions started
    Executions,
}

impl UsageMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageMetric::Tokens => "tokens",
            UsageMetric::Executions => "executions",
        }
    }
}

impl fmt::Display for UsageMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tokens" => Ok(UsageMetric::Tokens),
            "executions" => Ok(UsageMetric::Executions),
            other => Err(format!("unknown usage metric: {}", other)),
        }
    }
}

// ============================================================================
// PERIODS
// ============================================================================

/// Half-open billing period `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl BillingPeriod {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// A default-length period starting at `now`.
    pub fn starting_at(now: Timestamp) -> Self {
        Self {
            start: now,
            end: now + ChronoDuration::days(DEFAULT_PERIOD_DAYS),
        }
    }

    pub fn contains(&self, at: Timestamp) -> bool {
        at >= self.start && at < self.end
    }

    pub fn length(&self) -> ChronoDuration {
        self.end - self.start
    }

    /// Advance period-by-period until `now` falls inside.
    ///
    /// Periods shorter than a millisecond are replaced by a default period
    /// starting at `now`. Fails when the rolled period would not fit in a
    /// timestamp.
    pub fn roll_forward(&self, now: Timestamp) -> Result<Self, PeriodError> {
        let length = self.length();
        let length_ms = length.num_milliseconds();
        if length_ms <= 0 {
            return Ok(Self::starting_at(now));
        }
        if now < self.end {
            return Ok(*self);
        }
        let overflow = || PeriodError::Overflow { end: self.end, now };

        let skipped = (now - self.end).num_milliseconds() / length_ms;
        let skipped = i32::try_from(skipped).map_err(|_| overflow())?;
        let start = length
            .checked_mul(skipped)
            .and_then(|offset| self.end.checked_add_signed(offset))
            .ok_or_else(overflow)?;
        let end = start.checked_add_signed(length).ok_or_else(overflow)?;
        Ok(Self { start, end })
    }
}

// ============================================================================
// LEDGER + ACCOUNTS
// ============================================================================

/// Local consumption of one metric by one user within one billing period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLedgerEntry {
    pub user_id: UserId,
    pub metric: UsageMetric,
    /// Monotonically increasing within the period.
    pub quantity: u64,
    pub period: BillingPeriod,
    /// Quantity most recently acknowledged by the billing provider.
    pub last_reported_quantity: u64,
    pub updated_at: Timestamp,
}

impl UsageLedgerEntry {
    pub fn new(user_id: UserId, metric: UsageMetric, period: BillingPeriod, now: Timestamp) -> Self {
        Self {
            user_id,
            metric,
            quantity: 0,
            period,
            last_reported_quantity: 0,
            updated_at: now,
        }
    }

    /// Consumption not yet acknowledged by the provider.
    pub fn unreported(&self) -> u64 {
        self.quantity.saturating_sub(self.last_reported_quantity)
    }
}

/// A user's billing state as owned by the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingAccount {
    pub user_id: UserId,
    pub email: String,
    /// Created lazily; the only identifier shared with the provider.
    pub external_customer_id: Option<String>,
    pub subscription_id: Option<String>,
    /// The metered subscription item usage is reported against.
    pub subscription_item_id: Option<String>,
    pub price_id: String,
    pub metric: UsageMetric,
    pub quota_limit: u64,
    pub current_period_usage: u64,
    pub period: BillingPeriod,
}

impl BillingAccount {
    pub fn new(user_id: UserId, email: impl Into<String>, tier: &PriceTier, now: Timestamp) -> Self {
        Self {
            user_id,
            email: email.into(),
            external_customer_id: None,
            subscription_id: None,
            subscription_item_id: None,
            price_id: tier.price_id.clone(),
            metric: UsageMetric::Executions,
            quota_limit: tier.quota_limit,
            current_period_usage: 0,
            period: BillingPeriod::starting_at(now),
        }
    }

    pub fn quota_status(&self) -> QuotaStatus {
        QuotaStatus::new(self.quota_limit, self.current_period_usage)
    }
}

/// Quota view for one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub exceeded: bool,
}

impl QuotaStatus {
    pub fn new(limit: u64, used: u64) -> Self {
        Self {
            limit,
            used,
            remaining: limit.saturating_sub(used),
            exceeded: used >= limit,
        }
    }
}

// ============================================================================
// PRICE TABLE
// ============================================================================

/// A subscription price and the quota it grants per period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTier {
    pub price_id: String,
    pub name: String,
    pub quota_limit: u64,
}

impl PriceTier {
    pub fn new(price_id: impl Into<String>, name: impl Into<String>, quota_limit: u64) -> Self {
        Self {
            price_id: price_id.into(),
            name: name.into(),
            quota_limit,
        }
    }
}

/// Static price → quota table. The first tier is the default for new accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTable {
    tiers: Vec<PriceTier>,
}

impl PriceTable {
    /// Build a table; returns `None` when no tiers are given.
    pub fn new(tiers: Vec<PriceTier>) -> Option<Self> {
        if tiers.is_empty() {
            None
        } else {
            Some(Self { tiers })
        }
    }

    pub fn find(&self, price_id: &str) -> Option<&PriceTier> {
        self.tiers.iter().find(|t| t.price_id == price_id)
    }

    pub fn quota_for(&self, price_id: &str) -> Option<u64> {
        self.find(price_id).map(|t| t.quota_limit)
    }

    pub fn default_tier(&self) -> &PriceTier {
        &self.tiers[0]
    }

    pub fn tiers(&self) -> &[PriceTier] {
        &self.tiers
    }
}

// ============================================================================
// PROVIDER OBJECTS
// ============================================================================

/// How the provider applies a reported quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageAction {
    /// Replace the recorded quantity (idempotent).
    Set,
    /// Add to the recorded quantity.
    Increment,
}

impl UsageAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageAction::Set => "set",
            UsageAction::Increment => "increment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub quantity: u64,
    pub timestamp: Timestamp,
    pub action: UsageAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecordReceipt {
    pub id: String,
    pub subscription_item_id: String,
    pub quantity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: String,
    pub price_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub status: String,
    pub items: Vec<SubscriptionItem>,
    pub period: BillingPeriod,
}

impl Subscription {
    /// The item with the given id, falling back to the first item.
    pub fn metered_item(&self, item_id: Option<&str>) -> Option<&SubscriptionItem> {
        match item_id {
            Some(id) => self.items.iter().find(|i| i.id == id),
            None => self.items.first(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionItemUpdate {
    pub id: String,
    pub price_id: String,
}

/// External billing provider.
///
/// `create_customer` is not idempotent on its own; callers pass a stable
/// idempotency key and serialize creation per user.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn create_customer(
        &self,
        user_id: UserId,
        email: &str,
        idempotency_key: &str,
    ) -> BillingResult<String>;

    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<Subscription>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        items: &[SubscriptionItemUpdate],
    ) -> BillingResult<Subscription>;

    async fn create_usage_record(
        &self,
        subscription_item_id: &str,
        record: &UsageRecord,
    ) -> BillingResult<UsageRecordReceipt>;
}
