//! Local usage ledger.
//!
//! One entry per (user, metric, period start). Appends are atomic per entry;
//! quantities only grow within a period.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use dashmap::DashMap;
use hearth_core::{
    BillingPeriod, StoreError, StoreResult, Timestamp, UsageLedgerEntry, UsageMetric, UserId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::kv::KeyValueStore;

type LedgerKey = (UserId, UsageMetric, Timestamp);

#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Add `quantity` to the entry for `period`, creating it when absent.
    async fn append(
        &self,
        user_id: UserId,
        metric: UsageMetric,
        quantity: u64,
        period: BillingPeriod,
        now: Timestamp,
    ) -> StoreResult<UsageLedgerEntry>;

    async fn entry(
        &self,
        user_id: UserId,
        metric: UsageMetric,
        period: &BillingPeriod,
    ) -> StoreResult<Option<UsageLedgerEntry>>;

    /// Total consumption of `metric` in `period` (0 when nothing recorded).
    async fn period_total(
        &self,
        user_id: UserId,
        metric: UsageMetric,
        period: &BillingPeriod,
    ) -> StoreResult<u64> {
        Ok(self
            .entry(user_id, metric, period)
            .await?
            .map(|e| e.quantity)
            .unwrap_or(0))
    }

    /// Record the quantity the provider acknowledged for `period`.
    async fn mark_reported(
        &self,
        user_id: UserId,
        metric: UsageMetric,
        period: &BillingPeriod,
        quantity: u64,
        now: Timestamp,
    ) -> StoreResult<()>;

    /// All entries of one user, oldest period first.
    async fn entries_for_user(&self, user_id: UserId) -> StoreResult<Vec<UsageLedgerEntry>>;
}

#[derive(Debug, Default)]
pub struct InMemoryUsageLedger {
    entries: DashMap<LedgerKey, UsageLedgerEntry>,
}

impl InMemoryUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageLedger for InMemoryUsageLedger {
    async fn append(
        &self,
        user_id: UserId,
        metric: UsageMetric,
        quantity: u64,
        period: BillingPeriod,
        now: Timestamp,
    ) -> StoreResult<UsageLedgerEntry> {
        let mut entry = self
            .entries
            .entry((user_id, metric, period.start))
            .or_insert_with(|| UsageLedgerEntry::new(user_id, metric, period, now));
        entry.quantity = entry.quantity.saturating_add(quantity);
        entry.updated_at = now;
        Ok(entry.clone())
    }

    async fn entry(
        &self,
        user_id: UserId,
        metric: UsageMetric,
        period: &BillingPeriod,
    ) -> StoreResult<Option<UsageLedgerEntry>> {
        Ok(self
            .entries
            .get(&(user_id, metric, period.start))
            .map(|e| e.clone()))
    }

    async fn mark_reported(
        &self,
        user_id: UserId,
        metric: UsageMetric,
        period: &BillingPeriod,
        quantity: u64,
        now: Timestamp,
    ) -> StoreResult<()> {
        let mut entry = self
            .entries
            .entry((user_id, metric, period.start))
            .or_insert_with(|| UsageLedgerEntry::new(user_id, metric, *period, now));
        entry.last_reported_quantity = quantity;
        entry.updated_at = now;
        Ok(())
    }

    async fn entries_for_user(&self, user_id: UserId) -> StoreResult<Vec<UsageLedgerEntry>> {
        let mut entries: Vec<UsageLedgerEntry> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == user_id)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by_key(|e| (e.period.start, e.metric));
        Ok(entries)
    }
}

// ============================================================================
// KEY-VALUE STORE
// ============================================================================

/// Store key prefix of ledger entries:
/// `billing:ledger:<user>:<metric>:<period start ms>:<field>`.
pub const LEDGER_PREFIX: &str = "billing:ledger:";

const META: &str = "meta";
const QUANTITY: &str = "quantity";
const REPORTED: &str = "reported";
const UPDATED: &str = "updated";

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    user_id: UserId,
    metric: UsageMetric,
    period: BillingPeriod,
}

fn entry_key(user_id: UserId, metric: UsageMetric, period: &BillingPeriod, field: &str) -> String {
    format!(
        "{}{}:{}:{}:{}",
        LEDGER_PREFIX,
        user_id,
        metric,
        period.start.timestamp_millis(),
        field
    )
}

fn parse_u64(key: &str, raw: Option<String>) -> StoreResult<u64> {
    match raw {
        None => Ok(0),
        Some(raw) => raw.parse().map_err(|_| StoreError::NotAnInteger {
            key: key.to_string(),
        }),
    }
}

/// Ledger kept in the shared key-value store, so every API instance appends
/// to and reports from the same totals.
///
/// Quantities grow with `INCRBY`; the entry's period lives in a write-once
/// metadata key.
#[derive(Clone)]
pub struct KvUsageLedger {
    kv: Arc<dyn KeyValueStore>,
}

impl KvUsageLedger {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    async fn ensure_meta(
        &self,
        user_id: UserId,
        metric: UsageMetric,
        period: &BillingPeriod,
    ) -> StoreResult<()> {
        let key = entry_key(user_id, metric, period, META);
        let meta = EntryMeta {
            user_id,
            metric,
            period: *period,
        };
        let raw = serde_json::to_string(&meta).map_err(|e| StoreError::Serialization {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.kv.set_nx(&key, &raw, None).await?;
        Ok(())
    }

    async fn load(&self, meta_key: &str, meta: EntryMeta) -> StoreResult<UsageLedgerEntry> {
        let base = meta_key.strip_suffix(META).unwrap_or(meta_key);
        let keys = vec![
            format!("{}{}", base, QUANTITY),
            format!("{}{}", base, REPORTED),
            format!("{}{}", base, UPDATED),
        ];
        let mut values = self.kv.mget(&keys).await?.into_iter();
        let quantity = parse_u64(&keys[0], values.next().flatten())?;
        let last_reported_quantity = parse_u64(&keys[1], values.next().flatten())?;
        let updated_ms = parse_u64(&keys[2], values.next().flatten())?;
        let updated_at = i64::try_from(updated_ms)
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or(meta.period.start);

        Ok(UsageLedgerEntry {
            user_id: meta.user_id,
            metric: meta.metric,
            quantity,
            period: meta.period,
            last_reported_quantity,
            updated_at,
        })
    }

    async fn touch(
        &self,
        user_id: UserId,
        metric: UsageMetric,
        period: &BillingPeriod,
        now: Timestamp,
    ) -> StoreResult<()> {
        self.kv
            .set(
                &entry_key(user_id, metric, period, UPDATED),
                &now.timestamp_millis().max(0).to_string(),
                None,
            )
            .await
    }
}

#[async_trait]
impl UsageLedger for KvUsageLedger {
    async fn append(
        &self,
        user_id: UserId,
        metric: UsageMetric,
        quantity: u64,
        period: BillingPeriod,
        now: Timestamp,
    ) -> StoreResult<UsageLedgerEntry> {
        let quantity_key = entry_key(user_id, metric, &period, QUANTITY);
        let delta = i64::try_from(quantity).map_err(|_| StoreError::NotAnInteger {
            key: quantity_key.clone(),
        })?;

        self.ensure_meta(user_id, metric, &period).await?;
        let total = self.kv.incr_by(&quantity_key, delta).await?;
        self.touch(user_id, metric, &period, now).await?;
        let reported_key = entry_key(user_id, metric, &period, REPORTED);
        let last_reported_quantity = parse_u64(&reported_key, self.kv.get(&reported_key).await?)?;

        Ok(UsageLedgerEntry {
            user_id,
            metric,
            quantity: u64::try_from(total).map_err(|_| StoreError::NotAnInteger {
                key: quantity_key,
            })?,
            period,
            last_reported_quantity,
            updated_at: now,
        })
    }

    async fn entry(
        &self,
        user_id: UserId,
        metric: UsageMetric,
        period: &BillingPeriod,
    ) -> StoreResult<Option<UsageLedgerEntry>> {
        let meta_key = entry_key(user_id, metric, period, META);
        let Some(raw) = self.kv.get(&meta_key).await? else {
            return Ok(None);
        };
        let meta: EntryMeta = serde_json::from_str(&raw).map_err(|e| StoreError::Serialization {
            key: meta_key.clone(),
            reason: e.to_string(),
        })?;
        self.load(&meta_key, meta).await.map(Some)
    }

    async fn mark_reported(
        &self,
        user_id: UserId,
        metric: UsageMetric,
        period: &BillingPeriod,
        quantity: u64,
        now: Timestamp,
    ) -> StoreResult<()> {
        self.ensure_meta(user_id, metric, period).await?;
        self.kv
            .set(
                &entry_key(user_id, metric, period, REPORTED),
                &quantity.to_string(),
                None,
            )
            .await?;
        self.touch(user_id, metric, period, now).await
    }

    async fn entries_for_user(&self, user_id: UserId) -> StoreResult<Vec<UsageLedgerEntry>> {
        let pattern = format!("{}{}:*:{}", LEDGER_PREFIX, user_id, META);
        let keys = self.kv.keys(&pattern).await?;
        let metas = self.kv.mget(&keys).await?;

        let mut entries = Vec::new();
        for (key, raw) in keys.into_iter().zip(metas) {
            let Some(raw) = raw else {
                continue;
            };
            let meta: EntryMeta =
                serde_json::from_str(&raw).map_err(|e| StoreError::Serialization {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            entries.push(self.load(&key, meta).await?);
        }
        entries.sort_by_key(|e| (e.period.start, e.metric));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;
    use chrono::Duration as ChronoDuration;
    use hearth_core::EntityIdType;

    fn kv_ledger() -> KvUsageLedger {
        KvUsageLedger::new(Arc::new(InMemoryKvStore::new()))
    }

    #[tokio::test]
    async fn test_append_accumulates_per_period() {
        let ledger = InMemoryUsageLedger::new();
        let user = UserId::now_v7();
        let now = Utc::now();
        let current = BillingPeriod::starting_at(now);
        let next = BillingPeriod::starting_at(current.end);

        ledger.append(user, UsageMetric::Tokens, 10, current, now).await.unwrap();
        let entry = ledger.append(user, UsageMetric::Tokens, 5, current, now).await.unwrap();
        assert_eq!(entry.quantity, 15);

        ledger.append(user, UsageMetric::Tokens, 7, next, now).await.unwrap();
        ledger.append(user, UsageMetric::Executions, 1, current, now).await.unwrap();

        assert_eq!(ledger.period_total(user, UsageMetric::Tokens, &current).await.unwrap(), 15);
        assert_eq!(ledger.period_total(user, UsageMetric::Tokens, &next).await.unwrap(), 7);
        assert_eq!(ledger.entries_for_user(user).await.unwrap().len(), 3);
        assert_eq!(
            ledger
                .period_total(UserId::now_v7(), UsageMetric::Tokens, &current)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_mark_reported_keeps_quantity() {
        let ledger = InMemoryUsageLedger::new();
        let user = UserId::now_v7();
        let now = Utc::now();
        let period = BillingPeriod::starting_at(now);

        ledger.append(user, UsageMetric::Executions, 4, period, now).await.unwrap();
        ledger
            .mark_reported(user, UsageMetric::Executions, &period, 4, now + ChronoDuration::minutes(1))
            .await
            .unwrap();
        let entry = ledger
            .entry(user, UsageMetric::Executions, &period)
            .await
            .unwrap()
            .unwrap();
        assert_eq!((entry.quantity, entry.last_reported_quantity), (4, 4));
        assert_eq!(entry.unreported(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_are_not_lost() {
        let ledger = Arc::new(InMemoryUsageLedger::new());
        let user = UserId::now_v7();
        let now = Utc::now();
        let period = BillingPeriod::starting_at(now);

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger.append(user, UsageMetric::Tokens, 2, period, now).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(ledger.period_total(user, UsageMetric::Tokens, &period).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_kv_ledger_accumulates_per_period() {
        let ledger = kv_ledger();
        let user = UserId::now_v7();
        let now = Utc::now();
        let current = BillingPeriod::starting_at(now);
        let next = BillingPeriod::starting_at(current.end);

        ledger.append(user, UsageMetric::Tokens, 10, current, now).await.unwrap();
        let entry = ledger.append(user, UsageMetric::Tokens, 5, current, now).await.unwrap();
        assert_eq!(entry.quantity, 15);
        ledger.append(user, UsageMetric::Tokens, 7, next, now).await.unwrap();
        ledger.append(user, UsageMetric::Executions, 1, current, now).await.unwrap();
        ledger.append(UserId::now_v7(), UsageMetric::Tokens, 3, current, now).await.unwrap();

        assert_eq!(ledger.period_total(user, UsageMetric::Tokens, &current).await.unwrap(), 15);
        assert_eq!(ledger.period_total(user, UsageMetric::Tokens, &next).await.unwrap(), 7);

        let entries = ledger.entries_for_user(user).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].period, next);
        assert!(entries.iter().all(|e| e.user_id == user));
    }

    #[tokio::test]
    async fn test_kv_ledger_mark_reported() {
        let ledger = kv_ledger();
        let user = UserId::now_v7();
        let now = Utc.timestamp_millis_opt(1_704_067_200_000).unwrap();
        let period = BillingPeriod::starting_at(now);

        assert_eq!(ledger.entry(user, UsageMetric::Executions, &period).await.unwrap(), None);
        ledger.append(user, UsageMetric::Executions, 4, period, now).await.unwrap();
        let later = now + ChronoDuration::minutes(1);
        ledger
            .mark_reported(user, UsageMetric::Executions, &period, 4, later)
            .await
            .unwrap();

        let entry = ledger
            .entry(user, UsageMetric::Executions, &period)
            .await
            .unwrap()
            .unwrap();
        assert_eq!((entry.quantity, entry.last_reported_quantity), (4, 4));
        assert_eq!(entry.updated_at, later);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_kv_ledgers_sharing_a_store_see_one_total() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvStore::new());
        let user = UserId::now_v7();
        let now = Utc::now();
        let period = BillingPeriod::starting_at(now);

        // Two instances over the same store.
        let tasks: Vec<_> = (0..40)
            .map(|i| {
                let ledger = KvUsageLedger::new(kv.clone());
                tokio::spawn(async move {
                    let quantity = if i % 2 == 0 { 1 } else { 2 };
                    ledger.append(user, UsageMetric::Tokens, quantity, period, now).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let total = KvUsageLedger::new(kv)
            .period_total(user, UsageMetric::Tokens, &period)
            .await
            .unwrap();
        assert_eq!(total, 60);
    }
}
