//! Usage metering and billing reconciliation.
//!
//! Handlers record consumption through [`UsageRecorder`], which only touches
//! the local ledger. [`SubscriptionSync`] later reports period totals to the
//! billing provider with "set" semantics, one user at a time under a
//! per-user lock.

pub mod recorder;
pub mod stripe;
pub mod sync;

use hearth_core::{BillingError, BillingProvider, BillingResult, Clock, PriceTable, SystemClock, UserId};
use hearth_storage::{BillingAccountStore, CacheStore, DistributedLock, KeyValueStore, UsageLedger};
use std::sync::Arc;
use std::time::Duration;

use crate::config::BillingConfig;
use crate::constants::{
    CUSTOMER_CACHE_PREFIX, CUSTOMER_CACHE_TTL_SECS, DEFAULT_BILLING_LOCK_TTL_SECS,
    USAGE_SUMMARY_CACHE_TTL_SECS,
};

pub use recorder::{UsageRecorder, UsageSummary};
pub use stripe::StripeClient;
pub use sync::{SubscriptionSync, SyncOutcome, SyncReport};

/// Cache tag covering every cached usage view of one user.
pub fn usage_tag(user_id: UserId) -> String {
    format!("usage:{}", user_id)
}

pub fn customer_cache_key(user_id: UserId) -> String {
    format!("{}{}", CUSTOMER_CACHE_PREFIX, user_id)
}

pub fn usage_summary_key(user_id: UserId) -> String {
    format!("billing:usage:{}", user_id)
}

/// Lock serializing customer creation for one user.
pub fn customer_lock(user_id: UserId) -> String {
    format!("customer:{}", user_id)
}

/// Lock serializing usage reports and tier changes for one user.
pub fn usage_lock(user_id: UserId) -> String {
    format!("usage:{}", user_id)
}

/// Collaborators shared by the recorder and the sync.
#[derive(Clone)]
pub struct BillingContext {
    pub accounts: Arc<dyn BillingAccountStore>,
    pub ledger: Arc<dyn UsageLedger>,
    pub cache: CacheStore,
    pub lock: DistributedLock,
    pub provider: Option<Arc<dyn BillingProvider>>,
    pub prices: PriceTable,
    pub clock: Arc<dyn Clock>,
    pub lock_ttl: Duration,
    pub customer_cache_ttl: Duration,
    pub usage_summary_ttl: Duration,
}

impl BillingContext {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        accounts: Arc<dyn BillingAccountStore>,
        ledger: Arc<dyn UsageLedger>,
        prices: PriceTable,
    ) -> Self {
        Self {
            accounts,
            ledger,
            cache: CacheStore::new(kv.clone()),
            lock: DistributedLock::new(kv),
            provider: None,
            prices,
            clock: Arc::new(SystemClock),
            lock_ttl: Duration::from_secs(DEFAULT_BILLING_LOCK_TTL_SECS),
            customer_cache_ttl: Duration::from_secs(CUSTOMER_CACHE_TTL_SECS),
            usage_summary_ttl: Duration::from_secs(USAGE_SUMMARY_CACHE_TTL_SECS),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn BillingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Take TTLs from configuration.
    pub fn with_config(mut self, config: &BillingConfig) -> Self {
        self.lock_ttl = config.lock_ttl;
        self.customer_cache_ttl = config.customer_cache_ttl;
        self.usage_summary_ttl = config.usage_summary_ttl;
        self
    }

    pub fn provider(&self) -> BillingResult<&Arc<dyn BillingProvider>> {
        self.provider.as_ref().ok_or(BillingError::NotConfigured)
    }
}
