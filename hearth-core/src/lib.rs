//! Hearth Core - Shared Types
//!
//! Identity types, the error taxonomy, the wall-clock seam and the billing
//! domain. Every other Hearth crate depends on this one; it performs no I/O.

pub mod billing;
pub mod error;
pub mod identity;
pub mod time;

pub use billing::{
    BillingAccount, BillingPeriod, BillingProvider, PriceTable, PriceTier, QuotaStatus,
    Subscription, SubscriptionItem, SubscriptionItemUpdate, UsageAction, UsageLedgerEntry,
    UsageMetric, UsageRecord, UsageRecordReceipt, DEFAULT_PERIOD_DAYS,
};
pub use error::{
    BillingError, BillingResult, ConfigError, HearthError, HearthResult, PeriodError, StoreError,
    StoreResult,
};
pub use identity::{AgentInstanceId, AgentRunId, EntityIdType, Timestamp, UserId};
pub use time::{Clock, ManualClock, SystemClock};
