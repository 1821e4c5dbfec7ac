//! Hearth Storage - Shared State Primitives
//!
//! Everything that coordinates concurrent, stateless request handlers goes
//! through one injected [`KeyValueStore`]:
//!
//! - [`CacheStore`]: JSON cache with tag invalidation and window counters
//! - [`DistributedLock`]: owner-token mutex with TTL
//!
//! Billing state the application owns (usage ledger, billing accounts) sits
//! behind its own traits, with in-memory implementations for a single process
//! and key-value implementations shared across instances.

pub mod accounts;
pub mod cache;
pub mod kv;
pub mod ledger;
pub mod lock;

pub use accounts::{
    BillingAccountStore, InMemoryBillingAccountStore, KvBillingAccountStore, SubscriptionState,
};
pub use cache::{CacheStatsSnapshot, CacheStore, WarmReport, WindowCount};
pub use kv::{InMemoryKvStore, KeyValueStore, WriteOp};
#[cfg(feature = "redis")]
pub use kv::{RedisKvStore, RedisStoreConfig};
pub use ledger::{InMemoryUsageLedger, KvUsageLedger, UsageLedger};
pub use lock::{lock_key, DistributedLock, LockToken};
