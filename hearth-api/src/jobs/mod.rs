//! Background Jobs for the Hearth API
//!
//! - `usage_sync`: Reports local usage totals to the billing provider
//!
//! # Usage
//!
//! ```ignore
//! use hearth_api::jobs::{usage_sync_task, UsageSyncConfig};
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! tokio::spawn(usage_sync_task(sync.clone(), UsageSyncConfig::from_env(), shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! ```

pub mod usage_sync;

pub use usage_sync::{usage_sync_task, UsageSyncConfig, UsageSyncMetrics, UsageSyncSnapshot};
