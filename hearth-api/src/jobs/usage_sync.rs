//! Usage Sync Background Task
//!
//! Periodically reports every account's current-period usage to the billing
//! provider through [`SubscriptionSync::sync_all`]. Each user is synced under
//! its own distributed lock, so several API instances can run this task at
//! once; a user whose lock is held elsewhere is skipped for the cycle.
//!
//! Each cycle also prunes cache tag memberships left behind by expired or
//! retagged entries.
//!
//! # Configuration
//!
//! ```rust
//! use hearth_api::jobs::UsageSyncConfig;
//! use std::time::Duration;
//!
//! let config = UsageSyncConfig {
//!     interval: Duration::from_secs(3600), // Report hourly
//!     enabled: true,
//! };
//! ```

use crate::billing::SubscriptionSync;
use crate::constants::DEFAULT_USAGE_SYNC_INTERVAL_SECS;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct UsageSyncConfig {
    /// How often to reconcile usage (default: 1 hour)
    pub interval: Duration,

    /// Whether the task is spawned at all (default: true)
    pub enabled: bool,
}

impl Default for UsageSyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_USAGE_SYNC_INTERVAL_SECS),
            enabled: true,
        }
    }
}

impl UsageSyncConfig {
    /// # Environment Variables
    /// - `HEARTH_USAGE_SYNC_INTERVAL_SECS`: Reconciliation interval (default: 3600)
    /// - `HEARTH_USAGE_SYNC_ENABLED`: Whether to run the task (default: true)
    ///
    /// The per-user lock TTL is shared with the billing routes and comes from
    /// `HEARTH_BILLING_LOCK_TTL_SECS`.
    pub fn from_env() -> Self {
        let interval = Duration::from_secs(
            std::env::var("HEARTH_USAGE_SYNC_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|secs: &u64| *secs > 0)
                .unwrap_or(DEFAULT_USAGE_SYNC_INTERVAL_SECS),
        );

        let enabled = std::env::var("HEARTH_USAGE_SYNC_ENABLED")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        Self { interval, enabled }
    }

    /// Short interval for local development.
    pub fn development() -> Self {
        Self {
            interval: Duration::from_secs(30),
            enabled: true,
        }
    }

    pub fn production() -> Self {
        Self::default()
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct UsageSyncMetrics {
    /// Completed sync cycles
    pub cycles: AtomicU64,

    /// Users whose usage was reported
    pub reported: AtomicU64,

    /// Users skipped (lock busy or no subscription)
    pub skipped: AtomicU64,

    /// Per-user failures plus cycles that could not list accounts
    pub failures: AtomicU64,
}

impl UsageSyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> UsageSyncSnapshot {
        UsageSyncSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            reported: self.reported.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSyncSnapshot {
    pub cycles: u64,
    pub reported: u64,
    pub skipped: u64,
    pub failures: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run usage reconciliation until `shutdown_rx` reads `true`.
///
/// The first cycle runs immediately. Ticks missed while a cycle is still
/// running are skipped rather than bunched up.
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let handle = tokio::spawn(usage_sync_task(sync, UsageSyncConfig::from_env(), shutdown_rx));
///
/// let _ = shutdown_tx.send(true);
/// let metrics = handle.await?;
/// ```
pub async fn usage_sync_task(
    sync: SubscriptionSync,
    config: UsageSyncConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<UsageSyncMetrics> {
    let metrics = Arc::new(UsageSyncMetrics::new());

    let mut sync_interval = interval(config.interval);
    sync_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = config.interval.as_secs(),
        "Usage sync task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Usage sync task shutting down");
                    break;
                }
            }

            _ = sync_interval.tick() => {
                run_cycle(&sync, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        reported = snapshot.reported,
        skipped = snapshot.skipped,
        failures = snapshot.failures,
        "Usage sync task completed"
    );

    metrics
}

async fn run_cycle(sync: &SubscriptionSync, metrics: &UsageSyncMetrics) {
    metrics.cycles.fetch_add(1, Ordering::Relaxed);

    match sync.sync_all().await {
        Ok(report) => {
            metrics.reported.fetch_add(report.reported, Ordering::Relaxed);
            metrics.skipped.fetch_add(report.skipped, Ordering::Relaxed);
            metrics.failures.fetch_add(report.failed, Ordering::Relaxed);
            if report.reported > 0 || report.failed > 0 {
                tracing::info!(
                    accounts = report.accounts,
                    reported = report.reported,
                    skipped = report.skipped,
                    failed = report.failed,
                    "Usage sync cycle completed"
                );
            } else {
                tracing::trace!(accounts = report.accounts, "Usage sync cycle completed with nothing to report");
            }
        }
        Err(e) => {
            metrics.failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, "Usage sync cycle failed");
        }
    }

    if let Err(e) = sync.context().cache.prune_tags().await {
        tracing::warn!(error = %e, "Cache tag pruning failed");
    }
}
