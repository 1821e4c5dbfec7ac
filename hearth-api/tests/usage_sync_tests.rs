//! Usage recording and provider reconciliation against the mock provider.

mod support;

use std::sync::Arc;
use std::time::Duration;

use hearth_api::billing::usage_lock;
use hearth_api::{usage_sync_task, SubscriptionSync, SyncOutcome, SyncReport, UsageRecorder, UsageSyncConfig};
use hearth_core::{BillingAccount, BillingError, UsageMetric, UserId};
use hearth_storage::{BillingAccountStore, DistributedLock, UsageLedger};
use hearth_test_utils::fixtures::{fixture_start, period_at, subscribed_account};
use hearth_test_utils::{EntityIdType, MockBillingProvider};
use support::{billing_harness, kv_billing_harness, BillingHarness};
use tokio::sync::watch;

/// Subscribe a fresh user on `price_id` with a matching provider subscription.
async fn subscribe(h: &BillingHarness, price_id: &str, sub_id: &str, item_id: &str) -> UserId {
    let user = UserId::now_v7();
    let period = period_at(fixture_start());
    h.provider.seed_subscription(sub_id, item_id, price_id, period);
    h.accounts
        .upsert(subscribed_account(user, price_id, sub_id, item_id, period))
        .await
        .unwrap();
    user
}

/// Like [`subscribe`], but the user has no provider customer yet.
async fn subscribe_without_customer(h: &BillingHarness, price_id: &str) -> UserId {
    let user = UserId::now_v7();
    let period = period_at(fixture_start());
    h.provider.seed_subscription("sub_1", "si_1", price_id, period);
    let mut fresh = subscribed_account(user, price_id, "sub_1", "si_1", period);
    fresh.external_customer_id = None;
    h.accounts.upsert(fresh).await.unwrap();
    user
}

async fn account(h: &BillingHarness, user: UserId) -> BillingAccount {
    h.accounts.get(user).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_sync_is_idempotent_with_set_semantics() {
    let h = billing_harness(MockBillingProvider::new());
    let user = subscribe(&h, "price_free", "sub_1", "si_1").await;
    let recorder = UsageRecorder::new(h.ctx.clone());
    let sync = SubscriptionSync::new(h.ctx.clone());

    recorder.record_usage(user, UsageMetric::Executions, 7).await.unwrap();

    let first = sync.sync_subscription_usage(user).await.unwrap();
    let second = sync.sync_subscription_usage(user).await.unwrap();

    assert_eq!(first, SyncOutcome::Reported { quantity: 7 });
    assert_eq!(second, first);
    assert_eq!(h.provider.usage_for("si_1"), Some(7));
    assert_eq!(h.provider.usage_calls(), 2);

    let period = account(&h, user).await.period;
    let entry = h
        .ledger
        .entry(user, UsageMetric::Executions, &period)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.last_reported_quantity, 7);
    assert_eq!(entry.unreported(), 0);
}

#[tokio::test]
async fn test_new_usage_grows_reported_total() {
    let h = billing_harness(MockBillingProvider::new());
    let user = subscribe(&h, "price_free", "sub_1", "si_1").await;
    let recorder = UsageRecorder::new(h.ctx.clone());
    let sync = SubscriptionSync::new(h.ctx.clone());

    recorder.record_usage(user, UsageMetric::Executions, 3).await.unwrap();
    sync.sync_subscription_usage(user).await.unwrap();

    recorder.record_usage(user, UsageMetric::Executions, 2).await.unwrap();
    // Tokens are not the billed metric and must not reach the provider.
    recorder.record_usage(user, UsageMetric::Tokens, 900).await.unwrap();
    let outcome = sync.sync_subscription_usage(user).await.unwrap();

    assert_eq!(outcome, SyncOutcome::Reported { quantity: 5 });
    assert_eq!(h.provider.usage_for("si_1"), Some(5));
    assert_eq!(account(&h, user).await.current_period_usage, 5);
}

#[tokio::test]
async fn test_held_lock_skips_without_provider_calls() {
    let h = billing_harness(MockBillingProvider::new());
    let user = subscribe(&h, "price_free", "sub_1", "si_1").await;
    let sync = SubscriptionSync::new(h.ctx.clone());

    let lock = DistributedLock::new(h.kv.clone());
    let token = lock
        .acquire(&usage_lock(user), Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let outcome = sync.sync_subscription_usage(user).await.unwrap();
    assert_eq!(outcome, SyncOutcome::LockBusy);
    assert_eq!(h.provider.retrieve_calls(), 0);
    assert_eq!(h.provider.usage_calls(), 0);

    lock.release(&token).await.unwrap();
    let outcome = sync.sync_subscription_usage(user).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Reported { quantity: 0 });
}

#[tokio::test]
async fn test_account_without_subscription_is_skipped() {
    let h = billing_harness(MockBillingProvider::new());
    let user = UserId::now_v7();
    let recorder = UsageRecorder::new(h.ctx.clone());
    recorder.record_usage(user, UsageMetric::Executions, 1).await.unwrap();

    let sync = SubscriptionSync::new(h.ctx.clone());
    assert_eq!(
        sync.sync_subscription_usage(user).await.unwrap(),
        SyncOutcome::NoSubscription
    );
    assert_eq!(h.provider.retrieve_calls(), 0);
}

#[tokio::test]
async fn test_unknown_account_is_an_error() {
    let h = billing_harness(MockBillingProvider::new());
    let sync = SubscriptionSync::new(h.ctx.clone());
    let user = UserId::now_v7();

    let err = sync.sync_subscription_usage(user).await.unwrap_err();
    assert_eq!(err, BillingError::AccountMissing { user_id: user });
}

#[tokio::test]
async fn test_sync_all_isolates_failures() {
    let h = billing_harness(MockBillingProvider::new());
    let recorder = UsageRecorder::new(h.ctx.clone());

    let healthy = subscribe(&h, "price_free", "sub_ok", "si_ok").await;
    let orphaned = UserId::now_v7();
    h.accounts
        .upsert(subscribed_account(
            orphaned,
            "price_free",
            "sub_gone",
            "si_gone",
            period_at(fixture_start()),
        ))
        .await
        .unwrap();
    let unsubscribed = UserId::now_v7();
    recorder.ensure_account(unsubscribed, "free@example.com").await.unwrap();
    recorder.record_usage(healthy, UsageMetric::Executions, 4).await.unwrap();

    let report = SubscriptionSync::new(h.ctx.clone()).sync_all().await.unwrap();

    assert_eq!(
        report,
        SyncReport {
            accounts: 3,
            reported: 1,
            skipped: 1,
            failed: 1,
        }
    );
    assert_eq!(h.provider.usage_for("si_ok"), Some(4));
}

#[tokio::test]
async fn test_provider_outage_fails_every_reportable_account() {
    let h = billing_harness(MockBillingProvider::new());
    subscribe(&h, "price_free", "sub_a", "si_a").await;
    subscribe(&h, "price_pro", "sub_b", "si_b").await;
    h.provider.set_failing(true);

    let report = SubscriptionSync::new(h.ctx.clone()).sync_all().await.unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(report.reported, 0);
}

#[tokio::test]
async fn test_price_change_at_provider_is_adopted() {
    let h = billing_harness(MockBillingProvider::new());
    let user = subscribe(&h, "price_free", "sub_1", "si_1").await;
    // Upgraded outside the app, e.g. in the provider's dashboard.
    h.provider
        .seed_subscription("sub_1", "si_1", "price_pro", period_at(fixture_start()));

    let sync = SubscriptionSync::new(h.ctx.clone());
    sync.sync_subscription_usage(user).await.unwrap();

    let account = account(&h, user).await;
    assert_eq!(account.price_id, "price_pro");
    assert_eq!(account.quota_limit, 5_000);
}

#[tokio::test]
async fn test_provider_period_is_adopted() {
    let h = billing_harness(MockBillingProvider::new());
    let user = subscribe(&h, "price_free", "sub_1", "si_1").await;
    let next = period_at(fixture_start())
        .roll_forward(fixture_start() + chrono::Duration::days(31))
        .unwrap();
    h.provider.seed_subscription("sub_1", "si_1", "price_free", next);

    SubscriptionSync::new(h.ctx.clone())
        .sync_subscription_usage(user)
        .await
        .unwrap();
    assert_eq!(account(&h, user).await.period, next);
}

#[tokio::test]
async fn test_change_price_tier() {
    let h = billing_harness(MockBillingProvider::new());
    let user = subscribe(&h, "price_free", "sub_1", "si_1").await;
    let recorder = UsageRecorder::new(h.ctx.clone());
    recorder.record_usage(user, UsageMetric::Executions, 100).await.unwrap();
    assert!(recorder.check_quota(user).await.unwrap().exceeded);

    let sync = SubscriptionSync::new(h.ctx.clone());
    let updated = sync.change_price_tier(user, "price_team").await.unwrap();

    assert_eq!(updated.price_id, "price_team");
    assert_eq!(updated.quota_limit, 50_000);
    assert_eq!(updated.current_period_usage, 100);
    assert_eq!(h.provider.update_calls(), 1);
    assert_eq!(
        h.provider.subscription("sub_1").unwrap().items[0].price_id,
        "price_team"
    );

    let quota = recorder.check_quota(user).await.unwrap();
    assert!(!quota.exceeded);
    assert_eq!(quota.remaining, 49_900);
}

#[tokio::test]
async fn test_change_price_tier_rejects_unknown_price() {
    let h = billing_harness(MockBillingProvider::new());
    let user = subscribe(&h, "price_free", "sub_1", "si_1").await;

    let err = SubscriptionSync::new(h.ctx.clone())
        .change_price_tier(user, "price_enterprise")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BillingError::UnknownPrice {
            price_id: "price_enterprise".to_string()
        }
    );
    assert_eq!(h.provider.update_calls(), 0);
}

#[tokio::test]
async fn test_concurrent_customer_resolution_creates_one_customer() {
    let h = billing_harness(MockBillingProvider::new().with_latency(Duration::from_millis(50)));
    let recorder = UsageRecorder::new(h.ctx.clone());
    let user = UserId::now_v7();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let recorder = recorder.clone();
        handles.push(tokio::spawn(async move {
            recorder.resolve_customer(user, "race@example.com").await
        }));
    }

    let mut created = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(id) => created.push(id),
            Err(BillingError::Busy { .. }) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert!(!created.is_empty());
    assert!(created.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(h.provider.customer_calls(), 1);

    // Once settled, every caller sees the persisted id.
    let settled = recorder.resolve_customer(user, "race@example.com").await.unwrap();
    assert_eq!(settled, created[0]);
    assert_eq!(h.provider.customer_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_background_task_reports_usage() {
    let h = billing_harness(MockBillingProvider::new());
    let user = subscribe(&h, "price_free", "sub_1", "si_1").await;
    UsageRecorder::new(h.ctx.clone())
        .record_usage(user, UsageMetric::Executions, 12)
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let config = UsageSyncConfig {
        interval: Duration::from_secs(60),
        enabled: true,
    };
    let handle = tokio::spawn(usage_sync_task(
        SubscriptionSync::new(h.ctx.clone()),
        config,
        shutdown_rx,
    ));

    tokio::time::sleep(Duration::from_secs(90)).await;
    shutdown_tx.send(true).unwrap();
    let metrics: Arc<_> = handle.await.unwrap();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.cycles, 2);
    assert_eq!(snapshot.reported, 2);
    assert_eq!(snapshot.failures, 0);
    assert_eq!(h.provider.usage_for("si_1"), Some(12));
}

#[tokio::test]
async fn test_sync_keeps_customer_saved_while_reporting() {
    let h = billing_harness(MockBillingProvider::new().with_latency(Duration::from_millis(40)));
    let user = subscribe_without_customer(&h, "price_free").await;
    let recorder = UsageRecorder::new(h.ctx.clone());
    let sync = SubscriptionSync::new(h.ctx.clone());
    recorder.record_usage(user, UsageMetric::Executions, 3).await.unwrap();

    // The customer is saved between the sync's account read and its write.
    let (outcome, customer_id) = tokio::join!(
        sync.sync_subscription_usage(user),
        recorder.resolve_customer(user, "user@example.com")
    );

    assert_eq!(outcome.unwrap(), SyncOutcome::Reported { quantity: 3 });
    let customer_id = customer_id.unwrap();
    let stored = account(&h, user).await;
    assert_eq!(stored.external_customer_id, Some(customer_id));
    assert_eq!(stored.current_period_usage, 3);
}

async fn assert_concurrent_writers_keep_every_field(h: BillingHarness) {
    let user = subscribe_without_customer(&h, "price_free").await;
    let recorder = UsageRecorder::new(h.ctx.clone());
    let sync = SubscriptionSync::new(h.ctx.clone());

    let records = async {
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let recorder = recorder.clone();
                tokio::spawn(async move {
                    recorder.record_usage(user, UsageMetric::Executions, 1).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    };
    let (customer_id, changed, ()) = tokio::join!(
        recorder.resolve_customer(user, "user@example.com"),
        sync.change_price_tier(user, "price_team"),
        records
    );
    let customer_id = customer_id.unwrap();
    changed.unwrap();

    let stored = account(&h, user).await;
    assert_eq!(stored.external_customer_id, Some(customer_id));
    assert_eq!(stored.price_id, "price_team");
    assert_eq!(stored.quota_limit, 50_000);
    assert_eq!(stored.current_period_usage, 20);
    assert_eq!(stored.subscription_id.as_deref(), Some("sub_1"));

    let outcome = sync.sync_subscription_usage(user).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Reported { quantity: 20 });
    assert_eq!(account(&h, user).await.price_id, "price_team");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_keep_every_field_in_memory() {
    let h = billing_harness(MockBillingProvider::new().with_latency(Duration::from_millis(10)));
    assert_concurrent_writers_keep_every_field(h).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_keep_every_field_in_shared_store() {
    let h = kv_billing_harness(MockBillingProvider::new().with_latency(Duration::from_millis(10)));
    assert_concurrent_writers_keep_every_field(h).await;
}

#[tokio::test]
async fn test_link_subscription_adopts_plan_and_keeps_customer() {
    let h = kv_billing_harness(MockBillingProvider::new());
    let recorder = UsageRecorder::new(h.ctx.clone());
    let user = UserId::now_v7();
    let period = period_at(fixture_start());
    h.provider.seed_subscription("sub_new", "si_new", "price_pro", period);

    let customer_id = recorder.resolve_customer(user, "new@example.com").await.unwrap();
    recorder.record_usage(user, UsageMetric::Executions, 6).await.unwrap();

    let sync = SubscriptionSync::new(h.ctx.clone());
    let linked = sync.link_subscription(user, "sub_new").await.unwrap();

    assert_eq!(linked.subscription_id.as_deref(), Some("sub_new"));
    assert_eq!(linked.subscription_item_id.as_deref(), Some("si_new"));
    assert_eq!(linked.price_id, "price_pro");
    assert_eq!(linked.quota_limit, 5_000);
    assert_eq!(linked.period, period);
    assert_eq!(linked.external_customer_id, Some(customer_id));

    // Usage recorded before linking counts toward the linked period.
    assert_eq!(linked.current_period_usage, 6);
    assert_eq!(
        sync.sync_subscription_usage(user).await.unwrap(),
        SyncOutcome::Reported { quantity: 6 }
    );
    assert_eq!(h.provider.usage_for("si_new"), Some(6));
}

#[tokio::test]
async fn test_link_subscription_errors() {
    let h = billing_harness(MockBillingProvider::new());
    let sync = SubscriptionSync::new(h.ctx.clone());
    let user = UserId::now_v7();

    let err = sync.link_subscription(user, "sub_1").await.unwrap_err();
    assert_eq!(err, BillingError::AccountMissing { user_id: user });

    UsageRecorder::new(h.ctx.clone())
        .ensure_account(user, "a@example.com")
        .await
        .unwrap();
    let err = sync.link_subscription(user, "sub_missing").await.unwrap_err();
    assert!(matches!(err, BillingError::Provider { status: 404, .. }));

    h.provider
        .seed_subscription("sub_odd", "si_odd", "price_legacy", period_at(fixture_start()));
    let err = sync.link_subscription(user, "sub_odd").await.unwrap_err();
    assert_eq!(
        err,
        BillingError::UnknownPrice {
            price_id: "price_legacy".to_string()
        }
    );
    assert_eq!(account(&h, user).await.subscription_id, None);
}
