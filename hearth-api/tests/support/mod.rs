//! Shared helpers for hearth-api integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hearth_api::config::{ApiConfig, HttpClientConfig};
use hearth_api::{
    create_api_router, AppState, BillingContext, RetryingHttpClient, WebhookDelivery,
    WorkerClient,
};
use hearth_core::{Clock, ManualClock, PriceTable};
use hearth_storage::{
    BillingAccountStore, InMemoryBillingAccountStore, InMemoryKvStore, InMemoryUsageLedger,
    KeyValueStore, KvBillingAccountStore, KvUsageLedger, UsageLedger,
};
use hearth_test_utils::fixtures::{price_table, FIXTURE_START_MS};
use hearth_test_utils::MockBillingProvider;

/// Serve `router` on an ephemeral local port.
pub async fn spawn_server(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

/// Client with short delays so retry tests stay fast.
pub fn fast_http(retries: u32) -> RetryingHttpClient {
    RetryingHttpClient::new(HttpClientConfig {
        timeout: Duration::from_secs(2),
        retries,
        retry_delay: Duration::from_millis(10),
    })
    .expect("http client")
}

/// Everything a test needs to drive the billing pipeline.
pub struct BillingHarness {
    pub kv: Arc<InMemoryKvStore>,
    pub accounts: Arc<dyn BillingAccountStore>,
    pub ledger: Arc<dyn UsageLedger>,
    pub clock: Arc<ManualClock>,
    pub provider: Arc<MockBillingProvider>,
    pub ctx: BillingContext,
}

pub fn billing_harness(provider: MockBillingProvider) -> BillingHarness {
    billing_harness_with_prices(provider, price_table())
}

/// Harness whose accounts and ledger live in the shared key-value store,
/// the way `main` wires them.
pub fn kv_billing_harness(provider: MockBillingProvider) -> BillingHarness {
    let kv = Arc::new(InMemoryKvStore::new());
    let shared: Arc<dyn KeyValueStore> = kv.clone();
    build_harness(
        kv,
        Arc::new(KvBillingAccountStore::new(shared.clone())),
        Arc::new(KvUsageLedger::new(shared)),
        provider,
        price_table(),
    )
}

pub fn billing_harness_with_prices(
    provider: MockBillingProvider,
    prices: PriceTable,
) -> BillingHarness {
    build_harness(
        Arc::new(InMemoryKvStore::new()),
        Arc::new(InMemoryBillingAccountStore::new()),
        Arc::new(InMemoryUsageLedger::new()),
        provider,
        prices,
    )
}

fn build_harness(
    kv: Arc<InMemoryKvStore>,
    accounts: Arc<dyn BillingAccountStore>,
    ledger: Arc<dyn UsageLedger>,
    provider: MockBillingProvider,
    prices: PriceTable,
) -> BillingHarness {
    let clock = Arc::new(ManualClock::new(FIXTURE_START_MS));
    let provider = Arc::new(provider);

    let clock_dyn: Arc<dyn Clock> = clock.clone();
    let ctx = BillingContext::new(kv.clone(), accounts.clone(), ledger.clone(), prices)
        .with_provider(provider.clone())
        .with_clock(clock_dyn);

    BillingHarness {
        kv,
        accounts,
        ledger,
        clock,
        provider,
        ctx,
    }
}

/// Application state whose worker lives at `worker_url`.
pub fn app_state(ctx: BillingContext, worker_url: &str, retries: u32) -> AppState {
    let http = fast_http(retries);
    AppState::new(
        ctx,
        WorkerClient::new(http.clone(), worker_url),
        WebhookDelivery::new(http, Some("whsec_test".to_string())),
    )
}

pub fn app(state: AppState, config: &ApiConfig) -> Router {
    create_api_router(state, config)
}
