//! Hearth API Server Entry Point
//!
//! Loads configuration, connects the shared store (which also holds billing
//! accounts and the usage ledger), spawns the usage sync job and serves the
//! router until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;

use hearth_api::config::{
    ApiConfig, BillingConfig, HttpClientConfig, StoreConfig, WebhookConfig, WorkerConfig,
};
use hearth_api::constants::DEFAULT_PORT;
use hearth_api::jobs::{usage_sync_task, UsageSyncConfig};
use hearth_api::telemetry::{init_tracing, TelemetryConfig};
use hearth_api::{
    create_api_router, ApiError, ApiResult, AppState, BillingContext, RetryingHttpClient,
    StripeClient, WebhookDelivery, WorkerClient,
};
use hearth_storage::{InMemoryKvStore, KeyValueStore, KvBillingAccountStore, KvUsageLedger};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ApiResult<()> {
    let telemetry_config = TelemetryConfig::default();
    init_tracing(&telemetry_config)?;

    let api_config = ApiConfig::from_env();
    let billing_config = BillingConfig::from_env();
    let sync_config = UsageSyncConfig::from_env();

    let kv = connect_store(&StoreConfig::from_env()).await?;
    let http = RetryingHttpClient::new(HttpClientConfig::from_env())?;

    // Accounts and the ledger share the store so every instance sees them.
    let mut billing = BillingContext::new(
        kv.clone(),
        Arc::new(KvBillingAccountStore::new(kv.clone())),
        Arc::new(KvUsageLedger::new(kv)),
        billing_config.price_table()?,
    )
    .with_config(&billing_config);
    match StripeClient::from_config(http.clone(), &billing_config) {
        Some(client) => billing = billing.with_provider(Arc::new(client)),
        None => tracing::warn!("HEARTH_STRIPE_SECRET_KEY not set; billing provider disabled"),
    }

    let worker = WorkerClient::new(http.clone(), WorkerConfig::from_env().base_url);
    let webhooks = WebhookDelivery::new(http, WebhookConfig::from_env().signing_secret);
    let state = AppState::new(billing, worker, webhooks);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync_handle = if sync_config.enabled && billing_config.is_configured() {
        Some(tokio::spawn(usage_sync_task(
            state.sync.clone(),
            sync_config,
            shutdown_rx,
        )))
    } else {
        tracing::info!("Usage sync task not started");
        None
    };

    let app = create_api_router(state, &api_config);

    let addr = resolve_bind_addr()?;
    tracing::info!(%addr, service = %telemetry_config.service_name, "Starting Hearth API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(handle) = sync_handle {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Usage sync task did not shut down cleanly");
        }
    }
    Ok(())
}

async fn connect_store(config: &StoreConfig) -> ApiResult<Arc<dyn KeyValueStore>> {
    #[cfg(feature = "redis")]
    {
        if let Some(url) = &config.redis_url {
            let store = hearth_storage::RedisKvStore::connect(config.redis_config(url)).await?;
            tracing::info!(prefix = %config.key_prefix, "Connected to Redis");
            return Ok(Arc::new(store));
        }
    }

    #[cfg(not(feature = "redis"))]
    {
        if config.redis_url.is_some() {
            tracing::warn!("HEARTH_REDIS_URL is set but this build lacks the redis feature");
        }
    }

    tracing::warn!("Using the in-memory store; state is not shared between instances");
    Ok(Arc::new(InMemoryKvStore::new()))
}

fn resolve_bind_addr() -> ApiResult<SocketAddr> {
    let host = std::env::var("HEARTH_API_BIND").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port_str = std::env::var("PORT")
        .ok()
        .or_else(|| std::env::var("HEARTH_API_PORT").ok())
        .unwrap_or_else(|| DEFAULT_PORT.to_string());
    let port = port_str
        .parse::<u16>()
        .map_err(|_| ApiError::invalid_input(format!("Invalid port value: {}", port_str)))?;

    let addr = format!("{}:{}", host, port);
    addr.parse::<SocketAddr>()
        .map_err(|e| ApiError::invalid_input(format!("Invalid bind address {}: {}", addr, e)))
}
