//! Shared application state for Axum routers.

use std::sync::Arc;

use hearth_storage::{CacheStore, KeyValueStore};

use crate::billing::{BillingContext, SubscriptionSync, UsageRecorder};
use crate::routes::agent_run::AgentRunRegistry;
use crate::webhooks::WebhookDelivery;
use crate::worker::WorkerClient;

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    /// The shared store every instance coordinates through.
    pub kv: Arc<dyn KeyValueStore>,
    pub cache: CacheStore,
    pub recorder: UsageRecorder,
    pub sync: SubscriptionSync,
    pub worker: WorkerClient,
    pub webhooks: WebhookDelivery,
    /// Runs awaiting their worker result. Process-local.
    pub agent_runs: Arc<AgentRunRegistry>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(billing: BillingContext, worker: WorkerClient, webhooks: WebhookDelivery) -> Self {
        Self {
            kv: billing.cache.kv().clone(),
            cache: billing.cache.clone(),
            recorder: UsageRecorder::new(billing.clone()),
            sync: SubscriptionSync::new(billing),
            worker,
            webhooks,
            agent_runs: Arc::new(AgentRunRegistry::default()),
            start_time: std::time::Instant::now(),
        }
    }
}

crate::impl_from_ref!(Arc<dyn KeyValueStore>, kv);
crate::impl_from_ref!(CacheStore, cache);
crate::impl_from_ref!(UsageRecorder, recorder);
crate::impl_from_ref!(SubscriptionSync, sync);
crate::impl_from_ref!(WorkerClient, worker);
crate::impl_from_ref!(WebhookDelivery, webhooks);
crate::impl_from_ref!(Arc<AgentRunRegistry>, agent_runs);
crate::impl_from_ref!(std::time::Instant, start_time);
