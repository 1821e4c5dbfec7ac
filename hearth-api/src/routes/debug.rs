//! Cache inspection endpoint.
//!
//! Dumps every cache entry with its decoded value and tags. Only mounted when
//! `HEARTH_DEBUG_CACHE=true`.

use axum::{extract::State, routing::get, Json, Router};
use hearth_storage::{CacheStatsSnapshot, CacheStore};
use serde::Serialize;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryView {
    pub key: String,
    pub value: serde_json::Value,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheDump {
    pub count: usize,
    pub stats: CacheStatsSnapshot,
    pub entries: Vec<CacheEntryView>,
}

/// GET /debug/cache
pub async fn dump_cache(State(cache): State<CacheStore>) -> ApiResult<Json<CacheDump>> {
    let mut entries = Vec::new();
    for (key, value) in cache.entries().await? {
        let tags = cache.tags_of(&key).await?.into_iter().collect();
        entries.push(CacheEntryView { key, value, tags });
    }

    Ok(Json(CacheDump {
        count: entries.len(),
        stats: cache.stats(),
        entries,
    }))
}

pub fn create_router() -> Router<AppState> {
    Router::new().route("/cache", get(dump_cache))
}
