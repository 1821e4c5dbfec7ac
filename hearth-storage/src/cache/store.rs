//! Tag-indexed JSON cache over the shared key-value store.

use futures_util::future::join_all;
use hearth_core::{StoreError, StoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::stats::{CacheStats, CacheStatsSnapshot};
use crate::kv::{effective_ttl, KeyValueStore, WriteOp};

/// Store key prefix of tag → keys sets.
pub const TAG_PREFIX: &str = "cache:tag:";
/// Store key prefix of key → tags sets.
pub const KEY_TAGS_PREFIX: &str = "cache:keytags:";

pub fn tag_key(tag: &str) -> String {
    format!("{}{}", TAG_PREFIX, tag)
}

pub fn key_tags_key(key: &str) -> String {
    format!("{}{}", KEY_TAGS_PREFIX, key)
}

fn is_index_key(key: &str) -> bool {
    key.starts_with(TAG_PREFIX) || key.starts_with(KEY_TAGS_PREFIX)
}

/// Result of one fixed-window increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Count after this increment, starting at 1 for a fresh window.
    pub count: i64,
    /// Time until the window closes.
    pub resets_in: Duration,
}

/// Outcome of [`CacheStore::warm`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmReport {
    pub stored: Vec<String>,
    pub failed: Vec<String>,
}

/// JSON cache with tag invalidation.
///
/// Value operations never fail: backend and serialization errors are logged
/// and read as a miss. Counter primitives return `StoreResult` because their
/// callers decide how to degrade.
#[derive(Clone)]
pub struct CacheStore {
    kv: Arc<dyn KeyValueStore>,
    stats: Arc<CacheStats>,
}

impl CacheStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            stats: Arc::new(CacheStats::default()),
        }
    }

    /// The underlying store, shared with locks and other collaborators.
    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    // ========================================================================
    // READS
    // ========================================================================

    async fn try_get<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.kv.get(key).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::Serialization {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.try_get(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    /// `get` that also feeds the hit/miss/error counters.
    pub async fn get_with_stats<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.try_get(key).await {
            Ok(Some(value)) => {
                self.stats.record_hit();
                Some(value)
            }
            Ok(None) => {
                self.stats.record_miss();
                None
            }
            Err(e) => {
                self.stats.record_error();
                tracing::warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    /// Fetch many keys; the result lines up with `keys`.
    pub async fn mget<T: DeserializeOwned>(&self, keys: &[String]) -> Vec<Option<T>> {
        if keys.is_empty() {
            return Vec::new();
        }
        let raw = match self.kv.mget(keys).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(count = keys.len(), error = %e, "Cache MGET failed, treating as misses");
                return keys.iter().map(|_| None).collect();
            }
        };
        keys.iter()
            .zip(raw)
            .map(|(key, value)| {
                value.and_then(|raw| match serde_json::from_str(&raw) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Cached value did not decode");
                        None
                    }
                })
            })
            .collect()
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        self.set_with_tags::<T, &str>(key, value, &[], ttl).await;
    }

    /// Store `value` and record `key` under each tag in one atomic batch.
    ///
    /// The batch replaces the reverse index outright, so the key's recorded
    /// tags are always those of the write that stored its value. Tag sets may
    /// still list the key under a tag from a racing write; invalidation skips
    /// such members and [`CacheStore::prune_tags`] removes them.
    pub async fn set_with_tags<T, S>(&self, key: &str, value: &T, tags: &[S], ttl: Option<Duration>)
    where
        T: Serialize + ?Sized,
        S: AsRef<str>,
    {
        let Some(raw) = self.encode(key, value) else {
            return;
        };
        let tags: Vec<String> = tags.iter().map(|t| t.as_ref().to_string()).collect();
        let result: StoreResult<()> = async {
            let ops = self.write_ops(key, raw, &tags, ttl).await?;
            self.kv.apply(ops).await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(key = %key, tags = ?tags, error = %e, "Cache write failed");
        }
    }

    /// Store several untagged values with a shared TTL.
    pub async fn mset<T: Serialize>(&self, entries: &[(String, T)], ttl: Option<Duration>) {
        if let Err(e) = self.try_mset(entries, ttl).await {
            tracing::warn!(count = entries.len(), error = %e, "Cache MSET failed");
        }
    }

    async fn try_mset<T: Serialize>(
        &self,
        entries: &[(String, T)],
        ttl: Option<Duration>,
    ) -> StoreResult<Vec<String>> {
        let mut ops = Vec::new();
        let mut written = Vec::new();
        for (key, value) in entries {
            let Some(raw) = self.encode(key, value) else {
                continue;
            };
            ops.extend(self.write_ops(key, raw, &[], ttl).await?);
            written.push(key.clone());
        }
        if !ops.is_empty() {
            self.kv.apply(ops).await?;
        }
        Ok(written)
    }

    fn encode<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Option<String> {
        match serde_json::to_string(value) {
            Ok(raw) => Some(raw),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache value failed to serialize, skipping write");
                None
            }
        }
    }

    async fn write_ops(
        &self,
        key: &str,
        raw: String,
        tags: &[String],
        ttl: Option<Duration>,
    ) -> StoreResult<Vec<WriteOp>> {
        let index = key_tags_key(key);
        let previous = self.kv.smembers(&index).await?;

        let mut ops = vec![WriteOp::set(key, raw, ttl), WriteOp::del(index.clone())];
        for stale in previous.iter().filter(|t| !tags.contains(*t)) {
            ops.push(WriteOp::srem(tag_key(stale), key));
        }
        for tag in tags {
            ops.push(WriteOp::sadd(tag_key(tag), key));
            ops.push(WriteOp::sadd(index.clone(), tag.clone()));
        }
        if let (Some(ttl), false) = (effective_ttl(ttl), tags.is_empty()) {
            ops.push(WriteOp::expire(index, ttl));
        }
        Ok(ops)
    }

    // ========================================================================
    // INVALIDATION
    // ========================================================================

    /// Ops removing `key` from each of `tags` and dropping its reverse index.
    fn untag(key: &str, tags: &[String]) -> Vec<WriteOp> {
        let mut ops: Vec<WriteOp> = tags
            .iter()
            .map(|tag| WriteOp::srem(tag_key(tag), key))
            .collect();
        ops.push(WriteOp::del(key_tags_key(key)));
        ops
    }

    /// Ops removing `keys` from every tag set they belong to, plus their
    /// reverse indexes. The keys themselves are left alone.
    async fn untag_ops(&self, keys: &[String]) -> StoreResult<Vec<WriteOp>> {
        let mut ops = Vec::new();
        for key in keys {
            let tags = self.kv.smembers(&key_tags_key(key)).await?;
            if !tags.is_empty() {
                ops.extend(Self::untag(key, &tags));
            }
        }
        Ok(ops)
    }

    /// Delete every key recorded under `tag`, then the tag itself.
    /// Returns the number of member keys invalidated.
    ///
    /// Members whose reverse index no longer lists `tag` were retagged by a
    /// later write; they lose the stale membership but keep their value.
    pub async fn invalidate_by_tag(&self, tag: &str) -> u64 {
        match self.try_invalidate_by_tag(tag).await {
            Ok(count) => {
                if count > 0 {
                    tracing::debug!(tag = %tag, count, "Invalidated cache tag");
                }
                count
            }
            Err(e) => {
                tracing::warn!(tag = %tag, error = %e, "Cache tag invalidation failed");
                0
            }
        }
    }

    async fn try_invalidate_by_tag(&self, tag: &str) -> StoreResult<u64> {
        let set = tag_key(tag);
        let members = self.kv.smembers(&set).await?;
        if members.is_empty() {
            return Ok(0);
        }

        let mut ops = Vec::new();
        let mut invalidated = 0;
        for key in &members {
            let tags = self.kv.smembers(&key_tags_key(key)).await?;
            if tags.iter().any(|t| t == tag) {
                ops.extend(Self::untag(key, &tags));
                ops.push(WriteOp::del(key.clone()));
                invalidated += 1;
            }
        }
        ops.push(WriteOp::del(set));
        self.kv.apply(ops).await?;
        Ok(invalidated)
    }

    /// Drop tag memberships whose key no longer carries the tag, which covers
    /// expired entries and entries retagged by a racing write. Tag sets left
    /// empty disappear with their last member. Returns the memberships
    /// removed.
    pub async fn prune_tags(&self) -> StoreResult<u64> {
        let sets = self.kv.keys(&format!("{}*", TAG_PREFIX)).await?;
        let mut removed = 0;
        for set in sets {
            let Some(tag) = set.strip_prefix(TAG_PREFIX) else {
                continue;
            };
            let mut ops = Vec::new();
            for key in self.kv.smembers(&set).await? {
                let tags = self.kv.smembers(&key_tags_key(&key)).await?;
                if !tags.iter().any(|t| t == tag) {
                    ops.push(WriteOp::srem(set.clone(), key));
                }
            }
            if !ops.is_empty() {
                removed += ops.len() as u64;
                self.kv.apply(ops).await?;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "Pruned stale cache tag memberships");
        }
        Ok(removed)
    }

    /// Remove entries and their tag memberships. Returns how many existed.
    pub async fn del(&self, keys: &[String]) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        let result: StoreResult<u64> = async {
            let ops = self.untag_ops(keys).await?;
            if !ops.is_empty() {
                self.kv.apply(ops).await?;
            }
            self.kv.del(keys).await
        }
        .await;
        match result {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(keys = ?keys, error = %e, "Cache delete failed");
                0
            }
        }
    }

    // ========================================================================
    // WARMING + STATS
    // ========================================================================

    /// Run all producers concurrently and store whatever succeeded.
    ///
    /// A failing producer is logged and skipped; it never stops its siblings.
    pub async fn warm<T, E, Fut, I>(&self, producers: I, ttl: Option<Duration>) -> WarmReport
    where
        T: Serialize,
        E: Display,
        Fut: Future<Output = Result<T, E>>,
        I: IntoIterator<Item = (String, Fut)>,
    {
        let results = join_all(
            producers
                .into_iter()
                .map(|(key, producer)| async move { (key, producer.await) }),
        )
        .await;

        let mut report = WarmReport::default();
        let mut entries = Vec::new();
        for (key, result) in results {
            match result {
                Ok(value) => entries.push((key, value)),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Cache warm producer failed");
                    report.failed.push(key);
                }
            }
        }

        match self.try_mset(&entries, ttl).await {
            Ok(written) => report.stored = written,
            Err(e) => {
                tracing::warn!(error = %e, "Cache warm write failed");
                report
                    .failed
                    .extend(entries.into_iter().map(|(key, _)| key));
            }
        }

        tracing::info!(
            stored = report.stored.len(),
            failed = report.failed.len(),
            "Cache warmed"
        );
        report
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Log the counters, optionally zeroing them.
    pub fn report_stats(&self, reset: bool) -> CacheStatsSnapshot {
        let snapshot = if reset {
            self.stats.take()
        } else {
            self.stats.snapshot()
        };
        tracing::info!(
            hits = snapshot.hits,
            misses = snapshot.misses,
            errors = snapshot.errors,
            hit_rate = format!("{:.2}%", snapshot.hit_rate * 100.0),
            reset,
            "Cache statistics"
        );
        snapshot
    }

    // ========================================================================
    // COUNTERS
    // ========================================================================

    /// Count one event in the fixed window stored at `key`.
    ///
    /// The first increment creates the key with a `window` expiry. If the key
    /// expired between the create attempt and the increment, `INCR` returns 1
    /// on a key without expiry and the expiry is applied again.
    pub async fn increment_window(&self, key: &str, window: Duration) -> StoreResult<WindowCount> {
        if self.kv.set_nx(key, "1", Some(window)).await? {
            return Ok(WindowCount {
                count: 1,
                resets_in: window,
            });
        }

        let count = self.kv.incr(key).await?;
        if count == 1 {
            self.kv.expire(key, window).await?;
            return Ok(WindowCount {
                count,
                resets_in: window,
            });
        }

        let resets_in = match self.kv.pttl(key).await? {
            Some(remaining) => remaining,
            None => {
                self.kv.expire(key, window).await?;
                window
            }
        };
        Ok(WindowCount { count, resets_in })
    }

    /// Increment a counter, applying `ttl_on_create` when it is new.
    pub async fn increment(&self, key: &str, ttl_on_create: Option<Duration>) -> StoreResult<i64> {
        let count = self.kv.incr(key).await?;
        if count == 1 {
            if let Some(ttl) = effective_ttl(ttl_on_create) {
                self.kv.expire(key, ttl).await?;
            }
        }
        Ok(count)
    }

    /// Every stored key with its value decoded as JSON. Tag indexes are
    /// skipped; values that are not JSON come back as strings.
    pub async fn entries(&self) -> StoreResult<Vec<(String, serde_json::Value)>> {
        let keys: Vec<String> = self
            .kv
            .keys("*")
            .await?
            .into_iter()
            .filter(|k| !is_index_key(k))
            .collect();
        let values = self.kv.mget(&keys).await?;
        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, raw)| {
                raw.map(|raw| {
                    let value = serde_json::from_str(&raw)
                        .unwrap_or(serde_json::Value::String(raw));
                    (key, value)
                })
            })
            .collect())
    }

    /// Tags currently recorded for `key`.
    pub async fn tags_of(&self, key: &str) -> StoreResult<BTreeSet<String>> {
        Ok(self
            .kv
            .smembers(&key_tags_key(key))
            .await?
            .into_iter()
            .collect())
    }

    /// Keys currently recorded under `tag`.
    pub async fn members_of(&self, tag: &str) -> StoreResult<BTreeSet<String>> {
        Ok(self.kv.smembers(&tag_key(tag)).await?.into_iter().collect())
    }
}
