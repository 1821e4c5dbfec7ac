//! In-process key-value store.
//!
//! Expiry is measured with `tokio::time::Instant`, so tests running under a
//! paused runtime can move past TTLs with `tokio::time::advance`. Expired keys
//! are invisible to every operation and are dropped lazily.

use async_trait::async_trait;
use hearth_core::{StoreError, StoreResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use super::{effective_ttl, glob_match, KeyValueStore, WriteOp};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: effective_ttl(ttl).map(|t| Instant::now() + t),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

type Map = HashMap<String, Slot>;

/// Mutex-guarded map implementing [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    data: Mutex<Map>,
    offline: AtomicBool,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while offline every operation fails with
    /// `StoreError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data
            .lock()
            .map(|map| map.values().filter(|s| s.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Map>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("in-memory store is offline"));
        }
        let mut guard = self
            .data
            .lock()
            .map_err(|_| StoreError::unavailable("in-memory store lock poisoned"))?;
        let now = Instant::now();
        guard.retain(|_, slot| slot.is_live(now));
        Ok(guard)
    }
}

fn read_str(map: &Map, key: &str) -> StoreResult<Option<String>> {
    match map.get(key) {
        None => Ok(None),
        Some(Slot {
            value: Value::Str(s),
            ..
        }) => Ok(Some(s.clone())),
        Some(_) => Err(StoreError::WrongType {
            key: key.to_string(),
        }),
    }
}

fn set_mut<'a>(map: &'a mut Map, key: &str) -> StoreResult<&'a mut BTreeSet<String>> {
    let slot = map
        .entry(key.to_string())
        .or_insert_with(|| Slot::new(Value::Set(BTreeSet::new()), None));
    match &mut slot.value {
        Value::Set(set) => Ok(set),
        Value::Str(_) => Err(StoreError::WrongType {
            key: key.to_string(),
        }),
    }
}

fn remove_members(map: &mut Map, key: &str, members: &[String]) -> StoreResult<u64> {
    let (removed, now_empty) = match map.get_mut(key) {
        None => return Ok(0),
        Some(Slot {
            value: Value::Set(set),
            ..
        }) => {
            let removed = members.iter().filter(|m| set.remove(*m)).count() as u64;
            (removed, set.is_empty())
        }
        Some(_) => {
            return Err(StoreError::WrongType {
                key: key.to_string(),
            })
        }
    };
    if now_empty {
        map.remove(key);
    }
    Ok(removed)
}

fn expire_in(map: &mut Map, key: &str, ttl: Duration) -> bool {
    if ttl.is_zero() {
        return map.remove(key).is_some();
    }
    match map.get_mut(key) {
        Some(slot) => {
            slot.expires_at = Some(Instant::now() + ttl);
            true
        }
        None => false,
    }
}

/// Validate a batch against the current map without mutating it, so a failing
/// batch leaves no partial writes behind.
fn validate(map: &Map, ops: &[WriteOp]) -> StoreResult<()> {
    let mut kinds: HashMap<&str, Option<bool>> = HashMap::new();
    for op in ops {
        match op {
            WriteOp::Set { key, .. } => {
                kinds.insert(key, Some(false));
            }
            WriteOp::Del { key } => {
                kinds.insert(key, None);
            }
            WriteOp::Expire { .. } => {}
            WriteOp::SAdd { key, .. } | WriteOp::SRem { key, .. } => {
                let is_str = match kinds.get(key.as_str()) {
                    Some(kind) => *kind == Some(false),
                    None => matches!(map.get(key), Some(Slot { value: Value::Str(_), .. })),
                };
                if is_str {
                    return Err(StoreError::WrongType { key: key.clone() });
                }
                kinds.insert(key, Some(true));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let map = self.lock()?;
        read_str(&map, key)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut map = self.lock()?;
        map.insert(key.to_string(), Slot::new(Value::Str(value.to_string()), ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        let mut map = self.lock()?;
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(key.to_string(), Slot::new(Value::Str(value.to_string()), ttl));
        Ok(true)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut map = self.lock()?;
        let slot = map
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::Str("0".to_string()), None));
        match &mut slot.value {
            Value::Str(raw) => {
                let current: i64 = raw.parse().map_err(|_| StoreError::NotAnInteger {
                    key: key.to_string(),
                })?;
                let next = current
                    .checked_add(delta)
                    .ok_or_else(|| StoreError::NotAnInteger {
                        key: key.to_string(),
                    })?;
                *raw = next.to_string();
                Ok(next)
            }
            Value::Set(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut map = self.lock()?;
        Ok(expire_in(&mut map, key, ttl))
    }

    async fn pttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let map = self.lock()?;
        let now = Instant::now();
        Ok(map
            .get(key)
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        let map = self.lock()?;
        // MGET reports non-string keys as nil rather than failing.
        Ok(keys
            .iter()
            .map(|k| read_str(&map, k).ok().flatten())
            .collect())
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let map = self.lock()?;
        let mut keys: Vec<String> = map
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        let mut map = self.lock()?;
        Ok(keys.iter().filter(|k| map.remove(k.as_str()).is_some()).count() as u64)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> StoreResult<u64> {
        let mut map = self.lock()?;
        let set = set_mut(&mut map, key)?;
        Ok(members.iter().filter(|m| set.insert((*m).clone())).count() as u64)
    }

    async fn srem(&self, key: &str, members: &[String]) -> StoreResult<u64> {
        let mut map = self.lock()?;
        remove_members(&mut map, key, members)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let map = self.lock()?;
        match map.get(key) {
            None => Ok(Vec::new()),
            Some(Slot {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut map = self.lock()?;
        if read_str(&map, key)?.as_deref() == Some(expected) {
            map.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn set_if_equals(&self, key: &str, expected: &str, value: &str) -> StoreResult<bool> {
        let mut map = self.lock()?;
        if read_str(&map, key)?.as_deref() != Some(expected) {
            return Ok(false);
        }
        map.insert(key.to_string(), Slot::new(Value::Str(value.to_string()), None));
        Ok(true)
    }

    async fn apply(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        let mut map = self.lock()?;
        validate(&map, &ops)?;
        for op in ops {
            match op {
                WriteOp::Set { key, value, ttl } => {
                    map.insert(key, Slot::new(Value::Str(value), ttl));
                }
                WriteOp::Del { key } => {
                    map.remove(&key);
                }
                WriteOp::Expire { key, ttl } => {
                    expire_in(&mut map, &key, ttl);
                }
                WriteOp::SAdd { key, member } => {
                    set_mut(&mut map, &key)?.insert(member);
                }
                WriteOp::SRem { key, member } => {
                    remove_members(&mut map, &key, std::slice::from_ref(&member))?;
                }
            }
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_expires_after_ttl() {
        let store = InMemoryKvStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(500)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        tokio::time::advance(Duration::from_millis(501)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_nx_respects_existing_key() {
        let store = InMemoryKvStore::new();
        let ttl = Some(Duration::from_secs(1));
        assert!(store.set_nx("lock:a", "one", ttl).await.unwrap());
        assert!(!store.set_nx("lock:a", "two", ttl).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap(), Some("one".to_string()));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.set_nx("lock:a", "two", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_creates_and_rejects_non_integers() {
        let store = InMemoryKvStore::new();
        assert_eq!(store.incr("n").await.unwrap(), 1);
        assert_eq!(store.incr("n").await.unwrap(), 2);
        assert_eq!(store.pttl("n").await.unwrap(), None);

        store.set("s", "abc", None).await.unwrap();
        assert!(matches!(
            store.incr("s").await,
            Err(StoreError::NotAnInteger { .. })
        ));
    }

    #[tokio::test]
    async fn test_incr_by_adds_delta() {
        let store = InMemoryKvStore::new();
        assert_eq!(store.incr_by("n", 5).await.unwrap(), 5);
        assert_eq!(store.incr_by("n", 7).await.unwrap(), 12);
        store.set("max", &i64::MAX.to_string(), None).await.unwrap();
        assert!(matches!(
            store.incr_by("max", 1).await,
            Err(StoreError::NotAnInteger { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_equals_swaps_only_expected_value() {
        let store = InMemoryKvStore::new();
        assert!(!store.set_if_equals("k", "a", "b").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "a", Some(Duration::from_secs(1))).await.unwrap();
        assert!(!store.set_if_equals("k", "x", "b").await.unwrap());
        assert!(store.set_if_equals("k", "a", "b").await.unwrap());
        assert_eq!(store.pttl("k").await.unwrap(), None);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("k").await.unwrap(), Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_sets_and_wrong_type() {
        let store = InMemoryKvStore::new();
        assert_eq!(store.sadd("tags", &keys(&["a", "b", "a"])).await.unwrap(), 2);
        assert_eq!(store.smembers("tags").await.unwrap(), keys(&["a", "b"]));
        assert!(matches!(
            store.get("tags").await,
            Err(StoreError::WrongType { .. })
        ));
        assert_eq!(store.srem("tags", &keys(&["a", "b"])).await.unwrap(), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_if_equals() {
        let store = InMemoryKvStore::new();
        store.set("lock:r", "token-1", None).await.unwrap();
        assert!(!store.delete_if_equals("lock:r", "token-2").await.unwrap());
        assert!(store.delete_if_equals("lock:r", "token-1").await.unwrap());
        assert_eq!(store.get("lock:r").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_apply_is_all_or_nothing() {
        let store = InMemoryKvStore::new();
        store.set("plain", "x", None).await.unwrap();

        let result = store
            .apply(vec![
                WriteOp::set("k1", "1", None),
                WriteOp::sadd("plain", "member"),
            ])
            .await;
        assert!(matches!(result, Err(StoreError::WrongType { .. })));
        assert_eq!(store.get("k1").await.unwrap(), None);

        store
            .apply(vec![
                WriteOp::set("k1", "1", None),
                WriteOp::sadd("t", "k1"),
                WriteOp::del("plain"),
            ])
            .await
            .unwrap();
        assert_eq!(store.get("k1").await.unwrap(), Some("1".to_string()));
        assert_eq!(store.smembers("t").await.unwrap(), keys(&["k1"]));
        assert_eq!(store.get("plain").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_and_mget() {
        let store = InMemoryKvStore::new();
        store.set("user:1", "a", None).await.unwrap();
        store.set("user:2", "b", None).await.unwrap();
        store.set("post:1", "c", None).await.unwrap();

        assert_eq!(
            store.keys("user:*").await.unwrap(),
            keys(&["user:1", "user:2"])
        );
        assert_eq!(
            store.mget(&keys(&["user:2", "nope", "post:1"])).await.unwrap(),
            vec![Some("b".to_string()), None, Some("c".to_string())]
        );
    }

    #[tokio::test]
    async fn test_offline_store_fails() {
        let store = InMemoryKvStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.ping().await,
            Err(StoreError::Unavailable { .. })
        ));
        store.set_offline(false);
        assert!(store.ping().await.is_ok());
    }
}
