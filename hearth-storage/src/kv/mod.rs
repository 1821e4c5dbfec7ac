//! Key-value store seam.
//!
//! Every shared piece of state (cache entries, tag indexes, lock records,
//! rate-limit windows) lives behind [`KeyValueStore`]. The operation set
//! mirrors the Redis commands the production backend issues, so the
//! in-memory implementation can be used wherever Redis is not configured.

use async_trait::async_trait;
use hearth_core::StoreResult;
use std::time::Duration;

mod memory;
#[cfg(feature = "redis")]
mod redis_backend;

pub use memory::InMemoryKvStore;
#[cfg(feature = "redis")]
pub use redis_backend::{RedisKvStore, RedisStoreConfig};

/// A single write executed as part of an atomic [`KeyValueStore::apply`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
}

impl WriteOp {
    pub fn set(key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        WriteOp::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        WriteOp::Del { key: key.into() }
    }

    pub fn expire(key: impl Into<String>, ttl: Duration) -> Self {
        WriteOp::Expire {
            key: key.into(),
            ttl,
        }
    }

    pub fn sadd(key: impl Into<String>, member: impl Into<String>) -> Self {
        WriteOp::SAdd {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn srem(key: impl Into<String>, member: impl Into<String>) -> Self {
        WriteOp::SRem {
            key: key.into(),
            member: member.into(),
        }
    }
}

/// Shared key-value store.
///
/// String values and string sets live in one keyspace. Operations against a
/// key holding the other kind fail with `StoreError::WrongType`. A `ttl` of
/// `None` or zero stores the key without expiry.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// `GET key`
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// `SET key value [PX ttl]`. Overwrites and clears any previous expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// `SET key value NX [PX ttl]`. Returns `true` when the key was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool>;

    /// `INCR key`. A missing key starts at zero and is created without expiry.
    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.incr_by(key, 1).await
    }

    /// `INCRBY key delta`, with the same creation rules as `incr`.
    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// `PEXPIRE key ttl`. Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// `PTTL key`. `None` when the key is missing or has no expiry.
    async fn pttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// `MGET keys...`, in input order.
    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>>;

    /// `KEYS pattern` with `*` and `?` globs.
    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// `DEL keys...`. Returns how many keys existed.
    async fn del(&self, keys: &[String]) -> StoreResult<u64>;

    /// `SADD key members...`. Returns how many members were new.
    async fn sadd(&self, key: &str, members: &[String]) -> StoreResult<u64>;

    /// `SREM key members...`. Returns how many members were removed.
    async fn srem(&self, key: &str, members: &[String]) -> StoreResult<u64>;

    /// `SMEMBERS key`. A missing key is an empty set.
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Delete `key` only when its value equals `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Replace the value of `key` only when it currently equals `expected`.
    /// The key's expiry is cleared. Returns `false` when the key is missing
    /// or holds something else.
    async fn set_if_equals(&self, key: &str, expected: &str, value: &str) -> StoreResult<bool>;

    /// Execute the writes as one atomic unit (`MULTI`/`EXEC`).
    async fn apply(&self, ops: Vec<WriteOp>) -> StoreResult<()>;

    /// Round-trip used by readiness checks.
    async fn ping(&self) -> StoreResult<()>;
}

/// Normalize a caller TTL: zero means "no expiry".
pub(crate) fn effective_ttl(ttl: Option<Duration>) -> Option<Duration> {
    ttl.filter(|t| !t.is_zero())
}

/// Glob match supporting `*` (any run) and `?` (any single char).
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let c: Vec<char> = candidate.chars().collect();
    let (mut pi, mut ci) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while ci < c.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == c[ci]) {
            pi += 1;
            ci += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            resume = ci;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            resume += 1;
            ci = resume;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("cache:tag:*", "cache:tag:posts"));
        assert!(!glob_match("cache:tag:*", "cache:keytags:posts"));
        assert!(glob_match("lock:user-?", "lock:user-7"));
        assert!(glob_match("a*b*c", "a-xx-b-yy-c"));
        assert!(!glob_match("a*b*c", "a-xx-b-yy"));
        assert!(glob_match("", ""));
    }

    #[test]
    fn test_zero_ttl_means_no_expiry() {
        assert_eq!(effective_ttl(Some(Duration::ZERO)), None);
        assert_eq!(
            effective_ttl(Some(Duration::from_secs(1))),
            Some(Duration::from_secs(1))
        );
    }
}
