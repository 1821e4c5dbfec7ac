//! Distributed mutex over the shared key-value store.
//!
//! A lock is the key `lock:<resource>` holding a random owner token. It is
//! taken with an atomic set-if-absent carrying the TTL and released with an
//! atomic compare-and-delete, so a holder whose lock already expired cannot
//! remove the lock of whoever took it next. There is no renewal: work that
//! outlives the TTL loses exclusivity.

use hearth_core::StoreResult;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::kv::KeyValueStore;

pub const LOCK_PREFIX: &str = "lock:";

pub fn lock_key(resource: &str) -> String {
    format!("{}{}", LOCK_PREFIX, resource)
}

/// Proof of a successful acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    resource: String,
    token: String,
    ttl: Duration,
}

impl LockToken {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[derive(Clone)]
pub struct DistributedLock {
    kv: Arc<dyn KeyValueStore>,
}

impl DistributedLock {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Try once to take the lock. `None` means another holder has it.
    pub async fn acquire(&self, resource: &str, ttl: Duration) -> StoreResult<Option<LockToken>> {
        let token = Uuid::new_v4().simple().to_string();
        let acquired = self
            .kv
            .set_nx(&lock_key(resource), &token, Some(ttl))
            .await?;

        if !acquired {
            tracing::debug!(resource = %resource, "Lock held elsewhere");
            return Ok(None);
        }

        tracing::debug!(resource = %resource, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
        Ok(Some(LockToken {
            resource: resource.to_string(),
            token,
            ttl,
        }))
    }

    /// Release the lock if `token` still owns it.
    ///
    /// `false` means the lock expired or now belongs to someone else; nothing
    /// was deleted.
    pub async fn release(&self, token: &LockToken) -> StoreResult<bool> {
        let released = self
            .kv
            .delete_if_equals(&lock_key(&token.resource), &token.token)
            .await?;
        if !released {
            tracing::warn!(
                resource = %token.resource,
                "Lock was no longer owned at release"
            );
        }
        Ok(released)
    }

    /// Run `f` while holding `resource`.
    ///
    /// Returns `Ok(None)` without running `f` when the lock is busy. Release is
    /// attempted after `f` completes; a failed release is logged, the result of
    /// `f` is still returned.
    pub async fn with_lock<F, Fut, T>(
        &self,
        resource: &str,
        ttl: Duration,
        f: F,
    ) -> StoreResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(token) = self.acquire(resource, ttl).await? else {
            return Ok(None);
        };

        let output = f().await;

        if let Err(e) = self.release(&token).await {
            tracing::warn!(resource = %resource, error = %e, "Lock release failed");
        }
        Ok(Some(output))
    }
}
