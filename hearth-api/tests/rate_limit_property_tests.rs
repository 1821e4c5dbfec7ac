//! Property-Based Tests for Rate Limiting
//!
//! **Property: Limits Hold**
//!
//! For any limit and any burst of requests from one caller:
//! - A fixed window admits exactly `min(requests, max)` of them
//! - A sliding window never admits more than `max` requests in one bucket
//! - Callers with different keys never share a budget

use std::sync::Arc;
use std::time::Duration;

use hearth_api::middleware::{user_key, RateLimitStrategy, RequestIdentity};
use hearth_api::{RateLimitConfig, RateLimiter};
use hearth_core::{Clock, ManualClock, UserId};
use hearth_storage::{CacheStore, InMemoryKvStore};
use hearth_test_utils::generators::arb_user_id;
use proptest::prelude::*;

// ============================================================================
// HELPERS
// ============================================================================

fn identity() -> RequestIdentity {
    RequestIdentity::new("192.0.2.10".parse().unwrap(), "/api/v1/agent-runs")
}

fn fixed_limiter(max: u64) -> RateLimiter {
    let cache = CacheStore::new(Arc::new(InMemoryKvStore::new()));
    let config = RateLimitConfig::new("prop", Duration::from_secs(60), max).unwrap();
    RateLimiter::new(config, cache)
}

fn sliding_limiter(max: u64, window_ms: u64, clock: Arc<ManualClock>) -> RateLimiter {
    let config = RateLimitConfig::new("prop-sliding", Duration::from_millis(window_ms), max)
        .unwrap()
        .with_strategy(RateLimitStrategy::SlidingWindow);
    RateLimiter::new(config, CacheStore::new(Arc::new(InMemoryKvStore::new()))).with_clock(clock)
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Within one window, exactly the first `max` requests pass and the
    /// remaining count never increases.
    #[test]
    fn prop_fixed_window_admits_min_of_requests_and_max(
        max in 1u64..20,
        requests in 0usize..60,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let limiter = fixed_limiter(max);
            let id = identity();

            let mut allowed = 0u64;
            let mut last_remaining = max;
            for i in 0..requests {
                let decision = limiter.check(&id).await;
                prop_assert_eq!(decision.limit, max);
                prop_assert!(decision.remaining <= last_remaining);
                last_remaining = decision.remaining;

                if decision.allowed {
                    allowed += 1;
                    prop_assert!((i as u64) < max, "request {} allowed past the limit", i);
                }
            }
            prop_assert_eq!(allowed, (requests as u64).min(max));
            Ok(())
        })?;
    }

    /// Every request is counted, so no bucket ever admits more than `max`
    /// regardless of how far the clock moves between requests.
    #[test]
    fn prop_sliding_window_bucket_never_exceeds_max(
        max in 1u64..10,
        window_ms in 100u64..2_000,
        steps in prop::collection::vec(0u64..700, 1..80),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let clock = Arc::new(ManualClock::new(1_000_000));
            let limiter = sliding_limiter(max, window_ms, clock.clone());
            let id = identity();

            let mut per_bucket: std::collections::BTreeMap<i64, u64> = Default::default();
            for step in steps {
                clock.advance(Duration::from_millis(step));
                let decision = limiter.check(&id).await;
                if decision.allowed {
                    let bucket = clock.now_ms().div_euclid(window_ms as i64);
                    *per_bucket.entry(bucket).or_default() += 1;
                }
            }
            for (bucket, admitted) in per_bucket {
                prop_assert!(
                    admitted <= max,
                    "bucket {} admitted {} > {}", bucket, admitted, max
                );
            }
            Ok(())
        })?;
    }

    /// One user exhausting their budget leaves another user untouched.
    #[test]
    fn prop_users_do_not_share_budget(
        a in arb_user_id(),
        b in arb_user_id(),
        max in 1u64..10,
    ) {
        prop_assume!(a != b);
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let limiter = fixed_limiter(max).with_key_fn(user_key());
            let first = identity().with_user(a);
            let second = identity().with_user(b);

            for _ in 0..max {
                prop_assert!(limiter.check(&first).await.allowed);
            }
            prop_assert!(!limiter.check(&first).await.allowed);

            let decision = limiter.check(&second).await;
            prop_assert!(decision.allowed);
            prop_assert_eq!(decision.remaining, max - 1);
            Ok(())
        })?;
    }
}

// ============================================================================
// EDGE CASES
// ============================================================================

#[tokio::test]
async fn test_sliding_window_recovers_after_idle_windows() {
    let clock = Arc::new(ManualClock::new(5_000));
    let limiter = sliding_limiter(2, 1_000, clock.clone());
    let id = identity().with_user(UserId::from(uuid::Uuid::nil()));

    assert!(limiter.check(&id).await.allowed);
    assert!(limiter.check(&id).await.allowed);
    assert!(!limiter.check(&id).await.allowed);

    clock.advance(Duration::from_millis(2_000));
    let decision = limiter.check(&id).await;
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 1);
}
