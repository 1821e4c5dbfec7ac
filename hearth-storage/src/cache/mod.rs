//! Distributed cache.
//!
//! - `store`: [`CacheStore`], the JSON cache with tag invalidation and the
//!   counter primitives rate limiting builds on
//! - `stats`: advisory per-process hit/miss counters

mod stats;
mod store;

pub use stats::{CacheStats, CacheStatsSnapshot};
pub use store::{
    key_tags_key, tag_key, CacheStore, WarmReport, WindowCount, KEY_TAGS_PREFIX, TAG_PREFIX,
};
