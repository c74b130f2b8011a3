//! Pool Cache: best-effort, TTL-bounded storage for randomized question pools
//! and topic metadata.
//!
//! Nothing in here is authoritative. Callers treat every [`CacheError`] as a
//! miss and fall back to the content store.

use std::time::Duration;

use async_trait::async_trait;

pub mod memory;
pub mod redis_cache;

pub use memory::MemoryCache;
pub use redis_cache::RedisCache;

const KEY_PREFIX: &str = "exam";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("cached value could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

#[async_trait]
pub trait PoolCache: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Removes every key matching a glob `pattern` (`*` wildcard). Returns how many were removed.
    async fn invalidate(&self, pattern: &str) -> Result<u64, CacheError>;

    /// Current value of a counter; 0 when it was never incremented.
    async fn counter(&self, key: &str) -> Result<u64, CacheError>;

    /// Atomically increments a counter and returns the new value. Counters never expire.
    async fn incr(&self, key: &str) -> Result<u64, CacheError>;
}

/// Cache that stores nothing; every lookup is a miss.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

#[async_trait]
impl PoolCache for NoopCache {
    fn backend(&self) -> &'static str {
        "none"
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Ok(None)
    }

    async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    async fn invalidate(&self, _pattern: &str) -> Result<u64, CacheError> {
        Ok(0)
    }

    async fn counter(&self, _key: &str) -> Result<u64, CacheError> {
        Ok(0)
    }

    async fn incr(&self, _key: &str) -> Result<u64, CacheError> {
        Ok(0)
    }
}

/// Counter bumped on every invalidation of a topic: `exam:gen:{topic}`.
///
/// Pool and metadata keys embed the generation they were read under, so a fill
/// that started before an invalidation lands on a key nobody reads any more.
pub fn generation_key(topic_id: i64) -> String {
    format!("{KEY_PREFIX}:gen:{topic_id}")
}

/// Key of a cached pool: `exam:pool:{topic}:{generation}:{size|all}`.
pub fn pool_key(topic_id: i64, generation: u64, size: Option<usize>) -> String {
    match size {
        Some(size) => format!("{KEY_PREFIX}:pool:{topic_id}:{generation}:{size}"),
        None => format!("{KEY_PREFIX}:pool:{topic_id}:{generation}:all"),
    }
}

/// Key of cached topic metadata: `exam:topic:{topic}:{generation}`.
pub fn topic_key(topic_id: i64, generation: u64) -> String {
    format!("{KEY_PREFIX}:topic:{topic_id}:{generation}")
}

/// Patterns covering every cached pool and metadata entry of a topic, whatever
/// its generation. The generation counter itself is not matched.
pub fn topic_patterns(topic_id: i64) -> [String; 2] {
    [
        format!("{KEY_PREFIX}:pool:{topic_id}:*"),
        format!("{KEY_PREFIX}:topic:{topic_id}:*"),
    ]
}

/// Glob match supporting `*` only, which is all the key scheme needs.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return key.is_empty();
    };
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };

    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // No wildcard at all.
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}
