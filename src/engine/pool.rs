// src/engine/pool.rs

use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, seq::SliceRandom};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    cache::{self, PoolCache},
    error::AppError,
    models::{question::PublicQuestion, topic::Topic},
    store::ContentStore,
};

/// An ordered, size-bounded selection of a topic's questions.
#[derive(Debug, Clone)]
pub struct QuestionPool {
    pub topic_id: i64,
    pub questions: Vec<PublicQuestion>,
    /// True when the ordering was served from the cache rather than freshly shuffled.
    pub from_cache: bool,
}

impl QuestionPool {
    pub fn ids(&self) -> Vec<i64> {
        self.questions.iter().map(|q| q.id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

/// Shuffles `ids` uniformly (Fisher-Yates) and keeps at most `size` of them.
pub fn draw<R: Rng + ?Sized>(mut ids: Vec<i64>, size: Option<usize>, rng: &mut R) -> Vec<i64> {
    ids.shuffle(rng);
    if let Some(size) = size {
        ids.truncate(size);
    }
    ids
}

/// Builds randomized question pools and keeps them, together with topic
/// metadata, in the pool cache.
pub struct QuestionPoolGenerator {
    store: Arc<dyn ContentStore>,
    cache: Arc<dyn PoolCache>,
    pool_ttl: Duration,
    topic_ttl: Duration,
}

impl QuestionPoolGenerator {
    pub fn new(
        store: Arc<dyn ContentStore>,
        cache: Arc<dyn PoolCache>,
        pool_ttl: Duration,
        topic_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            pool_ttl,
            topic_ttl,
        }
    }

    /// Topic metadata, read through the cache.
    pub async fn topic(&self, topic_id: i64) -> Result<Topic, AppError> {
        let generation = self.generation(topic_id).await;
        self.topic_at(topic_id, generation).await
    }

    async fn topic_at(&self, topic_id: i64, generation: Option<u64>) -> Result<Topic, AppError> {
        let key = generation.map(|generation| cache::topic_key(topic_id, generation));
        if let Some(key) = &key {
            if let Some(topic) = self.cache_get::<Topic>(key).await {
                return Ok(topic);
            }
        }

        let topic = self
            .store
            .get_topic(topic_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Topic {} not found", topic_id)))?;

        if let Some(key) = &key {
            self.cache_put(key, &topic, self.topic_ttl).await;
        }
        Ok(topic)
    }

    /// Returns the pool for `topic_id`.
    ///
    /// `desired_size` falls back to the topic's configured question count, and
    /// to every active question when that is unset too. A cached pool is
    /// returned unchanged so that a resumed attempt sees the same order. An
    /// empty pool means the topic has no content; it is not an error.
    pub async fn get_pool(
        &self,
        topic_id: i64,
        desired_size: Option<usize>,
    ) -> Result<QuestionPool, AppError> {
        // Read before the store so that an invalidation racing this fill
        // leaves the result under a superseded key.
        let generation = self.generation(topic_id).await;
        let topic = self.topic_at(topic_id, generation).await?;
        let size = desired_size.or_else(|| topic.configured_pool_size());
        let key = generation.map(|generation| cache::pool_key(topic_id, generation, size));

        if let Some(key) = &key {
            if let Some(questions) = self.cache_get::<Vec<PublicQuestion>>(key).await {
                tracing::debug!(topic_id, key = %key, "Pool cache hit");
                return Ok(QuestionPool {
                    topic_id,
                    questions,
                    from_cache: true,
                });
            }
            tracing::debug!(topic_id, key = %key, "Pool cache miss");
        }

        let ids = self.store.active_question_ids(topic_id).await?;
        let ids = draw(ids, size, &mut rand::thread_rng());
        let questions = self.store.question_content(&ids).await?;

        if questions.is_empty() {
            tracing::warn!(topic_id, "Topic has no active questions");
        } else if let Some(key) = &key {
            self.cache_put(key, &questions, self.pool_ttl).await;
        }

        Ok(QuestionPool {
            topic_id,
            questions,
            from_cache: false,
        })
    }

    /// Drops every cached pool and the metadata of a topic.
    /// Cache failures are logged; the TTL bounds how long stale entries survive.
    pub async fn invalidate(&self, topic_id: i64) -> u64 {
        // Bump first: fills that read the store earlier can only write under
        // the old generation.
        match self.cache.incr(&cache::generation_key(topic_id)).await {
            Ok(generation) => tracing::debug!(topic_id, generation, "Topic cache generation bumped"),
            Err(e) => tracing::warn!(
                topic_id,
                backend = self.cache.backend(),
                "Failed to bump cache generation: {}",
                e
            ),
        }

        let mut removed = 0;
        for pattern in cache::topic_patterns(topic_id) {
            match self.cache.invalidate(&pattern).await {
                Ok(count) => removed += count,
                Err(e) => tracing::warn!(
                    topic_id,
                    backend = self.cache.backend(),
                    "Failed to invalidate '{}': {}",
                    pattern,
                    e
                ),
            }
        }
        tracing::info!(topic_id, removed, "Topic caches invalidated");
        removed
    }

    /// Cache generation of a topic. `None` when the cache cannot tell, in which
    /// case the caller neither reads nor fills the cache.
    async fn generation(&self, topic_id: i64) -> Option<u64> {
        match self.cache.counter(&cache::generation_key(topic_id)).await {
            Ok(generation) => Some(generation),
            Err(e) => {
                tracing::warn!(
                    topic_id,
                    backend = self.cache.backend(),
                    "Cache generation unavailable, bypassing cache: {}",
                    e
                );
                None
            }
        }
    }

    async fn cache_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.cache.get(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(backend = self.cache.backend(), "Cache read failed for '{}': {}", key, e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Discarding undecodable cache entry '{}': {}", key, e);
                None
            }
        }
    }

    async fn cache_put<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Failed to encode cache entry '{}': {}", key, e);
                return;
            }
        };

        if let Err(e) = self.cache.set_with_ttl(key, &raw, ttl).await {
            tracing::warn!(backend = self.cache.backend(), "Cache write failed for '{}': {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use rand::{SeedableRng, rngs::StdRng};
    use tokio::sync::{Notify, Semaphore};

    use super::*;
    use crate::cache::{CacheError, MemoryCache, NoopCache};
    use crate::store::MemoryStore;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    /// Cache whose every operation fails, as if the backend were unreachable.
    struct UnreachableCache;

    #[async_trait]
    impl PoolCache for UnreachableCache {
        fn backend(&self) -> &'static str {
            "unreachable"
        }

        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Codec(serde_json::from_str::<()>("!").unwrap_err()))
        }

        async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Codec(serde_json::from_str::<()>("!").unwrap_err()))
        }

        async fn invalidate(&self, _pattern: &str) -> Result<u64, CacheError> {
            Err(CacheError::Codec(serde_json::from_str::<()>("!").unwrap_err()))
        }

        async fn counter(&self, _key: &str) -> Result<u64, CacheError> {
            Err(CacheError::Codec(serde_json::from_str::<()>("!").unwrap_err()))
        }

        async fn incr(&self, _key: &str) -> Result<u64, CacheError> {
            Err(CacheError::Codec(serde_json::from_str::<()>("!").unwrap_err()))
        }
    }

    /// Memory cache that holds back the first write whose key starts with
    /// `prefix` until the test adds a permit to `release`.
    struct GatedCache {
        inner: MemoryCache,
        prefix: &'static str,
        armed: AtomicBool,
        reached: Notify,
        release: Semaphore,
    }

    impl GatedCache {
        fn new(prefix: &'static str) -> Self {
            Self {
                inner: MemoryCache::new(),
                prefix,
                armed: AtomicBool::new(true),
                reached: Notify::new(),
                release: Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl PoolCache for GatedCache {
        fn backend(&self) -> &'static str {
            "gated"
        }

        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.inner.get(key).await
        }

        async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
            if key.starts_with(self.prefix) && self.armed.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.release.acquire().await.unwrap().forget();
            }
            self.inner.set_with_ttl(key, value, ttl).await
        }

        async fn invalidate(&self, pattern: &str) -> Result<u64, CacheError> {
            self.inner.invalidate(pattern).await
        }

        async fn counter(&self, key: &str) -> Result<u64, CacheError> {
            self.inner.counter(key).await
        }

        async fn incr(&self, key: &str) -> Result<u64, CacheError> {
            self.inner.incr(key).await
        }
    }

    fn seeded_store(questions: usize, question_count: Option<i32>) -> (Arc<MemoryStore>, i64) {
        let store = Arc::new(MemoryStore::new());
        let topic_id = store.add_topic("Rust basics", 30, 70, question_count);
        for i in 0..questions {
            store.add_question(
                topic_id,
                &format!("Question {}", i),
                &[("right", true), ("wrong", false)],
            );
        }
        (store, topic_id)
    }

    fn generator(store: Arc<MemoryStore>, cache: Arc<dyn PoolCache>) -> QuestionPoolGenerator {
        QuestionPoolGenerator::new(store, cache, DAY, DAY)
    }

    #[test]
    fn test_draw_truncates_and_keeps_ids_unique() {
        let mut rng = StdRng::seed_from_u64(7);
        let drawn = draw((1..=20).collect(), Some(8), &mut rng);
        assert_eq!(drawn.len(), 8);
        let unique: HashSet<i64> = drawn.iter().copied().collect();
        assert_eq!(unique.len(), 8);
        assert!(drawn.iter().all(|id| (1..=20).contains(id)));
    }

    #[test]
    fn test_draw_is_roughly_uniform_over_permutations() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut seen: HashMap<Vec<i64>, u32> = HashMap::new();
        for _ in 0..6000 {
            *seen.entry(draw(vec![1, 2, 3], None, &mut rng)).or_default() += 1;
        }
        assert_eq!(seen.len(), 6);
        for count in seen.values() {
            assert!((850..=1150).contains(count), "skewed permutation count {}", count);
        }
    }

    #[tokio::test]
    async fn test_pool_is_bounded_by_available_questions() {
        let (store, topic_id) = seeded_store(5, None);
        let pools = generator(store, Arc::new(MemoryCache::new()));

        let pool = pools.get_pool(topic_id, Some(10)).await.unwrap();
        let ids = pool.ids();
        assert_eq!(ids.len(), 5);
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 5);
    }

    #[tokio::test]
    async fn test_size_falls_back_to_topic_question_count() {
        let (store, topic_id) = seeded_store(12, Some(4));
        let pools = generator(store, Arc::new(MemoryCache::new()));

        let pool = pools.get_pool(topic_id, None).await.unwrap();
        assert_eq!(pool.questions.len(), 4);
    }

    #[tokio::test]
    async fn test_unset_size_serves_every_question() {
        let (store, topic_id) = seeded_store(12, None);
        let pools = generator(store, Arc::new(MemoryCache::new()));

        let pool = pools.get_pool(topic_id, None).await.unwrap();
        assert_eq!(pool.questions.len(), 12);
    }

    #[tokio::test]
    async fn test_cached_pool_is_reused_verbatim() {
        let (store, topic_id) = seeded_store(30, Some(10));
        let pools = generator(store.clone(), Arc::new(MemoryCache::new()));

        let first = pools.get_pool(topic_id, None).await.unwrap();
        let second = pools.get_pool(topic_id, None).await.unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.ids(), second.ids());
        assert_eq!(store.question_id_reads(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_a_reshuffle() {
        let (store, topic_id) = seeded_store(30, Some(10));
        let cache = Arc::new(MemoryCache::new());
        let pools = generator(store.clone(), cache.clone());

        pools.get_pool(topic_id, None).await.unwrap();
        assert_eq!(store.question_id_reads(), 1);
        assert!(!cache.is_empty());

        // Pool entry plus topic metadata.
        assert_eq!(pools.invalidate(topic_id).await, 2);
        assert!(cache.is_empty());

        let regenerated = pools.get_pool(topic_id, None).await.unwrap();
        assert!(!regenerated.from_cache);
        assert_eq!(store.question_id_reads(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_picks_up_topic_edits() {
        let (store, topic_id) = seeded_store(3, None);
        let pools = generator(store.clone(), Arc::new(MemoryCache::new()));

        assert_eq!(pools.topic(topic_id).await.unwrap().pass_score, 70);
        store.set_pass_score(topic_id, 90);
        assert_eq!(pools.topic(topic_id).await.unwrap().pass_score, 70);

        pools.invalidate(topic_id).await;
        assert_eq!(pools.topic(topic_id).await.unwrap().pass_score, 90);
    }

    #[tokio::test]
    async fn test_pool_filled_across_an_invalidation_is_not_served() {
        let (store, topic_id) = seeded_store(3, None);
        let cache = Arc::new(GatedCache::new("exam:pool:"));
        let pools = Arc::new(generator(store.clone(), cache.clone()));

        let filling = tokio::spawn({
            let pools = pools.clone();
            async move { pools.get_pool(topic_id, None).await.unwrap() }
        });
        // The fill has read the store and is about to write the pool.
        cache.reached.notified().await;

        store.add_question(topic_id, "Added mid-fill", &[("yes", true), ("no", false)]);
        pools.invalidate(topic_id).await;
        cache.release.add_permits(1);

        assert_eq!(filling.await.unwrap().questions.len(), 3);

        let fresh = pools.get_pool(topic_id, None).await.unwrap();
        assert!(!fresh.from_cache);
        assert_eq!(fresh.questions.len(), 4);

        let cached = pools.get_pool(topic_id, None).await.unwrap();
        assert!(cached.from_cache);
        assert_eq!(cached.ids(), fresh.ids());
    }

    #[tokio::test]
    async fn test_metadata_filled_across_an_invalidation_is_not_served() {
        let (store, topic_id) = seeded_store(3, None);
        let cache = Arc::new(GatedCache::new("exam:topic:"));
        let pools = Arc::new(generator(store.clone(), cache.clone()));

        let filling = tokio::spawn({
            let pools = pools.clone();
            async move { pools.topic(topic_id).await.unwrap() }
        });
        cache.reached.notified().await;

        store.set_pass_score(topic_id, 90);
        pools.invalidate(topic_id).await;
        cache.release.add_permits(1);

        assert_eq!(filling.await.unwrap().pass_score, 70);
        assert_eq!(pools.topic(topic_id).await.unwrap().pass_score, 90);
    }

    #[tokio::test]
    async fn test_empty_topic_yields_empty_pool() {
        let (store, topic_id) = seeded_store(0, Some(10));
        let pools = generator(store.clone(), Arc::new(MemoryCache::new()));

        let pool = pools.get_pool(topic_id, None).await.unwrap();
        assert!(pool.is_empty());

        // Empty pools are not cached, so content added later shows up.
        store.add_question(topic_id, "Late addition", &[("yes", true), ("no", false)]);
        let pool = pools.get_pool(topic_id, None).await.unwrap();
        assert_eq!(pool.questions.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_topic_is_not_found() {
        let (store, _) = seeded_store(1, None);
        let pools = generator(store, Arc::new(NoopCache));

        let err = pools.get_pool(9999, None).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unreachable_cache_degrades_to_store_reads() {
        let (store, topic_id) = seeded_store(6, Some(3));
        let pools = generator(store.clone(), Arc::new(UnreachableCache));

        let first = pools.get_pool(topic_id, None).await.unwrap();
        let second = pools.get_pool(topic_id, None).await.unwrap();
        assert_eq!(first.questions.len(), 3);
        assert_eq!(second.questions.len(), 3);
        assert_eq!(store.question_id_reads(), 2);
        assert_eq!(pools.invalidate(topic_id).await, 0);
    }

    #[tokio::test]
    async fn test_pool_never_exposes_inactive_content() {
        let (store, topic_id) = seeded_store(2, None);
        let retired = store.add_question(topic_id, "Retired", &[("a", true), ("b", false)]);
        store.deactivate_question(retired);
        let pools = generator(store, Arc::new(NoopCache));

        let pool = pools.get_pool(topic_id, None).await.unwrap();
        assert_eq!(pool.questions.len(), 2);
        assert!(!pool.ids().contains(&retired));
    }
}
