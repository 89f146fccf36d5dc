use std::hash::Hash;
use std::time::Duration;

use crate::config::InMemoryCacheConfig;

use super::CacheName;

type InMemoryCache<K, V> = moka::sync::Cache<K, V>;

/// The volatile cache tier, holding decoded values in memory.
///
/// The cache is bounded by a soft cost budget: every entry is weighed (roughly its size in
/// bytes), and entries are evicted once the total weight exceeds the capacity. Which entries
/// are evicted, and when, is up to the cache, so callers need to expect a miss for any key at
/// any time, even right after a hit.
///
/// The cache is safe to share between threads, and values are handed out as clones.
pub struct VolatileCache<K, V> {
    name: CacheName,
    cache: InMemoryCache<K, V>,
}

impl<K, V> std::fmt::Debug for VolatileCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolatileCache")
            .field("name", &self.name)
            .field("in-memory items", &self.cache.entry_count())
            .field("weighted size", &self.cache.weighted_size())
            .finish()
    }
}

impl<K, V> VolatileCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new cache with a `capacity` in weight units.
    ///
    /// The `weigher` gives the cost of keeping a value in memory.
    pub fn new<W>(
        name: CacheName,
        capacity: u64,
        time_to_idle: Option<Duration>,
        weigher: W,
    ) -> Self
    where
        W: Fn(&V) -> u32 + Send + Sync + 'static,
    {
        let mut builder = InMemoryCache::builder()
            .max_capacity(capacity)
            .name(name.as_ref())
            // NOTE: we count the key to the weight as well
            .weigher(move |_k: &K, v: &V| {
                (std::mem::size_of::<K>() as u32).saturating_add(weigher(v))
            });
        if let Some(time_to_idle) = time_to_idle {
            builder = builder.time_to_idle(time_to_idle);
        }

        Self {
            name,
            cache: builder.build(),
        }
    }

    /// Creates a new cache sized according to the configured capacity of the `name` cache.
    pub fn from_config<W>(name: CacheName, config: &InMemoryCacheConfig, weigher: W) -> Self
    where
        W: Fn(&V) -> u32 + Send + Sync + 'static,
    {
        let capacity = match name {
            CacheName::Images => config.images_capacity,
            CacheName::Videos => config.videos_capacity,
        };
        Self::new(name, capacity, config.time_to_idle, weigher)
    }

    pub fn name(&self) -> CacheName {
        self.name
    }

    /// Looks up the value for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.cache.get(key);
        if value.is_some() {
            metric!(counter("caches.memory.hit") += 1, "cache" => self.name.as_ref());
        }
        value
    }

    /// Stores `value` for `key`, replacing any previous value.
    pub fn set(&self, key: K, value: V) {
        self.cache.insert(key, value);
    }

    /// Removes the value for `key`, if any.
    pub fn remove(&self, key: &K) {
        self.cache.invalidate(key);
    }

    /// Removes all values.
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// The approximate number of entries.
    ///
    /// Bookkeeping is done lazily, call [`run_pending_tasks`](Self::run_pending_tasks) for an
    /// up-to-date figure.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// The approximate total weight of all entries.
    pub fn weighted_size(&self) -> u64 {
        self.cache.weighted_size()
    }

    /// Runs pending eviction and bookkeeping work right away.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }
}
