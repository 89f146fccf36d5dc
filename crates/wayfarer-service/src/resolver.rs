//! Resolution of assets through the cache tiers.
//!
//! An [`AssetPipeline`] bundles a fetcher with its volatile and persistent tier, and is shared
//! by all [`AssetResolver`]s displaying the same kind of media. Each resolver drives a single
//! display slot: it holds the state of the latest request of that slot, and publishes it
//! through a [`watch`] channel.
//!
//! Every request starts a new [`Generation`]. Completions of asynchronous work only apply if
//! their generation is still the current one, and if no terminal state was published for it
//! yet. A slot thus never displays the content of an older request, even if that request
//! completes last.

use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use wayfarer_sources::RequestDescriptor;

use crate::caching::{
    CacheEntry, CacheError, CacheKey, Caches, KeyNormalizer, PersistentCache, VolatileCache,
};
use crate::config::{Config, InMemoryCacheConfig};
use crate::fetch::{AssetFetcher, FetchRequest};

/// The state of a resolver slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionState<T> {
    /// Nothing was requested yet.
    Idle,
    /// The latest request is in progress.
    Loading,
    /// The latest request resolved to `T`.
    Resolved(T),
    /// The latest request failed. The UI is expected to show a placeholder.
    Failed(CacheError),
    /// The latest request was cancelled.
    Cancelled,
}

impl<T> ResolutionState<T> {
    /// Whether this state ends a request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved(_) | Self::Failed(_) | Self::Cancelled)
    }

    pub fn resolved(&self) -> Option<&T> {
        match self {
            Self::Resolved(value) => Some(value),
            _ => None,
        }
    }
}

/// Identifies a single request of a resolver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The cache tier that served a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Memory,
    File,
    Fetch,
}

impl AsRef<str> for CacheTier {
    fn as_ref(&self) -> &str {
        match self {
            Self::Memory => "memory",
            Self::File => "file",
            Self::Fetch => "fetch",
        }
    }
}

/// The value published by an [`AssetResolver`].
///
/// The generation is stored along with the state, so that checking the generation and
/// publishing a new state happens atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot<T> {
    /// The generation the state belongs to.
    pub generation: Generation,
    /// The state of that generation.
    pub state: ResolutionState<T>,
    /// The tier that produced the state, once it is terminal.
    pub tier: Option<CacheTier>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            generation: Generation::default(),
            state: ResolutionState::Idle,
            tier: None,
        }
    }
}

/// A fetcher together with the cache tiers of its items.
pub struct AssetPipeline<F: AssetFetcher> {
    inner: Arc<PipelineInner<F>>,
}

struct PipelineInner<F: AssetFetcher> {
    fetcher: Arc<F>,
    normalizer: KeyNormalizer,
    volatile: VolatileCache<CacheKey, F::Item>,
    persistent: PersistentCache,
}

impl<F: AssetFetcher> Clone for AssetPipeline<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: AssetFetcher> fmt::Debug for AssetPipeline<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetPipeline")
            .field("normalizer", &self.inner.normalizer)
            .field("volatile", &self.inner.volatile)
            .field("persistent", &self.inner.persistent)
            .finish()
    }
}

impl<F: AssetFetcher> AssetPipeline<F> {
    pub fn new(
        fetcher: F,
        normalizer: KeyNormalizer,
        in_memory: &InMemoryCacheConfig,
        persistent: PersistentCache,
    ) -> Self {
        let fetcher = Arc::new(fetcher);
        let weigher = {
            let fetcher = Arc::clone(&fetcher);
            move |item: &F::Item| fetcher.weight(item)
        };
        let volatile = VolatileCache::from_config(fetcher.cache_name(), in_memory, weigher);

        let inner = PipelineInner {
            fetcher,
            normalizer,
            volatile,
            persistent,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Creates a pipeline storing its bytes in the matching cache of `caches`.
    pub fn from_config(fetcher: F, config: &Config, caches: &Caches) -> Self {
        let normalizer = KeyNormalizer::new(&config.caches.ignored_query_params);
        let persistent = caches.get(fetcher.cache_name()).clone();
        Self::new(fetcher, normalizer, &config.caches.in_memory, persistent)
    }

    pub fn fetcher(&self) -> &F {
        &self.inner.fetcher
    }

    pub fn volatile(&self) -> &VolatileCache<CacheKey, F::Item> {
        &self.inner.volatile
    }

    pub fn persistent(&self) -> &PersistentCache {
        &self.inner.persistent
    }

    /// Derives the cache key of `descriptor`.
    pub fn key_for(&self, descriptor: &RequestDescriptor) -> CacheKey {
        self.inner.normalizer.normalize(descriptor)
    }

    /// Removes the asset described by `descriptor` from both tiers.
    pub async fn invalidate(&self, descriptor: &RequestDescriptor) -> std::io::Result<bool> {
        let key = self.key_for(descriptor);
        self.inner.volatile.remove(&key);
        self.inner.persistent.remove(&key).await
    }

    /// Resolves `descriptor` through all tiers, without a resolver slot.
    pub async fn resolve(&self, descriptor: &RequestDescriptor) -> (CacheEntry<F::Item>, CacheTier) {
        let key = self.key_for(descriptor);
        if let Some(item) = self.inner.volatile.get(&key) {
            return (Ok(item), CacheTier::Memory);
        }
        self.resolve_uncached(key, descriptor.clone(), CancellationToken::new())
            .await
    }

    /// Resolves an asset which is not in the volatile tier.
    async fn resolve_uncached(
        &self,
        key: CacheKey,
        descriptor: RequestDescriptor,
        cancel: CancellationToken,
    ) -> (CacheEntry<F::Item>, CacheTier) {
        let inner = &self.inner;

        if let Some(bytes) = inner.persistent.get(&key).await {
            match inner.fetcher.decode(&bytes) {
                Ok(item) => {
                    inner.volatile.set(key, item.clone());
                    return (Ok(item), CacheTier::File);
                }
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        key = %key,
                        "Discarding undecodable cache entry"
                    );
                    if let Err(err) = inner.persistent.remove(&key).await {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            "Failed to remove cache entry"
                        );
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return (Err(CacheError::Cancelled), CacheTier::Fetch);
        }

        let request = FetchRequest {
            descriptor,
            key: key.clone(),
            cancel,
        };
        let result = inner.fetcher.fetch(request).await.and_then(|bytes| {
            let item = inner.fetcher.decode(&bytes)?;
            Ok((bytes, item))
        });

        let (bytes, item) = match result {
            Ok(fetched) => fetched,
            Err(err) => {
                let cache_name = inner.fetcher.cache_name();
                metric!(
                    counter("resolver.fetch.error") += 1,
                    "cache" => cache_name.as_ref(),
                    "error" => err.metrics_tag()
                );
                return (Err(err), CacheTier::Fetch);
            }
        };

        inner.volatile.set(key.clone(), item.clone());
        self.persist(&key, bytes).await;

        (Ok(item), CacheTier::Fetch)
    }

    async fn persist(&self, key: &CacheKey, bytes: Bytes) {
        if let Err(err) = self.inner.persistent.set(key, bytes).await {
            // The entry will simply be missing next time.
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                key = %key,
                "Failed to persist fetched asset"
            );
        }
    }
}

/// Resolves the assets of a single display slot.
///
/// Requests must be made from within a tokio runtime, as misses in the volatile tier are
/// resolved on a spawned task. Dropping the resolver cancels its current request.
pub struct AssetResolver<F: AssetFetcher> {
    pipeline: AssetPipeline<F>,
    slot: Arc<watch::Sender<Slot<F::Item>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl<F: AssetFetcher> fmt::Debug for AssetResolver<F>
where
    F::Item: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetResolver")
            .field("slot", &*self.slot.borrow())
            .finish()
    }
}

impl<F: AssetFetcher> AssetResolver<F> {
    pub fn new(pipeline: AssetPipeline<F>) -> Self {
        let (slot, _) = watch::channel(Slot::default());
        Self {
            pipeline,
            slot: Arc::new(slot),
            cancel: Mutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &AssetPipeline<F> {
        &self.pipeline
    }

    /// Starts resolving `descriptor`, superseding any previous request.
    ///
    /// A hit in the volatile tier is resolved before this returns.
    pub fn request(&self, descriptor: RequestDescriptor) -> Generation {
        let key = self.pipeline.key_for(&descriptor);
        let cache_name = self.pipeline.fetcher().cache_name();
        metric!(counter("caches.access") += 1, "cache" => cache_name.as_ref());

        let cached = self.pipeline.volatile().get(&key);
        let cancel = cached.is_none().then(CancellationToken::new);

        // Held until the generation is bumped, the stored token belongs to the latest generation.
        let mut current = self.cancel.lock().unwrap();
        if let Some(previous) = std::mem::replace(&mut *current, cancel.clone()) {
            previous.cancel();
        }

        let mut generation = Generation::default();
        let is_hit = cached.is_some();
        self.slot.send_modify(|slot| {
            generation = slot.generation.next();
            slot.generation = generation;
            match cached {
                Some(item) => {
                    slot.state = ResolutionState::Resolved(item);
                    slot.tier = Some(CacheTier::Memory);
                }
                None => {
                    slot.state = ResolutionState::Loading;
                    slot.tier = None;
                }
            }
        });
        drop(current);
        tracing::trace!(%descriptor, %generation, is_hit, "Requested asset");

        if let Some(cancel) = cancel {
            let pipeline = self.pipeline.clone();
            let slot = Arc::clone(&self.slot);
            tokio::spawn(async move {
                let (result, tier) = pipeline.resolve_uncached(key, descriptor, cancel).await;
                publish(&slot, generation, result, tier);
            });
        }

        generation
    }

    /// Cancels the current request.
    ///
    /// A request which is still loading becomes [`ResolutionState::Cancelled`], a terminal state
    /// is left alone. Local fetches are aborted, remote fetches run to completion and still
    /// populate the caches.
    pub fn cancel(&self) {
        let mut current = self.cancel.lock().unwrap();
        let cancelled = self.slot.send_if_modified(|slot| {
            if !matches!(slot.state, ResolutionState::Loading) {
                return false;
            }
            slot.state = ResolutionState::Cancelled;
            true
        });
        if cancelled {
            tracing::trace!(generation = %self.slot.borrow().generation, "Cancelled asset request");
        }

        if let Some(cancel) = current.take() {
            cancel.cancel();
        }
    }

    /// The state of the current request.
    pub fn state(&self) -> ResolutionState<F::Item> {
        self.slot.borrow().state.clone()
    }

    /// The current generation along with its state.
    pub fn slot(&self) -> Slot<F::Item> {
        self.slot.borrow().clone()
    }

    /// Subscribes to all state changes.
    pub fn subscribe(&self) -> watch::Receiver<Slot<F::Item>> {
        self.slot.subscribe()
    }

    /// Waits until the current request is no longer loading.
    pub async fn settled(&self) -> Slot<F::Item> {
        let mut receiver = self.slot.subscribe();
        match receiver
            .wait_for(|slot| !matches!(slot.state, ResolutionState::Loading))
            .await
        {
            Ok(slot) => slot.clone(),
            // The sender is owned by `self`, so this is unreachable.
            Err(_) => self.slot(),
        }
    }
}

impl<F: AssetFetcher> Drop for AssetResolver<F> {
    fn drop(&mut self) {
        let cancel = match self.cancel.get_mut() {
            Ok(cancel) => cancel.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }
}

/// Publishes the `result` of `generation`, unless it was superseded.
fn publish<T>(
    slot: &watch::Sender<Slot<T>>,
    generation: Generation,
    result: CacheEntry<T>,
    tier: CacheTier,
) {
    let mut result = Some(result);
    let applied = slot.send_if_modified(|slot| {
        if slot.generation != generation || !matches!(slot.state, ResolutionState::Loading) {
            return false;
        }
        slot.state = match result.take() {
            Some(Ok(item)) => ResolutionState::Resolved(item),
            Some(Err(CacheError::Cancelled)) | None => ResolutionState::Cancelled,
            Some(Err(err)) => ResolutionState::Failed(err),
        };
        slot.tier = Some(tier);
        true
    });

    if applied {
        tracing::trace!(%generation, tier = tier.as_ref(), "Published asset resolution");
    } else {
        tracing::trace!(%generation, "Discarding superseded asset resolution");
        metric!(counter("resolver.stale_result") += 1, "tier" => tier.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::BoxFuture;
    use tokio::sync::Semaphore;
    use wayfarer_sources::{LocalAssetId, TargetSize};

    use crate::caching::CacheName;
    use crate::fetch::{Decoded, LocalAssetLibrary, LocalFetcher, LocalRequestId, RawDecoder};

    use super::*;

    /// Serves `content:<descriptor>` for every request.
    ///
    /// Descriptors containing `missing` fail with `NotFound`, and those containing `gated` wait
    /// for a permit of the gate.
    struct TestFetcher {
        calls: AtomicUsize,
        gate: Arc<Semaphore>,
    }

    impl Default for TestFetcher {
        fn default() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gate: Arc::new(Semaphore::new(0)),
            }
        }
    }

    impl AssetFetcher for TestFetcher {
        type Item = Bytes;

        fn cache_name(&self) -> CacheName {
            CacheName::Images
        }

        fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, CacheEntry<Bytes>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let gate = Arc::clone(&self.gate);
            let descriptor = request.descriptor.to_string();
            Box::pin(async move {
                if descriptor.contains("gated") {
                    let permit = gate.acquire().await.map_err(|_| CacheError::InternalError)?;
                    permit.forget();
                }
                if descriptor.contains("missing") {
                    return Err(CacheError::NotFound);
                }
                Ok(Bytes::from(format!("content:{descriptor}")))
            })
        }

        fn decode(&self, bytes: &Bytes) -> CacheEntry<Bytes> {
            if bytes.starts_with(b"content:") {
                Ok(bytes.clone())
            } else {
                Err(CacheError::Malformed("unexpected content".into()))
            }
        }

        fn weight(&self, item: &Bytes) -> u32 {
            item.len() as u32
        }
    }

    fn pipeline<F: AssetFetcher>(fetcher: F, persistent: PersistentCache) -> AssetPipeline<F> {
        AssetPipeline::new(
            fetcher,
            KeyNormalizer::default(),
            &InMemoryCacheConfig::default(),
            persistent,
        )
    }

    fn remote(url: &str) -> RequestDescriptor {
        RequestDescriptor::remote(url, TargetSize::ORIGINAL)
    }

    fn content(descriptor: &RequestDescriptor) -> Bytes {
        Bytes::from(format!("content:{descriptor}"))
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        let wait = async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap();
    }

    async fn with_timeout<T>(future: impl Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), future)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_volatile_hit_is_synchronous() {
        wayfarer_test::setup();
        let pipeline = pipeline(TestFetcher::default(), PersistentCache::disabled(CacheName::Images));
        let descriptor = remote("https://cdn.example.com/a.jpg");
        pipeline
            .volatile()
            .set(pipeline.key_for(&descriptor), Bytes::from_static(b"content:cached"));

        let resolver = AssetResolver::new(pipeline.clone());
        assert_eq!(resolver.state(), ResolutionState::Idle);

        let generation = resolver.request(descriptor);
        let slot = resolver.slot();
        assert_eq!(slot.generation, generation);
        assert_eq!(
            slot.state,
            ResolutionState::Resolved(Bytes::from_static(b"content:cached"))
        );
        assert_eq!(slot.tier, Some(CacheTier::Memory));
        assert_eq!(pipeline.fetcher().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_populates_both_tiers() {
        wayfarer_test::setup();
        let cache_dir = wayfarer_test::tempdir();
        let persistent = PersistentCache::new(CacheName::Images, cache_dir.path()).unwrap();
        let pipeline = pipeline(TestFetcher::default(), persistent);
        let resolver = AssetResolver::new(pipeline.clone());

        let descriptor = remote("https://cdn.example.com/a.jpg?X-Amz-Signature=1");
        resolver.request(descriptor.clone());
        assert_eq!(resolver.state(), ResolutionState::Loading);

        let slot = with_timeout(resolver.settled()).await;
        assert_eq!(slot.state, ResolutionState::Resolved(content(&descriptor)));
        assert_eq!(slot.tier, Some(CacheTier::Fetch));

        let key = pipeline.key_for(&descriptor);
        assert_eq!(pipeline.volatile().get(&key), Some(content(&descriptor)));
        assert_eq!(
            pipeline.persistent().get(&key).await,
            Some(content(&descriptor))
        );

        // a differently signed URL of the same content is served from memory
        resolver.request(remote("https://cdn.example.com/a.jpg?X-Amz-Signature=2"));
        assert_eq!(resolver.slot().tier, Some(CacheTier::Memory));
        assert_eq!(pipeline.fetcher().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persistent_hit() {
        wayfarer_test::setup();
        let cache_dir = wayfarer_test::tempdir();
        let persistent = PersistentCache::new(CacheName::Images, cache_dir.path()).unwrap();
        let pipeline = pipeline(TestFetcher::default(), persistent);

        let descriptor = RequestDescriptor::local("photo-1", TargetSize::new(64, 64));
        let key = pipeline.key_for(&descriptor);
        pipeline
            .persistent()
            .set(&key, Bytes::from_static(b"content:persisted"))
            .await
            .unwrap();

        let resolver = AssetResolver::new(pipeline.clone());
        resolver.request(descriptor.clone());
        let slot = with_timeout(resolver.settled()).await;
        assert_eq!(
            slot.state,
            ResolutionState::Resolved(Bytes::from_static(b"content:persisted"))
        );
        assert_eq!(slot.tier, Some(CacheTier::File));
        assert_eq!(pipeline.fetcher().calls.load(Ordering::SeqCst), 0);

        // the persistent hit was promoted to the volatile tier
        resolver.request(descriptor);
        assert_eq!(resolver.slot().tier, Some(CacheTier::Memory));
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_a_miss() {
        wayfarer_test::setup();
        let cache_dir = wayfarer_test::tempdir();
        let persistent = PersistentCache::new(CacheName::Images, cache_dir.path()).unwrap();
        let pipeline = pipeline(TestFetcher::default(), persistent);

        let descriptor = remote("https://cdn.example.com/torn.jpg");
        let key = pipeline.key_for(&descriptor);
        pipeline
            .persistent()
            .set(&key, Bytes::from_static(b"\0\0torn"))
            .await
            .unwrap();

        let resolver = AssetResolver::new(pipeline.clone());
        resolver.request(descriptor.clone());
        let slot = with_timeout(resolver.settled()).await;
        assert_eq!(slot.state, ResolutionState::Resolved(content(&descriptor)));
        assert_eq!(slot.tier, Some(CacheTier::Fetch));

        // the entry was replaced by the fetched content
        assert_eq!(
            pipeline.persistent().get(&key).await,
            Some(content(&descriptor))
        );
    }

    #[tokio::test]
    async fn test_fetch_failure() {
        wayfarer_test::setup();
        let pipeline = pipeline(TestFetcher::default(), PersistentCache::disabled(CacheName::Images));
        let resolver = AssetResolver::new(pipeline.clone());

        let descriptor = remote("https://cdn.example.com/missing.jpg");
        resolver.request(descriptor.clone());
        let slot = with_timeout(resolver.settled()).await;
        assert_eq!(slot.state, ResolutionState::Failed(CacheError::NotFound));
        assert_eq!(slot.tier, Some(CacheTier::Fetch));

        // failures are not cached, and there is no retry
        assert_eq!(pipeline.volatile().get(&pipeline.key_for(&descriptor)), None);
        assert_eq!(pipeline.fetcher().calls.load(Ordering::SeqCst), 1);

        // a new request is legal after a failure
        resolver.request(descriptor);
        with_timeout(resolver.settled()).await;
        assert_eq!(pipeline.fetcher().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_superseded_result_is_discarded() {
        wayfarer_test::setup();
        let pipeline = pipeline(TestFetcher::default(), PersistentCache::disabled(CacheName::Images));
        let resolver = AssetResolver::new(pipeline.clone());
        let mut updates = resolver.subscribe();

        let slow = remote("https://cdn.example.com/gated.jpg");
        let fast = remote("https://cdn.example.com/fast.jpg");

        let first = resolver.request(slow.clone());
        eventually(|| pipeline.fetcher().calls.load(Ordering::SeqCst) == 1).await;

        let second = resolver.request(fast.clone());
        assert!(second > first);
        let slot = with_timeout(resolver.settled()).await;
        assert_eq!(slot.generation, second);
        assert_eq!(slot.state, ResolutionState::Resolved(content(&fast)));

        // the slow request completes last, its result only lands in the caches
        updates.mark_unchanged();
        pipeline.fetcher().gate.add_permits(1);
        let slow_key = pipeline.key_for(&slow);
        eventually(|| pipeline.volatile().get(&slow_key).is_some()).await;

        assert!(!updates.has_changed().unwrap());
        assert_eq!(resolver.slot(), slot);
    }

    #[tokio::test]
    async fn test_cancel() {
        wayfarer_test::setup();
        let pipeline = pipeline(TestFetcher::default(), PersistentCache::disabled(CacheName::Images));
        let resolver = AssetResolver::new(pipeline.clone());

        // cancelling an idle resolver does nothing
        resolver.cancel();
        assert_eq!(resolver.state(), ResolutionState::Idle);

        let descriptor = remote("https://cdn.example.com/gated.jpg");
        resolver.request(descriptor.clone());
        eventually(|| pipeline.fetcher().calls.load(Ordering::SeqCst) == 1).await;

        resolver.cancel();
        assert_eq!(resolver.state(), ResolutionState::Cancelled);

        // the remote fetch runs to completion and populates the cache
        pipeline.fetcher().gate.add_permits(1);
        let key = pipeline.key_for(&descriptor);
        eventually(|| pipeline.volatile().get(&key).is_some()).await;
        assert_eq!(resolver.state(), ResolutionState::Cancelled);

        // a terminal state is left alone
        resolver.request(descriptor.clone());
        assert_eq!(resolver.state(), ResolutionState::Resolved(content(&descriptor)));
        resolver.cancel();
        assert_eq!(resolver.state(), ResolutionState::Resolved(content(&descriptor)));
    }

    #[tokio::test]
    async fn test_write_failure_is_not_fatal() {
        wayfarer_test::setup();
        let cache_dir = wayfarer_test::tempdir();
        let persistent = PersistentCache::new(CacheName::Images, cache_dir.path()).unwrap();
        std::fs::write(cache_dir.path().join("tmp"), b"in the way").unwrap();

        let pipeline = pipeline(TestFetcher::default(), persistent);
        let resolver = AssetResolver::new(pipeline.clone());

        let descriptor = remote("https://cdn.example.com/a.jpg");
        resolver.request(descriptor.clone());
        let slot = with_timeout(resolver.settled()).await;
        assert_eq!(slot.state, ResolutionState::Resolved(content(&descriptor)));

        let key = pipeline.key_for(&descriptor);
        assert_eq!(pipeline.persistent().get(&key).await, None);
    }

    /// A library whose requests never complete on their own.
    #[derive(Default)]
    struct StalledLibrary {
        requests: Mutex<Vec<LocalRequestId>>,
        cancelled: Mutex<Vec<LocalRequestId>>,
    }

    impl LocalAssetLibrary for StalledLibrary {
        fn request(
            &self,
            _id: &LocalAssetId,
            _target_size: TargetSize,
        ) -> (LocalRequestId, BoxFuture<'static, CacheEntry<Bytes>>) {
            let mut requests = self.requests.lock().unwrap();
            let id = LocalRequestId(requests.len() as u64);
            requests.push(id);
            (id, Box::pin(futures::future::pending()))
        }

        fn cancel(&self, request: LocalRequestId) {
            self.cancelled.lock().unwrap().push(request);
        }
    }

    #[tokio::test]
    async fn test_cancel_reaches_local_library() {
        wayfarer_test::setup();
        let library = Arc::new(StalledLibrary::default());
        let fetcher = Decoded::new(
            LocalFetcher::new(Arc::clone(&library)),
            RawDecoder(CacheName::Images),
        );
        let resolver = AssetResolver::new(pipeline(
            fetcher,
            PersistentCache::disabled(CacheName::Images),
        ));

        resolver.request(RequestDescriptor::local("photo-1", TargetSize::ORIGINAL));
        eventually(|| library.requests.lock().unwrap().len() == 1).await;

        resolver.cancel();
        assert_eq!(resolver.state(), ResolutionState::Cancelled);
        eventually(|| !library.cancelled.lock().unwrap().is_empty()).await;
        assert_eq!(*library.cancelled.lock().unwrap(), [LocalRequestId(0)]);

        // superseding a request, or dropping the resolver, cancels as well
        resolver.request(RequestDescriptor::local("photo-2", TargetSize::ORIGINAL));
        eventually(|| library.requests.lock().unwrap().len() == 2).await;
        resolver.request(RequestDescriptor::local("photo-3", TargetSize::ORIGINAL));
        eventually(|| library.requests.lock().unwrap().len() == 3).await;
        drop(resolver);

        eventually(|| library.cancelled.lock().unwrap().len() == 3).await;
        let mut cancelled = library.cancelled.lock().unwrap().clone();
        cancelled.sort();
        assert_eq!(cancelled, [LocalRequestId(0), LocalRequestId(1), LocalRequestId(2)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_requests_on_one_slot() {
        wayfarer_test::setup();

        for round in 0..50 {
            let library = Arc::new(StalledLibrary::default());
            let fetcher = Decoded::new(
                LocalFetcher::new(Arc::clone(&library)),
                RawDecoder(CacheName::Images),
            );
            let resolver = Arc::new(AssetResolver::new(pipeline(
                fetcher,
                PersistentCache::disabled(CacheName::Images),
            )));
            let barrier = Arc::new(tokio::sync::Barrier::new(2));

            let tasks: Vec<_> = ["a", "b"]
                .into_iter()
                .map(|name| {
                    let resolver = Arc::clone(&resolver);
                    let barrier = Arc::clone(&barrier);
                    tokio::spawn(async move {
                        barrier.wait().await;
                        let id = format!("photo-{round}-{name}");
                        resolver.request(RequestDescriptor::local(id, TargetSize::ORIGINAL))
                    })
                })
                .collect();
            let mut generations = Vec::new();
            for task in tasks {
                generations.push(task.await.unwrap());
            }
            generations.sort();

            // the latest generation owns the stored token
            assert_eq!(resolver.slot().generation, generations[1], "round {round}");
            let token = resolver.cancel.lock().unwrap().clone().unwrap();
            assert!(!token.is_cancelled(), "round {round}");

            eventually(|| !library.requests.lock().unwrap().is_empty()).await;
            assert_eq!(resolver.state(), ResolutionState::Loading, "round {round}");

            resolver.cancel();
            assert!(token.is_cancelled(), "round {round}");
            assert_eq!(resolver.state(), ResolutionState::Cancelled, "round {round}");
        }
    }

    #[tokio::test]
    async fn test_concurrent_slots() {
        wayfarer_test::setup();
        let cache_dir = wayfarer_test::tempdir();
        let persistent = PersistentCache::new(CacheName::Images, cache_dir.path()).unwrap();
        let pipeline = pipeline(TestFetcher::default(), persistent);

        let descriptors: Vec<_> = (0..16)
            .map(|i| remote(&format!("https://cdn.example.com/{}.jpg", i % 4)))
            .collect();
        let resolvers: Vec<_> = descriptors
            .iter()
            .map(|descriptor| {
                let resolver = AssetResolver::new(pipeline.clone());
                resolver.request(descriptor.clone());
                resolver
            })
            .collect();

        for (resolver, descriptor) in resolvers.iter().zip(&descriptors) {
            let slot = with_timeout(resolver.settled()).await;
            assert_eq!(slot.state, ResolutionState::Resolved(content(descriptor)));
        }
    }

    #[tokio::test]
    async fn test_pipeline_resolve() {
        wayfarer_test::setup();
        let cache_dir = wayfarer_test::tempdir();
        let persistent = PersistentCache::new(CacheName::Images, cache_dir.path()).unwrap();
        let pipeline = pipeline(TestFetcher::default(), persistent);
        let descriptor = remote("https://cdn.example.com/a.jpg");

        let (result, tier) = pipeline.resolve(&descriptor).await;
        assert_eq!(result, Ok(content(&descriptor)));
        assert_eq!(tier, CacheTier::Fetch);

        let (_, tier) = pipeline.resolve(&descriptor).await;
        assert_eq!(tier, CacheTier::Memory);

        assert!(pipeline.invalidate(&descriptor).await.unwrap());
        assert_eq!(pipeline.volatile().get(&pipeline.key_for(&descriptor)), None);
        let (_, tier) = pipeline.resolve(&descriptor).await;
        assert_eq!(tier, CacheTier::Fetch);
    }
}
