//! # Wayfarer Caching infrastructure
//!
//! Every list and detail screen resolves media through the same layered caches, so that
//! scrolling back and forth never reloads what was already shown.
//!
//! ## Cache Layers
//!
//! - A volatile in-memory layer ([`VolatileCache`]) holding decoded values, bounded by a cost
//!   budget. It may evict anything at any time.
//! - A persistent file-system layer ([`PersistentCache`]) holding the encoded bytes, which
//!   survives restarts. It is gated by [`Config::cache_dir`](crate::config::Config::cache_dir).
//! - The fetch-from-source path, implemented by the fetchers in [`crate::fetch`].
//!
//! A resolution goes through the layers in order, and a hit in a lower layer populates the
//! layers above it. See [`AssetResolver`](crate::resolver::AssetResolver) for the details.
//!
//! ### Metrics
//!
//! Each of these is tagged with a `cache` field naming the [`CacheName`]:
//!
//! - `caches.access`: All resolutions.
//! - `caches.memory.hit`: Resolutions served by the in-memory layer.
//! - `caches.file.hit` / `caches.file.miss`: Lookups in the file-system layer.
//! - `caches.file.write`: Entries written to the file-system layer.
//! - `caches.file.size`: A histogram of the size (in bytes) of loaded / written entries.
//! - `resolver.fetch`: Actual fetches not served by any of the layers.
//!
//! ## [`CacheKey`]
//!
//! The [`CacheKey`] is derived from a request by the [`KeyNormalizer`]. It carries
//! human-readable metadata, which is SHA256-hashed to form the key and the file name of the
//! persistent entry.
//!
//! **NOTE**: Changing how the metadata is written moves every entry to a new key, and
//! effectively empties the persistent caches.
use std::io;

use crate::config::Config;

mod cache_error;
mod cache_key;
mod config;
mod fs;
mod memory;

pub use cache_error::{CacheEntry, CacheError};
pub use cache_key::{CacheKey, DEFAULT_IGNORED_QUERY_PARAMS, KeyNormalizer};
pub use config::CacheName;
pub use fs::{CACHE_VERSION, PersistentCache};
pub use memory::VolatileCache;

/// The persistent caches of all media kinds.
#[derive(Debug, Clone)]
pub struct Caches {
    pub images: PersistentCache,
    pub videos: PersistentCache,
}

impl Caches {
    pub fn from_config(config: &Config) -> io::Result<Self> {
        Ok(Self {
            images: PersistentCache::from_config(CacheName::Images, config)?,
            videos: PersistentCache::from_config(CacheName::Videos, config)?,
        })
    }

    /// Returns the persistent cache with the given name.
    pub fn get(&self, name: CacheName) -> &PersistentCache {
        match name {
            CacheName::Images => &self.images,
            CacheName::Videos => &self.videos,
        }
    }

    /// Clear the temporary files left behind by a previous run.
    pub fn clear_tmp(&self, config: &Config) -> io::Result<()> {
        fs::clear_tmp(config)
    }

    /// Removes all persisted entries of every cache.
    pub async fn clear(&self) -> io::Result<()> {
        self.images.clear().await?;
        self.videos.clear().await
    }
}
