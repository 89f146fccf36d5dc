//! Fetching assets from their source.
//!
//! The resolver only knows about [`AssetFetcher`]s, which fetch the encoded bytes of an asset
//! and turn them into the decoded item of the volatile tier. Most fetchers are assembled from a
//! [`SourceFetcher`] that knows where bytes come from, and an [`AssetDecoder`] that knows what
//! the bytes are, via [`Decoded`].

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use wayfarer_sources::RequestDescriptor;

use crate::caching::{CacheEntry, CacheKey, CacheName};

mod decode;
mod http;
mod local;
mod media;

pub use decode::{Image, ImageDecoder, ImageFormat, RawDecoder, Video, VideoDecoder, VideoFormat};
pub use http::HttpFetcher;
pub use local::{FilesystemLibrary, LocalAssetLibrary, LocalFetcher, LocalRequestId};
pub use media::MediaFetcher;

/// A single request to fetch an asset from its source.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// What to fetch.
    pub descriptor: RequestDescriptor,
    /// The normalized key of the asset.
    pub key: CacheKey,
    /// Triggered when the requesting resolver no longer needs the result.
    ///
    /// Fetchers may abort cooperatively, but are free to run to completion.
    pub cancel: CancellationToken,
}

/// Fetches the encoded bytes of an asset.
pub trait SourceFetcher: Send + Sync + 'static {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, CacheEntry<Bytes>>;
}

/// Turns encoded bytes into the value held by the volatile tier.
pub trait AssetDecoder: Send + Sync + 'static {
    /// The decoded item.
    type Item: Clone + Send + Sync + 'static;

    /// The persistent cache holding the encoded bytes.
    fn cache_name(&self) -> CacheName;

    /// Decodes `bytes`, failing with [`CacheError::Malformed`](crate::caching::CacheError::Malformed).
    fn decode(&self, bytes: &Bytes) -> CacheEntry<Self::Item>;

    /// The approximate in-memory cost of `item`, in bytes.
    fn weight(&self, item: &Self::Item) -> u32;
}

/// The fetcher used by an [`AssetResolver`](crate::resolver::AssetResolver).
pub trait AssetFetcher: Send + Sync + 'static {
    /// The decoded item.
    type Item: Clone + Send + Sync + 'static;

    /// The persistent cache holding the encoded bytes.
    fn cache_name(&self) -> CacheName;

    /// Fetches the encoded bytes of an asset from its source.
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, CacheEntry<Bytes>>;

    /// Decodes fetched or persisted bytes.
    fn decode(&self, bytes: &Bytes) -> CacheEntry<Self::Item>;

    /// The approximate in-memory cost of `item`, in bytes.
    fn weight(&self, item: &Self::Item) -> u32;
}

/// An [`AssetFetcher`] combining a [`SourceFetcher`] with an [`AssetDecoder`].
#[derive(Debug, Clone)]
pub struct Decoded<S, D> {
    source: S,
    decoder: D,
}

impl<S, D> Decoded<S, D> {
    pub fn new(source: S, decoder: D) -> Self {
        Self { source, decoder }
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: SourceFetcher, D: AssetDecoder> AssetFetcher for Decoded<S, D> {
    type Item = D::Item;

    fn cache_name(&self) -> CacheName {
        self.decoder.cache_name()
    }

    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, CacheEntry<Bytes>> {
        self.source.fetch(request)
    }

    fn decode(&self, bytes: &Bytes) -> CacheEntry<Self::Item> {
        self.decoder.decode(bytes)
    }

    fn weight(&self, item: &Self::Item) -> u32 {
        self.decoder.weight(item)
    }
}

impl<T: SourceFetcher + ?Sized> SourceFetcher for std::sync::Arc<T> {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, CacheEntry<Bytes>> {
        (**self).fetch(request)
    }
}
