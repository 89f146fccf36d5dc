use bytes::Bytes;
use futures::future::BoxFuture;
use wayfarer_sources::RequestDescriptor;

use crate::caching::CacheEntry;

use super::{FetchRequest, HttpFetcher, LocalAssetLibrary, LocalFetcher, SourceFetcher};

/// Dispatches requests to the local or the remote fetcher, depending on the descriptor.
#[derive(Debug)]
pub struct MediaFetcher<L> {
    local: LocalFetcher<L>,
    remote: HttpFetcher,
}

impl<L> Clone for MediaFetcher<L> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            remote: self.remote.clone(),
        }
    }
}

impl<L: LocalAssetLibrary> MediaFetcher<L> {
    pub fn new(local: LocalFetcher<L>, remote: HttpFetcher) -> Self {
        Self { local, remote }
    }

    pub fn local(&self) -> &LocalFetcher<L> {
        &self.local
    }

    pub fn remote(&self) -> &HttpFetcher {
        &self.remote
    }
}

impl<L: LocalAssetLibrary> SourceFetcher for MediaFetcher<L> {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, CacheEntry<Bytes>> {
        metric!(counter("resolver.fetch") += 1, "kind" => request.descriptor.kind());
        match request.descriptor {
            RequestDescriptor::LocalAsset(_) => self.local.fetch(request),
            RequestDescriptor::RemoteAsset(_) => self.remote.fetch(request),
        }
    }
}
