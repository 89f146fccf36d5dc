//! Support to fetch remote assets over HTTP.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use wayfarer_sources::RequestDescriptor;

use crate::caching::{CacheEntry, CacheError, CacheKey};
use crate::config::{Config, TransportCacheConfig};
use crate::utils::http::{DownloadTimeouts, create_client};

use super::{FetchRequest, SourceFetcher};

type TransportCache = moka::future::Cache<CacheKey, Bytes>;

/// Fetcher for [`RemoteAsset`](wayfarer_sources::RemoteAsset)s.
///
/// Response bodies are kept in a transport-level cache keyed by the normalized [`CacheKey`],
/// which serves repeated requests without revalidation. Concurrent requests for the same key
/// share a single download. Errors are not cached.
///
/// Cancellation is not observed: a download runs to completion, so its result can still
/// populate the caches.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    inner: Arc<HttpFetcherInner>,
}

#[derive(Debug)]
struct HttpFetcherInner {
    client: Client,
    timeouts: DownloadTimeouts,
    transport: TransportCache,
}

impl HttpFetcher {
    pub fn new(client: Client, timeouts: DownloadTimeouts, config: &TransportCacheConfig) -> Self {
        let mut builder = TransportCache::builder()
            .max_capacity(config.capacity)
            .name("transport")
            .weigher(|k: &CacheKey, v: &Bytes| {
                let size = k.metadata().len() + v.len();
                u32::try_from(size).unwrap_or(u32::MAX)
            });
        if let Some(time_to_live) = config.time_to_live {
            builder = builder.time_to_live(time_to_live);
        }

        let inner = HttpFetcherInner {
            client,
            timeouts,
            transport: builder.build(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn from_config(config: &Config) -> reqwest::Result<Self> {
        let timeouts = DownloadTimeouts::from_config(config);
        let client = create_client(&timeouts, &config.user_agent)?;
        Ok(Self::new(client, timeouts, &config.caches.transport))
    }

    /// Drops all cached responses.
    pub fn clear(&self) {
        self.inner.transport.invalidate_all();
    }

    /// Fetches the remote asset at `url`, stored in the transport cache under `key`.
    pub async fn fetch_url(&self, url: &str, key: CacheKey) -> CacheEntry<Bytes> {
        let inner = &self.inner;
        let init = download(&inner.client, url, inner.timeouts);

        let entry = inner
            .transport
            .entry(key)
            .or_try_insert_with(init)
            .await
            .map_err(|err: Arc<CacheError>| (*err).clone())?;

        if !entry.is_fresh() {
            metric!(counter("http.transport_cache.hit") += 1);
        }
        Ok(entry.into_value())
    }
}

impl SourceFetcher for HttpFetcher {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, CacheEntry<Bytes>> {
        let fetcher = self.clone();
        Box::pin(async move {
            let RequestDescriptor::RemoteAsset(asset) = &request.descriptor else {
                return Err(CacheError::Unsupported(format!(
                    "cannot fetch {} asset over HTTP",
                    request.descriptor.kind()
                )));
            };
            fetcher.fetch_url(&asset.url, request.key).await
        })
    }
}

async fn download(client: &Client, url: &str, timeouts: DownloadTimeouts) -> CacheEntry<Bytes> {
    // Always fetch the original URL: ignored parameters may still be required by the server.
    let url = reqwest::Url::parse(url).map_err(|_| CacheError::NotFound)?;
    tracing::debug!("Fetching remote asset from `{}`", url);

    let start = Instant::now();
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|err| reqwest_error(err, timeouts, url.as_str()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(status_error(status, url.as_str()));
    }

    let body = response
        .bytes()
        .await
        .map_err(|err| reqwest_error(err, timeouts, url.as_str()))?;

    metric!(timer("http.download") = start.elapsed());
    metric!(time_raw("http.download.size") = body.len() as u64);

    Ok(body)
}

fn reqwest_error(err: reqwest::Error, timeouts: DownloadTimeouts, source: &str) -> CacheError {
    tracing::debug!(
        error = &err as &dyn std::error::Error,
        "Failed to fetch `{source}`"
    );
    if err.is_timeout() {
        CacheError::Timeout(timeouts.max_download)
    } else {
        CacheError::DownloadError(err.to_string())
    }
}

/// Converts an unsuccessful response status to an error.
fn status_error(status: StatusCode, source: &str) -> CacheError {
    if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
        tracing::debug!("Insufficient permissions to fetch `{source}`: {status}");
        CacheError::PermissionDenied(status.to_string())
    } else if status.is_client_error() {
        // If it's a client error, chances are it's a 404.
        tracing::debug!("Unexpected client error status code from `{source}`: {status}");
        CacheError::NotFound
    } else {
        tracing::debug!("Unexpected status code from `{source}`: {status}");
        CacheError::DownloadError(status.to_string())
    }
}
