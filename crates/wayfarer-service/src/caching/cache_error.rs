use std::time::Duration;

use thiserror::Error;

/// An error that happens when resolving an asset.
///
/// A cache miss is never represented by this type, lookups in the cache tiers return an
/// [`Option`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The asset was not found at its source.
    #[error("not found")]
    NotFound,
    /// The asset could not be fetched due to missing permissions.
    ///
    /// The attached string contains the source's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The asset could not be fetched due to a timeout.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The asset could not be fetched due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    ///
    /// The attached string contains the source's response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The asset was fetched successfully, but could not be decoded.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The fetcher is not able to handle this kind of request.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// The request was cancelled before the fetch completed.
    #[error("cancelled")]
    Cancelled,
    /// An unexpected error in wayfarer itself.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A short name of the error kind, used as a metrics tag.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::PermissionDenied(_) => "permissiondenied",
            Self::Timeout(_) => "timeout",
            Self::DownloadError(_) => "downloaderror",
            Self::Malformed(_) => "malformed",
            Self::Unsupported(_) => "unsupported",
            Self::Cancelled => "cancelled",
            Self::InternalError => "internalerror",
        }
    }
}

/// The result of fetching or decoding an asset, containing either `Ok(T)` or an error
/// denoting the reason why the asset is unavailable.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
