//! Support to fetch assets from the device media library.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::{AbortHandle, Abortable, BoxFuture};
use wayfarer_sources::{LocalAssetId, RequestDescriptor, TargetSize};

use crate::caching::{CacheEntry, CacheError};
use crate::utils::defer::defer;

use super::{FetchRequest, SourceFetcher};

/// Identifies a pending request to a [`LocalAssetLibrary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalRequestId(pub u64);

impl fmt::Display for LocalRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The device media library.
///
/// Requests are identified by a [`LocalRequestId`], by which they can be cancelled while
/// pending. A cancelled request resolves to [`CacheError::Cancelled`], or not at all.
pub trait LocalAssetLibrary: Send + Sync + 'static {
    /// Starts loading the asset `id`, scaled to fit `target_size` where supported.
    fn request(
        &self,
        id: &LocalAssetId,
        target_size: TargetSize,
    ) -> (LocalRequestId, BoxFuture<'static, CacheEntry<Bytes>>);

    /// Cancels a pending request. Unknown or finished requests are ignored.
    fn cancel(&self, request: LocalRequestId);
}

/// Fetcher for [`LocalAsset`](wayfarer_sources::LocalAsset)s.
///
/// While the library request is pending, triggering the [`FetchRequest::cancel`] token
/// cancels it by its request id.
#[derive(Debug)]
pub struct LocalFetcher<L> {
    library: Arc<L>,
}

impl<L> Clone for LocalFetcher<L> {
    fn clone(&self) -> Self {
        Self {
            library: Arc::clone(&self.library),
        }
    }
}

impl<L: LocalAssetLibrary> LocalFetcher<L> {
    pub fn new(library: Arc<L>) -> Self {
        Self { library }
    }

    pub fn library(&self) -> &Arc<L> {
        &self.library
    }
}

impl<L: LocalAssetLibrary> SourceFetcher for LocalFetcher<L> {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, CacheEntry<Bytes>> {
        let library = Arc::clone(&self.library);
        Box::pin(async move {
            let RequestDescriptor::LocalAsset(asset) = &request.descriptor else {
                return Err(CacheError::Unsupported(format!(
                    "cannot fetch {} asset from the media library",
                    request.descriptor.kind()
                )));
            };

            if request.cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            let (request_id, future) = library.request(&asset.id, asset.target_size);
            tracing::trace!(id = %asset.id, "Requested local asset {request_id}");

            tokio::select! {
                biased;

                _ = request.cancel.cancelled() => {
                    tracing::debug!(id = %asset.id, "Cancelling local asset request {request_id}");
                    library.cancel(request_id);
                    Err(CacheError::Cancelled)
                }
                result = future => result,
            }
        })
    }
}

/// A [`LocalAssetLibrary`] reading assets from files in a directory.
///
/// The id of an asset is its file name. Target sizes are ignored.
#[derive(Debug)]
pub struct FilesystemLibrary {
    root: PathBuf,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<LocalRequestId, AbortHandle>>>,
}

impl FilesystemLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            next_id: AtomicU64::new(0),
            pending: Default::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The number of requests which have neither completed nor been cancelled.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// The file backing `id`, if `id` is a plain file name.
    fn path_for(&self, id: &LocalAssetId) -> Option<PathBuf> {
        let name = id.as_str();
        let is_plain = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        is_plain.then(|| self.root.join(name))
    }
}

impl LocalAssetLibrary for FilesystemLibrary {
    fn request(
        &self,
        id: &LocalAssetId,
        _target_size: TargetSize,
    ) -> (LocalRequestId, BoxFuture<'static, CacheEntry<Bytes>>) {
        let request_id = LocalRequestId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let Some(path) = self.path_for(id) else {
            tracing::debug!(%id, "Rejecting local asset id which is not a file name");
            return (request_id, Box::pin(async { Err(CacheError::NotFound) }));
        };

        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        self.pending
            .lock()
            .unwrap()
            .insert(request_id, abort_handle);

        let pending = Arc::clone(&self.pending);
        let done = defer(move || {
            pending.lock().unwrap().remove(&request_id);
        });
        let read = Abortable::new(tokio::fs::read(path), abort_registration);

        let future = async move {
            let _done = done;
            match read.await {
                Ok(Ok(contents)) => Ok(Bytes::from(contents)),
                Ok(Err(err)) => Err(io_error(err)),
                Err(_aborted) => Err(CacheError::Cancelled),
            }
        };

        (request_id, Box::pin(future))
    }

    fn cancel(&self, request: LocalRequestId) {
        if let Some(handle) = self.pending.lock().unwrap().remove(&request) {
            handle.abort();
        }
    }
}

fn io_error(err: io::Error) -> CacheError {
    match err.kind() {
        io::ErrorKind::NotFound => CacheError::NotFound,
        io::ErrorKind::PermissionDenied => CacheError::PermissionDenied(err.to_string()),
        _ => CacheError::from_std_error(err),
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use crate::caching::KeyNormalizer;

    use super::*;

    fn request_for(id: &str) -> FetchRequest {
        let descriptor = RequestDescriptor::local(id, TargetSize::new(256, 256));
        FetchRequest {
            key: KeyNormalizer::default().normalize(&descriptor),
            descriptor,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_filesystem_library() {
        wayfarer_test::setup();
        let dir = wayfarer_test::tempdir();
        std::fs::write(dir.path().join("photo-1.jpg"), b"photo").unwrap();

        let fetcher = LocalFetcher::new(Arc::new(FilesystemLibrary::new(dir.path())));

        let body = fetcher.fetch(request_for("photo-1.jpg")).await.unwrap();
        assert_eq!(&body[..], b"photo");
        assert_eq!(
            fetcher.fetch(request_for("photo-2.jpg")).await,
            Err(CacheError::NotFound)
        );
        assert_eq!(fetcher.library().pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_ids_cannot_escape_root() {
        let dir = wayfarer_test::tempdir();
        let root = dir.path().join("library");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(dir.path().join("secret"), b"secret").unwrap();

        let library = FilesystemLibrary::new(&root);
        for id in ["../secret", "..", ".", "", "a/../../secret"] {
            let (_, future) = library.request(&LocalAssetId::new(id), TargetSize::ORIGINAL);
            assert_eq!(future.await, Err(CacheError::NotFound), "id {id:?}");
        }
    }

    #[tokio::test]
    async fn test_cancel_by_request_id() {
        let dir = wayfarer_test::tempdir();
        std::fs::write(dir.path().join("clip.mov"), b"clip").unwrap();
        let library = FilesystemLibrary::new(dir.path());

        let (first, pending) = library.request(&LocalAssetId::new("clip.mov"), TargetSize::ORIGINAL);
        let (second, other) = library.request(&LocalAssetId::new("clip.mov"), TargetSize::ORIGINAL);
        assert_ne!(first, second);
        assert_eq!(library.pending_requests(), 2);

        library.cancel(first);
        assert_eq!(pending.await, Err(CacheError::Cancelled));
        assert_eq!(other.await.unwrap(), Bytes::from_static(b"clip"));
        assert_eq!(library.pending_requests(), 0);

        // cancelling a finished request is a no-op
        library.cancel(second);
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_library() {
        let dir = wayfarer_test::tempdir();
        let fetcher = LocalFetcher::new(Arc::new(FilesystemLibrary::new(dir.path())));

        let request = request_for("photo-1.jpg");
        request.cancel.cancel();
        assert_eq!(fetcher.fetch(request).await, Err(CacheError::Cancelled));
        // no request was ever issued
        assert_eq!(fetcher.library().next_id.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_remote_unsupported() {
        let dir = wayfarer_test::tempdir();
        let fetcher = LocalFetcher::new(Arc::new(FilesystemLibrary::new(dir.path())));

        let descriptor = RequestDescriptor::remote("https://x.test/a.jpg", TargetSize::ORIGINAL);
        let request = FetchRequest {
            key: KeyNormalizer::default().normalize(&descriptor),
            descriptor,
            cancel: CancellationToken::new(),
        };
        assert!(matches!(
            fetcher.fetch(request).await,
            Err(CacheError::Unsupported(_))
        ));
    }
}
