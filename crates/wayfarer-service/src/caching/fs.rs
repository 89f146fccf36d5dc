use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use crate::config::Config;

use super::{CacheEntry, CacheKey, CacheName};

/// The current version of the on-disk layout.
///
/// Bumping this (e.g. because the canonical decode size changed) effectively empties the
/// persistent caches, as entries are looked up under `v{VERSION}/` only.
pub const CACHE_VERSION: u32 = 1;

/// The persistent cache tier, holding encoded asset bytes on the file system.
///
/// Entries live at `<cache_dir>/<name>/<key path>`, where the key path is derived from the hash
/// of the [`CacheKey`] (see [`CacheKey::cache_path`]). The directory may be purged by the OS or
/// by [`clear`](Self::clear) at any time, so an entry written once is not guaranteed to be
/// found later.
///
/// When no cache directory is configured, every lookup is a miss and writes are discarded.
#[derive(Debug, Clone)]
pub struct PersistentCache {
    /// Cache identifier used for metric names.
    name: CacheName,

    /// Directory to use for storing cache items. Will be created if it does not exist.
    ///
    /// Leaving this as None will disable this cache.
    cache_dir: Option<PathBuf>,

    /// Directory to use for temporary files.
    ///
    /// When writing a new file into the cache it is written to a temporary file in this
    /// directory first, and once fully written it is atomically moved to its actual location
    /// within the [`cache_dir`](Self::cache_dir).
    tmp_dir: Option<PathBuf>,
}

impl PersistentCache {
    pub fn from_config(name: CacheName, config: &Config) -> io::Result<Self> {
        Self::with_dirs(name, config.cache_dir(name.as_ref()), config.cache_dir("tmp"))
    }

    /// Creates a cache stored in `<base_dir>/<name>`, using `<base_dir>/tmp` for temporary files.
    pub fn new(name: CacheName, base_dir: &Path) -> io::Result<Self> {
        Self::with_dirs(
            name,
            Some(base_dir.join(name.as_ref())),
            Some(base_dir.join("tmp")),
        )
    }

    /// Creates a disabled cache.
    pub fn disabled(name: CacheName) -> Self {
        Self {
            name,
            cache_dir: None,
            tmp_dir: None,
        }
    }

    fn with_dirs(
        name: CacheName,
        cache_dir: Option<PathBuf>,
        tmp_dir: Option<PathBuf>,
    ) -> io::Result<Self> {
        if let Some(ref dir) = cache_dir {
            std::fs::create_dir_all(dir)?;
        }

        Ok(Self {
            name,
            cache_dir,
            tmp_dir,
        })
    }

    pub fn name(&self) -> CacheName {
        self.name
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// The full path at which the entry for `key` is stored.
    pub fn entry_path(&self, key: &CacheKey) -> Option<PathBuf> {
        let cache_dir = self.cache_dir.as_ref()?;
        Some(cache_dir.join(key.cache_path(CACHE_VERSION)))
    }

    /// Looks up the bytes stored for `key`.
    ///
    /// All kinds of read errors are logged and treated as a miss.
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let name = self.name;
        let path = self.entry_path(key)?;
        tracing::trace!("Trying {} cache at path {}", name, path.display());

        match tokio::fs::read(&path).await {
            Ok(contents) => {
                metric!(counter("caches.file.hit") += 1, "cache" => name.as_ref());
                metric!(
                    time_raw("caches.file.size") = contents.len() as u64,
                    "hit" => "true",
                    "cache" => name.as_ref(),
                );
                Some(Bytes::from(contents))
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        path = %path.display(),
                        "Failed to read cache file",
                    );
                }
                // If this spikes, it's possible that the filesystem cache just got pruned.
                metric!(counter("caches.file.miss") += 1, "cache" => name.as_ref());
                None
            }
        }
    }

    /// Stores `contents` for `key`, replacing any previous entry.
    ///
    /// The write is atomic: concurrent readers either see the previous entry, or the complete
    /// new one. Errors are returned to the caller, but leave no partial entry behind.
    pub async fn set(&self, key: &CacheKey, contents: Bytes) -> CacheEntry {
        let name = self.name;
        let Some(path) = self.entry_path(key) else {
            return Ok(());
        };

        let temp_file = self.tempfile()?;
        let mut temp_fd = tokio::fs::File::from_std(temp_file.reopen()?);
        temp_fd.write_all(&contents).await?;
        temp_fd.flush().await?;
        drop(temp_fd);

        tracing::trace!("Creating {name} at path {:?}", path.display());
        persist_tempfile(temp_file, &path)?;

        metric!(counter("caches.file.write") += 1, "cache" => name.as_ref());
        metric!(
            time_raw("caches.file.size") = contents.len() as u64,
            "hit" => "false",
            "cache" => name.as_ref(),
        );

        Ok(())
    }

    /// Removes the entry for `key`, returning whether there was one.
    pub async fn remove(&self, key: &CacheKey) -> io::Result<bool> {
        let Some(path) = self.entry_path(key) else {
            return Ok(false);
        };

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Removes all entries of this cache.
    pub async fn clear(&self) -> io::Result<()> {
        let Some(cache_dir) = self.cache_dir.as_ref() else {
            return Ok(());
        };
        tracing::info!("Clearing `{}` cache", self.name);

        if let Err(e) = tokio::fs::remove_dir_all(cache_dir).await {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(e);
            }
        }
        tokio::fs::create_dir_all(cache_dir).await
    }

    /// Create a new temporary file to use in the cache.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        match self.tmp_dir {
            Some(ref path) => {
                // The cache directory could be purged underneath us, so be defensive here and
                // retry the fs operations.
                const MAX_RETRIES: usize = 2;
                let mut retries = 0;
                loop {
                    retries += 1;

                    if let Err(e) = std::fs::create_dir_all(path) {
                        tracing::error!(
                            path = %path.display(),
                            "Failed to create cache directory: {:?}",
                            e
                        );
                        if retries > MAX_RETRIES {
                            return Err(e);
                        }
                        continue;
                    }

                    match tempfile::Builder::new().prefix("tmp").tempfile_in(path) {
                        Ok(temp_file) => return Ok(temp_file),
                        Err(e) => {
                            tracing::error!(
                                path = %path.display(),
                                "Failed to create cache file: {:?}",
                                e
                            );
                            if retries > MAX_RETRIES {
                                return Err(e);
                            }
                            continue;
                        }
                    }
                }
            }
            None => NamedTempFile::new(),
        }
    }
}

fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<std::fs::File> {
    let parent = cache_path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::Other, "no parent directory to persist item")
    })?;

    // The cache directory could be purged underneath us, so be defensive here and retry the
    // fs operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    let file = loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!(
                path = %parent.display(),
                "Failed to create cache directory: {:?}",
                e
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => break file,
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(
                    path = %cache_path.display(),
                    "Failed to create cache file: {:?}",
                    err
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    };
    Ok(file)
}

/// Removes and recreates the temporary directory below `config.cache_dir`.
///
/// This needs to happen on startup to avoid leaving temporary files behind which survived a
/// hard crash.
pub fn clear_tmp(config: &Config) -> io::Result<()> {
    if let Some(ref tmp) = config.cache_dir("tmp") {
        if tmp.exists() {
            std::fs::remove_dir_all(tmp)?;
        }
        std::fs::create_dir_all(tmp)?;
    }
    Ok(())
}
