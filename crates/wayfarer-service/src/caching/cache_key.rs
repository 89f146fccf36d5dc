use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;
use wayfarer_sources::RequestDescriptor;

/// Query parameters which are ignored by [`KeyNormalizer::default`].
///
/// These are the signing parameters of presigned S3 URLs, which change with every issued URL,
/// as well as common tracking and cache-busting parameters.
pub const DEFAULT_IGNORED_QUERY_PARAMS: &[&str] = &[
    "X-Amz-Algorithm",
    "X-Amz-Credential",
    "X-Amz-Date",
    "X-Amz-Expires",
    "X-Amz-Signature",
    "X-Amz-SignedHeaders",
    "X-Amz-Security-Token",
    "utm_*",
    "cb",
    "_",
];

/// The key of an asset in all the cache tiers.
///
/// A key consists of human-readable metadata describing the content, and the SHA-256 hash
/// of that metadata. Equality and hashing only consider the hash.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.metadata)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    fn from_metadata(metadata: String) -> Self {
        let hash = Sha256::digest(&metadata).into();
        CacheKey {
            metadata: metadata.into(),
            hash,
        }
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the relative path for this cache key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `v$version/aa/bbccdd/eeff...`
    pub fn cache_path(&self, version: u32) -> String {
        let mut path = format!("v{version}/{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &self.hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }

    #[cfg(test)]
    pub fn for_testing(key: impl Into<String>) -> Self {
        Self::from_metadata(key.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum IgnoredParam {
    Exact(String),
    Prefix(String),
}

impl IgnoredParam {
    fn parse(param: &str) -> Self {
        let param = param.to_ascii_lowercase();
        match param.strip_suffix('*') {
            Some(prefix) => Self::Prefix(prefix.to_owned()),
            None => Self::Exact(param),
        }
    }

    fn matches(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        match self {
            Self::Exact(param) => name == *param,
            Self::Prefix(prefix) => name.starts_with(prefix.as_str()),
        }
    }
}

/// Derives [`CacheKey`]s from [`RequestDescriptor`]s.
///
/// Remote URLs are normalized before hashing: the fragment and all ignored query parameters
/// are removed, and the remaining query pairs are sorted by name. Local assets are keyed by
/// their library identifier. The target size never contributes to the key.
#[derive(Debug, Clone)]
pub struct KeyNormalizer {
    ignored: Vec<IgnoredParam>,
}

impl Default for KeyNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORED_QUERY_PARAMS)
    }
}

impl KeyNormalizer {
    /// Creates a normalizer ignoring the given query parameters.
    ///
    /// Matching is case-insensitive, and a trailing `*` matches all parameters with that prefix.
    pub fn new<I, S>(ignored_params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ignored = ignored_params
            .into_iter()
            .map(|param| IgnoredParam::parse(param.as_ref()))
            .collect();
        Self { ignored }
    }

    /// Derives the cache key for `descriptor`.
    pub fn normalize(&self, descriptor: &RequestDescriptor) -> CacheKey {
        let metadata = match descriptor {
            RequestDescriptor::LocalAsset(asset) => format!("local: {}", asset.id),
            RequestDescriptor::RemoteAsset(asset) => match self.normalize_url(&asset.url) {
                Ok(url) => format!("remote: {url}"),
                Err(err) => {
                    tracing::debug!(
                        error = &err as &dyn std::error::Error,
                        url = %asset.url,
                        "Falling back to raw cache key for malformed URL"
                    );
                    format!("remote-raw: {}", asset.url)
                }
            },
        };
        CacheKey::from_metadata(metadata)
    }

    /// Returns the normalized form of a remote URL.
    pub fn normalize_url(&self, raw: &str) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(raw)?;
        url.set_fragment(None);

        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(name, _)| !self.is_ignored(name))
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        // stable, so repeated parameters keep their relative order
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        if pairs.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(&pairs);
        }

        Ok(url)
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.ignored.iter().any(|param| param.matches(name))
    }
}
