use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

/// The prefix used by the textual form of a [`RequestDescriptor::LocalAsset`].
const LOCAL_PREFIX: &str = "local:";

/// The stable identifier of an asset in the device media library.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct LocalAssetId(String);

impl LocalAssetId {
    /// Creates a new [`LocalAssetId`].
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for LocalAssetId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocalAssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The size (in pixels) at which an asset is going to be displayed.
///
/// This is only a hint for fetchers. Cached content is always stored at its canonical size,
/// so the target size never takes part in cache identity.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TargetSize {
    /// Width in pixels, `0` meaning "unconstrained".
    pub width: u32,
    /// Height in pixels, `0` meaning "unconstrained".
    pub height: u32,
}

impl TargetSize {
    /// Requests the asset at its original size.
    pub const ORIGINAL: Self = Self {
        width: 0,
        height: 0,
    };

    /// Creates a new [`TargetSize`].
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether this size is unconstrained in both dimensions.
    pub fn is_original(&self) -> bool {
        *self == Self::ORIGINAL
    }
}

/// An asset stored in the local device media library.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LocalAsset {
    /// The library identifier of the asset.
    pub id: LocalAssetId,
    /// The display size hint.
    #[serde(default)]
    pub target_size: TargetSize,
}

/// An asset hosted on a remote HTTP server.
///
/// The URL is kept verbatim, as it was handed out by the backend. It may contain signing or
/// tracking parameters which are needed to actually fetch it but do not contribute to the
/// identity of the content.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RemoteAsset {
    /// The raw URL of the asset.
    pub url: String,
    /// The display size hint.
    #[serde(default)]
    pub target_size: TargetSize,
}

impl RemoteAsset {
    /// Parses the raw URL.
    pub fn parsed_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.url)
    }
}

/// A request for a single piece of media content.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestDescriptor {
    /// Content from the device media library.
    LocalAsset(LocalAsset),
    /// Content from a remote server.
    RemoteAsset(RemoteAsset),
}

impl RequestDescriptor {
    /// Creates a descriptor for a local library asset.
    pub fn local(id: impl Into<String>, target_size: TargetSize) -> Self {
        Self::LocalAsset(LocalAsset {
            id: LocalAssetId::new(id),
            target_size,
        })
    }

    /// Creates a descriptor for a remote asset.
    pub fn remote(url: impl Into<String>, target_size: TargetSize) -> Self {
        Self::RemoteAsset(RemoteAsset {
            url: url.into(),
            target_size,
        })
    }

    /// Returns the display size hint of this request.
    pub fn target_size(&self) -> TargetSize {
        match self {
            Self::LocalAsset(asset) => asset.target_size,
            Self::RemoteAsset(asset) => asset.target_size,
        }
    }

    /// Returns a short name for the kind of this request, used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LocalAsset(_) => "local",
            Self::RemoteAsset(_) => "remote",
        }
    }
}

impl fmt::Display for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalAsset(asset) => write!(f, "{LOCAL_PREFIX}{}", asset.id),
            Self::RemoteAsset(asset) => write!(f, "{}", asset.url),
        }
    }
}

/// Parses the textual form of a descriptor.
///
/// `local:<id>` yields a [`RequestDescriptor::LocalAsset`], anything else is taken verbatim as
/// the URL of a [`RequestDescriptor::RemoteAsset`]. The target size is always
/// [`TargetSize::ORIGINAL`].
impl FromStr for RequestDescriptor {
    type Err = ParseDescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseDescriptorError::Empty);
        }
        match s.strip_prefix(LOCAL_PREFIX) {
            Some("") => Err(ParseDescriptorError::Empty),
            Some(id) => Ok(Self::local(id, TargetSize::ORIGINAL)),
            None => Ok(Self::remote(s, TargetSize::ORIGINAL)),
        }
    }
}

/// Error returned when parsing a [`RequestDescriptor`] from its textual form.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ParseDescriptorError {
    /// The input, or the local identifier in it, was empty.
    Empty,
}

impl fmt::Display for ParseDescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty asset descriptor"),
        }
    }
}

impl std::error::Error for ParseDescriptorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_descriptor() {
        let local: RequestDescriptor = "local:ABC-123/L0/001".parse().unwrap();
        assert_eq!(
            local,
            RequestDescriptor::local("ABC-123/L0/001", TargetSize::ORIGINAL)
        );
        assert_eq!(local.kind(), "local");
        assert_eq!(local.to_string(), "local:ABC-123/L0/001");

        let remote: RequestDescriptor = "https://cdn.example.com/a.jpg?size=2".parse().unwrap();
        assert_eq!(remote.kind(), "remote");
        assert_eq!(remote.to_string(), "https://cdn.example.com/a.jpg?size=2");

        assert_eq!(
            "".parse::<RequestDescriptor>(),
            Err(ParseDescriptorError::Empty)
        );
        assert_eq!(
            "local:".parse::<RequestDescriptor>(),
            Err(ParseDescriptorError::Empty)
        );
    }

    #[test]
    fn test_malformed_remote_is_representable() {
        let remote = RequestDescriptor::remote("not a url", TargetSize::new(64, 64));
        let RequestDescriptor::RemoteAsset(asset) = &remote else {
            panic!("expected a remote asset");
        };
        assert!(asset.parsed_url().is_err());
        assert_eq!(remote.target_size(), TargetSize::new(64, 64));
    }

    #[test]
    fn test_serde_roundtrip() {
        let json = r#"{"type":"local_asset","id":"photo-1"}"#;
        let descriptor: RequestDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(
            descriptor,
            RequestDescriptor::local("photo-1", TargetSize::ORIGINAL)
        );
        assert!(descriptor.target_size().is_original());
    }
}
