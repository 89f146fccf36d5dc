use std::fmt;

use bytes::Bytes;

use crate::caching::{CacheEntry, CacheError, CacheName};

use super::AssetDecoder;

/// ISO-BMFF brands of still image containers.
const IMAGE_BRANDS: &[&[u8; 4]] = &[
    b"heic", b"heix", b"heim", b"heis", b"hevc", b"mif1", b"msf1", b"avif", b"avis",
];

fn weight_of(data: &Bytes) -> u32 {
    u32::try_from(data.len()).unwrap_or(u32::MAX)
}

/// The brand of an ISO-BMFF (`ftyp`) container, if `data` starts with one.
fn ftyp_brand(data: &[u8]) -> Option<&[u8]> {
    if data.len() >= 12 && &data[4..8] == b"ftyp" {
        Some(&data[8..12])
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
    Heic,
    Avif,
}

impl ImageFormat {
    /// Detects the image format from the leading bytes of `data`.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.starts_with(&[0xff, 0xd8, 0xff]) {
            return Some(Self::Jpeg);
        }
        if data.starts_with(b"\x89PNG\r\n\x1a\n") {
            return Some(Self::Png);
        }
        if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            return Some(Self::Gif);
        }
        if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
            return Some(Self::Webp);
        }
        let brand = ftyp_brand(data)?;
        if brand.starts_with(b"avi") {
            Some(Self::Avif)
        } else if IMAGE_BRANDS.iter().any(|b| &b[..] == brand) {
            Some(Self::Heic)
        } else {
            None
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
            Self::Heic => "heic",
            Self::Avif => "avif",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFormat {
    Mp4,
    QuickTime,
    Webm,
}

impl VideoFormat {
    /// Detects the video container from the leading bytes of `data`.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.starts_with(&[0x1a, 0x45, 0xdf, 0xa3]) {
            return Some(Self::Webm);
        }
        let brand = ftyp_brand(data)?;
        if brand == b"qt  " {
            Some(Self::QuickTime)
        } else if IMAGE_BRANDS.iter().any(|b| &b[..] == brand) {
            None
        } else {
            Some(Self::Mp4)
        }
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mp4 => "mp4",
            Self::QuickTime => "quicktime",
            Self::Webm => "webm",
        };
        f.write_str(name)
    }
}

/// A validated, still encoded image.
///
/// Turning this into pixels is up to the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub format: ImageFormat,
    pub data: Bytes,
}

/// A validated, still encoded video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Video {
    pub format: VideoFormat,
    pub data: Bytes,
}

/// Decodes [`Image`]s, stored in the `images` cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDecoder;

impl AssetDecoder for ImageDecoder {
    type Item = Image;

    fn cache_name(&self) -> CacheName {
        CacheName::Images
    }

    fn decode(&self, bytes: &Bytes) -> CacheEntry<Image> {
        match ImageFormat::sniff(bytes) {
            Some(format) => Ok(Image {
                format,
                data: bytes.clone(),
            }),
            None => Err(CacheError::Malformed("unknown image format".into())),
        }
    }

    fn weight(&self, item: &Image) -> u32 {
        weight_of(&item.data)
    }
}

/// Decodes [`Video`]s, stored in the `videos` cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct VideoDecoder;

impl AssetDecoder for VideoDecoder {
    type Item = Video;

    fn cache_name(&self) -> CacheName {
        CacheName::Videos
    }

    fn decode(&self, bytes: &Bytes) -> CacheEntry<Video> {
        match VideoFormat::sniff(bytes) {
            Some(format) => Ok(Video {
                format,
                data: bytes.clone(),
            }),
            None => Err(CacheError::Malformed("unknown video container".into())),
        }
    }

    fn weight(&self, item: &Video) -> u32 {
        weight_of(&item.data)
    }
}

/// Passes bytes through unchanged, stored in the given cache.
#[derive(Debug, Clone, Copy)]
pub struct RawDecoder(pub CacheName);

impl AssetDecoder for RawDecoder {
    type Item = Bytes;

    fn cache_name(&self) -> CacheName {
        self.0
    }

    fn decode(&self, bytes: &Bytes) -> CacheEntry<Bytes> {
        Ok(bytes.clone())
    }

    fn weight(&self, item: &Bytes) -> u32 {
        weight_of(item)
    }
}
