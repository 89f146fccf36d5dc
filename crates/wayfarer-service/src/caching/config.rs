use std::fmt;

/// All known cache names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheName {
    Images,
    Videos,
}

impl AsRef<str> for CacheName {
    fn as_ref(&self) -> &str {
        match self {
            Self::Images => "images",
            Self::Videos => "videos",
        }
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}
