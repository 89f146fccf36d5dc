//! Descriptors for the media assets that can be resolved by the wayfarer caches.
//!
//! A [`RequestDescriptor`] names a piece of content either on the local device
//! ([`LocalAsset`]) or on a remote HTTP server ([`RemoteAsset`]), together with a
//! [`TargetSize`] hint for display.

#![warn(missing_docs)]

mod descriptor;

pub use descriptor::*;
