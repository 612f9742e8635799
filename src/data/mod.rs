//! Data model: video sources and recording descriptors

pub mod library;
mod metadata;
mod source;

pub use metadata::RecordingMetadata;
pub use source::{Locator, VideoSource};
