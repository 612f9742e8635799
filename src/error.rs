//! Error types for the recorder core
//!
//! Application entry points use `anyhow`; everything below the binary surface
//! reports through [`RecorderError`] so callers can tell failure classes apart.

use std::path::PathBuf;
use thiserror::Error;

/// Recorder-wide error type
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid port {0} (must be within 1-65535)")]
    InvalidPort(u32),

    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Presence monitor failed: {0}")]
    Monitor(String),

    #[error("Capture engine failed to start: {0}")]
    CaptureStart(String),

    #[error("Metadata I/O error at {path:?}: {source}")]
    MetadataIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Metadata is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Metadata field '{key}' has malformed value '{value}'")]
    MalformedField { key: &'static str, value: String },

    #[error("Container shrank from {cursor} to {length} bytes")]
    ContainerShrank { cursor: u64, length: u64 },

    #[error("Transcode failed: {0}")]
    Transcode(String),

    #[error("Recording session already started")]
    AlreadyStarted,
}

/// Result type alias using RecorderError
pub type RecorderResult<T> = Result<T, RecorderError>;
