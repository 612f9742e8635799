//! Recording coordination
//!
//! The detector turns presence into sessions, sessions turn a growing
//! container into segments, and the transcode pool turns segments into frames.

mod detector;
mod listeners;
mod session;
mod transcode;

pub use detector::{PresenceDetector, StreamListener};
pub use session::{RecordingSession, SessionSettings};
pub use transcode::{FfmpegExtractor, TranscodePool};
