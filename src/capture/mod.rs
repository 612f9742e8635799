//! Capture side of the recorder
//!
//! Two collaborators live here:
//! - the presence monitor, which only observes that datagrams are arriving
//! - the capture engine, which copies the stream into a container file

mod engine;
mod monitor;

pub use engine::{CaptureEngine, FfmpegCapture};
pub use monitor::{PresenceMonitor, PresenceProbe};
