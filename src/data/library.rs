//! Recording library listing

use std::path::Path;
use tracing::{debug, warn};

use super::RecordingMetadata;

/// Read every recording descriptor found one level below `root`.
///
/// Directories without a descriptor are ignored; descriptors that fail to
/// parse are logged and skipped. Results are ordered by start time.
pub fn scan(root: &Path, metadata_filename: &str) -> Vec<RecordingMetadata> {
    let Ok(entries) = std::fs::read_dir(root) else {
        debug!("Library directory {:?} is not readable", root);
        return Vec::new();
    };

    let mut recordings = Vec::new();

    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }

        let descriptor = dir.join(metadata_filename);
        if !descriptor.is_file() {
            continue;
        }

        match RecordingMetadata::load(&descriptor) {
            Ok(meta) => recordings.push(meta),
            Err(e) => warn!("Skipping unreadable recording {:?}: {}", descriptor, e),
        }
    }

    recordings.sort_by_key(|m| m.start_time_ms());
    recordings
}
