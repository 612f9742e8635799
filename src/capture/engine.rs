//! Capture engine: mirrors a source locator into a growing container file
//!
//! The engine itself is an external program. The recorder only starts it,
//! stops it, and watches the container it writes.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

use crate::config::CaptureConfig;
use crate::data::Locator;
use crate::error::{RecorderError, RecorderResult};

/// Something that copies a live source into a container file
pub trait CaptureEngine: Send {
    /// Begin mirroring `locator` into `container`. Returns once capture has
    /// been launched; a launch failure is a [`RecorderError::CaptureStart`].
    fn start(&mut self, locator: &Locator, container: &Path) -> RecorderResult<()>;

    /// Halt capture. Safe to call when not started.
    fn stop(&mut self);
}

/// Capture engine backed by an `ffmpeg` stream copy
pub struct FfmpegCapture {
    ffmpeg_path: PathBuf,
    url_scheme: String,
    child: Option<Child>,
}

impl FfmpegCapture {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            url_scheme: config.url_scheme.clone(),
            child: None,
        }
    }

    fn command(&self, url: &str, container: &Path) -> Command {
        let mut command = Command::new(&self.ffmpeg_path);
        command
            .args(["-nostdin", "-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(url)
            .args(["-map", "0", "-c", "copy", "-f", "mpegts"])
            .arg(container)
            // Nothing reads the engine's output, so never hand it a pipe
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }
}

impl CaptureEngine for FfmpegCapture {
    fn start(&mut self, locator: &Locator, container: &Path) -> RecorderResult<()> {
        if self.child.is_some() {
            debug!("Capture already started");
            return Ok(());
        }

        let url = locator.to_url(&self.url_scheme);
        info!("Starting capture of {} into {:?}", url, container);

        let child = self.command(&url, container).spawn().map_err(|e| {
            RecorderError::CaptureStart(format!(
                "failed to launch {:?}: {}",
                self.ffmpeg_path, e
            ))
        })?;

        debug!("Capture engine running as pid {}", child.id());
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            debug!("Capture already stopped");
            return;
        };

        info!("Stopping capture engine (pid {})", child.id());
        match child.try_wait() {
            Ok(Some(status)) => debug!("Capture engine had already exited: {}", status),
            _ => {
                if let Err(e) = child.kill() {
                    warn!("Failed to kill capture engine: {}", e);
                }
                if let Err(e) = child.wait() {
                    warn!("Failed to reap capture engine: {}", e);
                }
            }
        }
    }
}

impl Drop for FfmpegCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
