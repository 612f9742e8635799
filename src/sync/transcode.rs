//! Segment-to-frames transcoding
//!
//! Segments are queued on a bounded channel and drained by a dispatcher that
//! runs at most `max_concurrent` extractions at once. A full queue pushes back
//! on the segmenting tick instead of spawning without limit.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::TranscodeConfig;
use crate::error::{RecorderError, RecorderResult};

/// Bytes of transcoder stderr kept for the failure log
const STDERR_TAIL: usize = 2048;

/// One segment waiting to be turned into frame images
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeJob {
    /// Scratch file holding the segment bytes, deleted once the job ends
    pub segment_path: PathBuf,
    /// Destination directory for the frames
    pub frame_directory: PathBuf,
    /// Output namespace of this segment within its session
    pub batch_index: u64,
    /// Frames per second of video to extract
    pub frame_rate: u32,
    /// JPEG quality, 1 (best) to 31 (worst)
    pub quality: u32,
}

impl TranscodeJob {
    /// Output pattern `<frameDir>/<batch:06>-%04d.jpg`
    pub fn output_pattern(&self) -> PathBuf {
        self.frame_directory
            .join(format!("{:06}-%04d.jpg", self.batch_index))
    }
}

/// Turns one segment into frame images
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn extract(&self, job: &TranscodeJob) -> RecorderResult<()>;
}

/// Frame extractor backed by the `ffmpeg` command line
pub struct FfmpegExtractor {
    ffmpeg_path: PathBuf,
}

impl FfmpegExtractor {
    pub fn new(config: &TranscodeConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
        }
    }

    fn command(&self, job: &TranscodeJob) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.ffmpeg_path);
        command
            .args(["-nostdin", "-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(&job.segment_path)
            .arg("-q:v")
            .arg(job.quality.to_string())
            .arg("-r")
            .arg(job.frame_rate.to_string())
            .args(["-f", "image2", "-start_number", "0"])
            .arg(job.output_pattern())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl FrameExtractor for FfmpegExtractor {
    async fn extract(&self, job: &TranscodeJob) -> RecorderResult<()> {
        // output() drains both pipes while waiting, so a chatty transcoder
        // cannot fill a pipe buffer and stall
        let output = self.command(job).output().await.map_err(|e| {
            RecorderError::Transcode(format!("failed to launch {:?}: {}", self.ffmpeg_path, e))
        })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail_start = stderr
            .char_indices()
            .rev()
            .nth(STDERR_TAIL)
            .map(|(i, _)| i)
            .unwrap_or(0);
        Err(RecorderError::Transcode(format!(
            "{} exited with {}: {}",
            self.ffmpeg_path.display(),
            output.status,
            stderr[tail_start..].trim()
        )))
    }
}

/// Sending side of the pool, cloned into each recording session
#[derive(Clone)]
pub struct TranscodeQueue {
    tx: mpsc::Sender<TranscodeJob>,
}

/// Why a slot could not be reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueUnavailable {
    /// Every slot is taken; try again next tick
    Full,
    /// The pool has shut down
    Closed,
}

/// A reserved queue slot. Sending through it cannot fail or block.
pub struct QueueSlot {
    permit: OwnedPermit<TranscodeJob>,
}

impl QueueSlot {
    pub fn send(self, job: TranscodeJob) {
        self.permit.send(job);
    }
}

impl TranscodeQueue {
    /// Reserve room for one job without waiting
    pub fn try_reserve(&self) -> Result<QueueSlot, QueueUnavailable> {
        match self.tx.clone().try_reserve_owned() {
            Ok(permit) => Ok(QueueSlot { permit }),
            Err(TrySendError::Full(_)) => Err(QueueUnavailable::Full),
            Err(TrySendError::Closed(_)) => Err(QueueUnavailable::Closed),
        }
    }

    /// Reserve room for one job, waiting at most `wait` for a slot to free up
    pub async fn reserve_within(&self, wait: Duration) -> Result<QueueSlot, QueueUnavailable> {
        match tokio::time::timeout(wait, self.tx.clone().reserve_owned()).await {
            Ok(Ok(permit)) => Ok(QueueSlot { permit }),
            Ok(Err(_)) => Err(QueueUnavailable::Closed),
            Err(_) => Err(QueueUnavailable::Full),
        }
    }
}

#[cfg(test)]
impl TranscodeQueue {
    /// Queue with no dispatcher; the caller receives the jobs
    pub(crate) fn detached(depth: usize) -> (Self, mpsc::Receiver<TranscodeJob>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }
}

/// Bounded transcode worker pool
pub struct TranscodePool {
    queue: TranscodeQueue,
    dispatcher: JoinHandle<()>,
}

impl TranscodePool {
    /// Start the dispatcher. Must be called from within a tokio runtime.
    pub fn new(extractor: Arc<dyn FrameExtractor>, max_concurrent: usize, queue_depth: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let (tx, rx) = mpsc::channel(queue_depth.max(1));

        info!(
            "Transcode pool ready ({} workers, queue depth {})",
            max_concurrent, queue_depth
        );

        let dispatcher = tokio::spawn(dispatch(rx, extractor, max_concurrent));

        Self {
            queue: TranscodeQueue { tx },
            dispatcher,
        }
    }

    /// Handle used by sessions to submit segments
    pub fn queue(&self) -> TranscodeQueue {
        self.queue.clone()
    }

    /// Close the pool's own sender and wait for queued and in-flight jobs.
    ///
    /// Completes once every other [`TranscodeQueue`] clone has been dropped.
    pub async fn drain(self) {
        let Self { queue, dispatcher } = self;
        drop(queue);
        if let Err(e) = dispatcher.await {
            error!("Transcode dispatcher failed: {}", e);
        }
        info!("Transcode pool drained");
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<TranscodeJob>,
    extractor: Arc<dyn FrameExtractor>,
    max_concurrent: usize,
) {
    let workers = Arc::new(Semaphore::new(max_concurrent));

    while let Some(job) = rx.recv().await {
        // Waiting here leaves later jobs in the channel, which is what
        // makes the queue fill up under load
        let Ok(permit) = workers.clone().acquire_owned().await else {
            break;
        };

        let extractor = extractor.clone();
        tokio::spawn(async move {
            run_job(extractor.as_ref(), &job).await;
            drop(permit);
        });
    }

    // Queue closed: wait for the stragglers
    let _ = workers.acquire_many(max_concurrent as u32).await;
}

async fn run_job(extractor: &dyn FrameExtractor, job: &TranscodeJob) {
    debug!(
        "Transcoding batch {} from {:?} into {:?}",
        job.batch_index, job.segment_path, job.frame_directory
    );

    match extractor.extract(job).await {
        Ok(()) => info!("Extracted frames for batch {}", job.batch_index),
        Err(e) => error!(
            "Transcode of batch {} failed, its frames are lost: {}",
            job.batch_index, e
        ),
    }

    remove_segment(&job.segment_path).await;
}

async fn remove_segment(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Deleted segment {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete segment {:?}: {}", path, e),
    }
}
