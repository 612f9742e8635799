//! Recording sessions
//!
//! A session owns one capture into a growing container file plus a periodic
//! segmenting task. Each tick slices the bytes that arrived since the last
//! tick into a segment file and hands it to the transcode pool. A tick that
//! finds the container no longer growing ends the session, even when a full
//! transcode queue is still holding bytes back.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::CaptureEngine;
use crate::config::Config;
use crate::data::{Locator, RecordingMetadata, VideoSource};
use crate::error::{RecorderError, RecorderResult};

use super::listeners::{ListenerId, Listeners};
use super::transcode::{QueueSlot, QueueUnavailable, TranscodeJob, TranscodeQueue};

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingOutcome {
    /// A segmenting tick saw no new bytes
    EndOfStream,
    /// `stop_recording` was called
    Stopped,
    /// The session could not continue
    Failed(String),
}

/// Receives the single completion notification of a session
pub trait RecordingCompleteListener: Send + Sync {
    fn recording_complete(&self, source: &VideoSource, outcome: &RecordingOutcome);
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Active,
    /// Stopped for good; a session is never restarted
    Finished,
}

/// Everything a session needs from the configuration
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub scratch_directory: PathBuf,
    pub library_directory: PathBuf,
    pub metadata_filename: String,
    pub container_extension: String,
    pub flush_period: Duration,
    pub initial_delay: Duration,
    pub frame_rate: u32,
    pub quality: u32,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            scratch_directory: config.recording.scratch_directory.clone(),
            library_directory: config.recording.library_directory.clone(),
            metadata_filename: config.recording.metadata_filename.clone(),
            container_extension: config.recording.container_extension.clone(),
            flush_period: config.recording.flush_period(),
            initial_delay: config.recording.initial_delay(),
            frame_rate: config.transcode.frame_rate,
            quality: config.transcode.quality,
        }
    }
}

/// Paths derived from the session name at start
#[derive(Debug, Clone)]
struct SessionLayout {
    name: String,
    container: PathBuf,
    segment_directory: PathBuf,
    frame_directory: PathBuf,
    metadata_path: PathBuf,
}

impl SessionLayout {
    fn new(settings: &SessionSettings, source: &VideoSource, start_time_ms: i64) -> Self {
        let name = format!("{}-{}", sanitize(source.name()), start_time_ms);
        let frame_directory = settings.library_directory.join(&name);
        Self {
            container: settings
                .scratch_directory
                .join(format!("{}.{}", name, settings.container_extension)),
            segment_directory: settings.scratch_directory.join(&name),
            metadata_path: frame_directory.join(&settings.metadata_filename),
            frame_directory,
            name,
        }
    }
}

struct SessionInner {
    source: VideoSource,
    settings: SessionSettings,
    queue: TranscodeQueue,
    engine: Mutex<Box<dyn CaptureEngine>>,
    state: Mutex<SessionState>,
    layout: Mutex<Option<SessionLayout>>,
    metadata: Mutex<Option<RecordingMetadata>>,
    listeners: Listeners<dyn RecordingCompleteListener>,
    cancel: CancellationToken,
}

/// Handle to one recording session. Clones share the same session.
#[derive(Clone)]
pub struct RecordingSession {
    inner: Arc<SessionInner>,
}

impl RecordingSession {
    /// Create an idle session for `source`.
    ///
    /// Network sources must resolve to an address; a malformed address is
    /// reported here, before anything touches the filesystem.
    pub fn new(
        source: VideoSource,
        settings: SessionSettings,
        engine: Box<dyn CaptureEngine>,
        queue: TranscodeQueue,
    ) -> RecorderResult<Self> {
        if let Locator::Network { .. } = source.locator() {
            source.locator().socket_addr()?;
        }

        Ok(Self {
            inner: Arc::new(SessionInner {
                source,
                settings,
                queue,
                engine: Mutex::new(engine),
                state: Mutex::new(SessionState::Idle),
                layout: Mutex::new(None),
                metadata: Mutex::new(None),
                listeners: Listeners::new(),
                cancel: CancellationToken::new(),
            }),
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    /// Session name, known once started
    #[cfg(test)]
    pub fn name(&self) -> Option<String> {
        lock(&self.inner.layout).as_ref().map(|l| l.name.clone())
    }

    #[cfg(test)]
    pub fn container_path(&self) -> Option<PathBuf> {
        lock(&self.inner.layout).as_ref().map(|l| l.container.clone())
    }

    #[cfg(test)]
    pub fn frame_directory(&self) -> Option<PathBuf> {
        lock(&self.inner.layout)
            .as_ref()
            .map(|l| l.frame_directory.clone())
    }

    /// Current metadata, as last written
    #[cfg(test)]
    pub fn metadata(&self) -> Option<RecordingMetadata> {
        lock(&self.inner.metadata).clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn RecordingCompleteListener>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    #[cfg(test)]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Start capturing and schedule the segmenting task.
    ///
    /// Returns once everything is launched. A failure here also ends the
    /// session and is reported to the completion listeners as
    /// [`RecordingOutcome::Failed`]. Must be called inside a tokio runtime.
    pub fn start_recording(&self) -> RecorderResult<()> {
        {
            let mut state = lock(&self.inner.state);
            if *state != SessionState::Idle {
                return Err(RecorderError::AlreadyStarted);
            }
            *state = SessionState::Active;
        }

        match self.launch() {
            Ok(segmenter) => {
                tokio::spawn(segment_loop(self.inner.clone(), segmenter));
                Ok(())
            }
            Err(e) => {
                error!("Recording of {} failed to start: {}", self.inner.source, e);
                self.inner.finish(RecordingOutcome::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Stop capturing, cancel the segmenting schedule and notify listeners.
    ///
    /// Idempotent; listeners are notified exactly once, before the first call
    /// returns. Transcodes already dispatched keep running.
    pub fn stop_recording(&self) {
        self.inner.finish(RecordingOutcome::Stopped);
    }

    fn launch(&self) -> RecorderResult<Segmenter> {
        let inner = &self.inner;
        let start_time_ms = chrono::Utc::now().timestamp_millis();
        let layout = SessionLayout::new(&inner.settings, &inner.source, start_time_ms);

        std::fs::create_dir_all(&layout.frame_directory)?;
        std::fs::create_dir_all(&layout.segment_directory)?;

        let metadata = RecordingMetadata::new(
            inner.source.id(),
            layout.name.clone(),
            inner.settings.frame_rate,
            layout.container.clone(),
            layout.frame_directory.clone(),
            start_time_ms,
        );
        metadata.save(&layout.metadata_path)?;
        *lock(&inner.metadata) = Some(metadata);
        *lock(&inner.layout) = Some(layout.clone());

        {
            let mut engine = lock(&inner.engine);
            engine.start(inner.source.locator(), &layout.container)?;
            // A stop that raced with startup already ran the engine's stop
            if inner.cancel.is_cancelled() {
                engine.stop();
            }
        }
        if inner.cancel.is_cancelled() {
            inner.close_metadata()?;
        }

        info!(
            "Recording session {} started: container={:?}, frames={:?}",
            layout.name, layout.container, layout.frame_directory
        );

        Ok(Segmenter::new(
            layout.container,
            layout.segment_directory,
            layout.frame_directory,
            inner.settings.container_extension.clone(),
            inner.settings.frame_rate,
            inner.settings.quality,
            inner.settings.flush_period,
        ))
    }
}

impl SessionInner {
    fn finish(&self, outcome: RecordingOutcome) {
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Finished {
                debug!("Session for {} already finished", self.source);
                return;
            }
            *state = SessionState::Finished;
        }

        self.cancel.cancel();
        lock(&self.engine).stop();

        let outcome = match self.close_metadata() {
            Ok(()) => outcome,
            Err(e) => {
                error!("Failed to finalize recording metadata: {}", e);
                match outcome {
                    RecordingOutcome::Failed(reason) => RecordingOutcome::Failed(reason),
                    _ => RecordingOutcome::Failed(e.to_string()),
                }
            }
        };

        info!("Recording of {} finished: {:?}", self.source, outcome);
        self.listeners
            .notify(|l| l.recording_complete(&self.source, &outcome));
    }

    fn close_metadata(&self) -> RecorderResult<()> {
        let layout = lock(&self.layout).clone();
        let mut metadata = lock(&self.metadata);
        let (Some(layout), Some(meta)) = (layout, metadata.as_mut()) else {
            return Ok(());
        };

        let dimensions = probe_frame_dimensions(&layout.frame_directory);
        meta.close(chrono::Utc::now().timestamp_millis(), dimensions);
        meta.save(&layout.metadata_path)
    }
}

/// Result of one segmenting tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The container did not grow since the previous tick
    NoNewData,
    /// New bytes exist but the transcode queue is full; they roll into the
    /// next tick's segment
    Deferred,
    /// A segment was cut and dispatched
    Segmented { batch_index: u64, range: Range<u64> },
    /// The container stopped growing while bytes were still held back by a
    /// full queue. `batch_index` is set when they went out as a final
    /// segment, `None` when the queue never freed up and they were dropped.
    Stalled {
        pending: Range<u64>,
        batch_index: Option<u64>,
    },
}

impl TickOutcome {
    /// Whether the session should end after this tick
    pub fn ends_stream(&self) -> bool {
        matches!(self, TickOutcome::NoNewData | TickOutcome::Stalled { .. })
    }
}

/// Byte-cursor bookkeeping for one container. Owned by the segmenting task.
pub struct Segmenter {
    container: PathBuf,
    segment_directory: PathBuf,
    frame_directory: PathBuf,
    extension: String,
    frame_rate: u32,
    quality: u32,
    /// How long the last segment of a stalled container waits for a slot
    final_wait: Duration,
    /// Bytes of the container already handed out as segments
    cursor: u64,
    /// Container length seen by the previous tick
    last_length: Option<u64>,
    /// Batch index of the next dispatched segment
    next_batch: u64,
}

impl Segmenter {
    pub fn new(
        container: PathBuf,
        segment_directory: PathBuf,
        frame_directory: PathBuf,
        extension: String,
        frame_rate: u32,
        quality: u32,
        final_wait: Duration,
    ) -> Self {
        Self {
            container,
            segment_directory,
            frame_directory,
            extension,
            frame_rate,
            quality,
            final_wait,
            cursor: 0,
            last_length: None,
            next_batch: 0,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn next_batch(&self) -> u64 {
        self.next_batch
    }

    /// Run one tick against the current container length
    pub async fn tick(&mut self, queue: &TranscodeQueue) -> RecorderResult<TickOutcome> {
        let length = match tokio::fs::metadata(&self.container).await {
            Ok(meta) => meta.len(),
            // The engine has not produced a byte yet
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let grew = self.last_length != Some(length);
        self.last_length = Some(length);

        if length == self.cursor {
            return Ok(TickOutcome::NoNewData);
        }
        if length < self.cursor {
            return Err(RecorderError::ContainerShrank {
                cursor: self.cursor,
                length,
            });
        }

        let pending = self.cursor..length;

        if !grew {
            let batch_index = match queue.reserve_within(self.final_wait).await {
                Ok(slot) => Some(self.dispatch(slot, length).await?),
                Err(reason) => {
                    warn!(
                        "Transcode queue {:?}, dropping the final {} bytes",
                        reason,
                        pending.end - pending.start
                    );
                    None
                }
            };
            return Ok(TickOutcome::Stalled {
                pending,
                batch_index,
            });
        }

        let slot = match queue.try_reserve() {
            Ok(slot) => slot,
            Err(QueueUnavailable::Full) => {
                warn!(
                    "Transcode queue full, deferring {} bytes to the next tick",
                    pending.end - pending.start
                );
                return Ok(TickOutcome::Deferred);
            }
            Err(QueueUnavailable::Closed) => {
                error!("Transcode pool is shut down, segment not dispatched");
                return Ok(TickOutcome::Deferred);
            }
        };

        let batch_index = self.dispatch(slot, length).await?;
        Ok(TickOutcome::Segmented {
            batch_index,
            range: pending,
        })
    }

    /// Copy `[cursor, length)` into the next segment file and queue it
    async fn dispatch(&mut self, slot: QueueSlot, length: u64) -> RecorderResult<u64> {
        let batch_index = self.next_batch;
        let segment_path = self
            .segment_directory
            .join(format!("segment-{:06}.{}", batch_index, self.extension));

        if let Err(e) = copy_range(&self.container, &segment_path, self.cursor, length).await {
            let _ = tokio::fs::remove_file(&segment_path).await;
            return Err(e.into());
        }
        self.cursor = length;

        slot.send(TranscodeJob {
            segment_path,
            frame_directory: self.frame_directory.clone(),
            batch_index,
            frame_rate: self.frame_rate,
            quality: self.quality,
        });
        self.next_batch += 1;

        Ok(batch_index)
    }
}

async fn segment_loop(inner: Arc<SessionInner>, mut segmenter: Segmenter) {
    let start = Instant::now() + inner.settings.initial_delay;
    let mut ticker = tokio::time::interval_at(start, inner.settings.flush_period);
    // A slow tick pushes the schedule back instead of bursting to catch up
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = inner.cancel.cancelled() => break,

            _ = ticker.tick() => {
                match segmenter.tick(&inner.queue).await {
                    Ok(outcome) if outcome.ends_stream() => {
                        match outcome {
                            TickOutcome::Stalled { pending, batch_index: Some(batch) } => info!(
                                "Container stopped growing, final batch {} covers bytes {}..{}",
                                batch, pending.start, pending.end
                            ),
                            TickOutcome::Stalled { pending, batch_index: None } => info!(
                                "Container stopped growing, bytes {}..{} were never segmented",
                                pending.start, pending.end
                            ),
                            _ => info!("No new data since the last tick, ending recording"),
                        }
                        finish_off_runtime(&inner, RecordingOutcome::EndOfStream).await;
                        break;
                    }
                    Ok(TickOutcome::Segmented { batch_index, range }) => debug!(
                        "Dispatched batch {} covering bytes {}..{}",
                        batch_index, range.start, range.end
                    ),
                    Ok(_) => {}
                    Err(e @ RecorderError::ContainerShrank { .. }) => {
                        error!("Container is no longer usable: {}", e);
                        finish_off_runtime(&inner, RecordingOutcome::Failed(e.to_string())).await;
                        break;
                    }
                    Err(e) => warn!("Segmenting tick failed, retrying next tick: {}", e),
                }
            }
        }
    }

    debug!(
        "Segmenting task exited at byte {} after {} batches",
        segmenter.cursor(),
        segmenter.next_batch()
    );
}

/// Finish on the blocking pool: stopping the engine waits on a child
/// process and closing the metadata is synchronous file work
async fn finish_off_runtime(inner: &Arc<SessionInner>, outcome: RecordingOutcome) {
    let inner = inner.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || inner.finish(outcome)).await {
        error!("Session shutdown task failed: {}", e);
    }
}

async fn copy_range(container: &Path, segment: &Path, start: u64, end: u64) -> std::io::Result<()> {
    let mut input = tokio::fs::File::open(container).await?;
    input.seek(std::io::SeekFrom::Start(start)).await?;

    let wanted = end - start;
    let mut limited = tokio::io::AsyncReadExt::take(input, wanted);
    let mut output = tokio::fs::File::create(segment).await?;
    let copied = tokio::io::copy(&mut limited, &mut output).await?;
    output.flush().await?;

    if copied != wanted {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("copied {} of {} bytes", copied, wanted),
        ));
    }
    Ok(())
}

/// Dimensions of the earliest frame image, if one is readable
fn probe_frame_dimensions(frame_directory: &Path) -> Option<(u32, u32)> {
    let mut frames: Vec<PathBuf> = std::fs::read_dir(frame_directory)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "jpg"))
        .collect();
    frames.sort();

    frames
        .iter()
        .find_map(|frame| image::image_dimensions(frame).ok())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
