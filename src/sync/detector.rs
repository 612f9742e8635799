//! Presence detection state machine
//!
//! Polls a [`PresenceProbe`] on a fixed period. A fresh arrival while
//! INACTIVE starts a recording session; the session's own completion is the
//! only way back to INACTIVE.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::PresenceProbe;
use crate::config::DetectionConfig;
use crate::data::VideoSource;
use crate::error::RecorderResult;

use super::listeners::{ListenerId, Listeners};
use super::session::{RecordingCompleteListener, RecordingOutcome, RecordingSession};

/// Detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectorState {
    #[default]
    Inactive,
    Active,
}

/// Observer of stream presence transitions
pub trait StreamListener: Send + Sync {
    fn stream_started(&self, source: &VideoSource);
    fn stream_ended(&self, source: &VideoSource);
}

/// Builds the session for a newly detected stream
pub trait SessionFactory: Send + Sync {
    fn create(&self, source: &VideoSource) -> RecorderResult<RecordingSession>;
}

impl<F> SessionFactory for F
where
    F: Fn(&VideoSource) -> RecorderResult<RecordingSession> + Send + Sync,
{
    fn create(&self, source: &VideoSource) -> RecorderResult<RecordingSession> {
        self(source)
    }
}

#[derive(Default)]
struct Inner {
    state: DetectorState,
    /// Bumped on every INACTIVE -> ACTIVE transition so a late completion
    /// from an older session is ignored
    generation: u64,
    /// Active session and the id of our completion hook on it
    session: Option<(RecordingSession, ListenerId)>,
}

pub struct PresenceDetector {
    source: VideoSource,
    probe: Arc<dyn PresenceProbe>,
    factory: Box<dyn SessionFactory>,
    poll_interval: Duration,
    presence_timeout: Duration,
    inner: Mutex<Inner>,
    listeners: Listeners<dyn StreamListener>,
    this: Weak<PresenceDetector>,
}

impl PresenceDetector {
    pub fn new(
        source: VideoSource,
        probe: Arc<dyn PresenceProbe>,
        factory: impl SessionFactory + 'static,
        config: &DetectionConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            source,
            probe,
            factory: Box::new(factory),
            poll_interval: config.poll_interval(),
            presence_timeout: config.presence_timeout(),
            inner: Mutex::new(Inner::default()),
            listeners: Listeners::new(),
            this: this.clone(),
        })
    }

    pub fn state(&self) -> DetectorState {
        self.lock().state
    }

    /// The session recording the current stream, if any
    #[cfg(test)]
    pub fn active_session(&self) -> Option<RecordingSession> {
        self.lock().session.as_ref().map(|(session, _)| session.clone())
    }

    pub fn add_listener(&self, listener: Arc<dyn StreamListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    /// Evaluate presence as of `now`. Must be called inside a tokio runtime.
    ///
    /// While ACTIVE this does nothing; the session decides when the stream
    /// has ended.
    pub fn poll_at(&self, now: Instant) -> DetectorState {
        let Some(last) = self.probe.last_receipt() else {
            return self.state();
        };
        if now.saturating_duration_since(last) >= self.presence_timeout {
            return self.state();
        }

        let generation = {
            let mut inner = self.lock();
            if inner.state == DetectorState::Active {
                return DetectorState::Active;
            }
            inner.state = DetectorState::Active;
            inner.generation += 1;
            inner.generation
        };

        let session = match self.factory.create(&self.source) {
            Ok(session) => session,
            Err(e) => {
                warn!("Could not set up recording for {}, retrying: {}", self.source, e);
                let mut inner = self.lock();
                if inner.generation == generation {
                    inner.state = DetectorState::Inactive;
                }
                return inner.state;
            }
        };

        info!("Stream detected on {}, starting recording", self.source);

        let hook = session.add_listener(Arc::new(CompletionHook {
            detector: self.this.clone(),
            generation,
        }));
        // Start goes out before the session can complete, so every end
        // notification has a matching start before it
        self.listeners.notify(|l| l.stream_started(&self.source));
        self.lock().session = Some((session.clone(), hook));

        if let Err(e) = session.start_recording() {
            // Already reported through the completion hook
            debug!("Recording start failed: {}", e);
        }

        self.state()
    }

    /// Poll until `shutdown` fires or the probe reports a fatal failure.
    ///
    /// Any active session is stopped before this returns.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> RecorderResult<()> {
        let start = tokio::time::Instant::now() + self.poll_interval;
        let mut ticker = tokio::time::interval_at(start, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Watching {} (poll every {:?}, timeout {:?})",
            self.source, self.poll_interval, self.presence_timeout
        );

        let result = loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Detector shutting down");
                    break Ok(());
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.probe.check_health() {
                        error!("Presence monitor died: {}", e);
                        break Err(e);
                    }
                    // Starting a session creates directories and spawns the
                    // capture engine
                    let this = self.clone();
                    let poll = tokio::task::spawn_blocking(move || this.poll_at(Instant::now()));
                    if let Err(e) = poll.await {
                        error!("Presence poll failed: {}", e);
                    }
                }
            }
        };

        let this = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || this.stop_active()).await {
            error!("Stopping the active session failed: {}", e);
        }
        result
    }

    /// Stop the active session, if any. The detector returns to INACTIVE
    /// through the session's completion.
    pub fn stop_active(&self) {
        let session = self.lock().session.as_ref().map(|(s, _)| s.clone());
        if let Some(session) = session {
            session.stop_recording();
        }
    }

    fn session_completed(&self, generation: u64, outcome: &RecordingOutcome) {
        let finished = {
            let mut inner = self.lock();
            if inner.generation != generation || inner.state != DetectorState::Active {
                debug!("Ignoring completion of a superseded session");
                return;
            }
            inner.state = DetectorState::Inactive;
            inner.session.take()
        };

        // The session never notifies twice; drop the hook's detector handle
        if let Some((session, hook)) = finished {
            session.remove_listener(hook);
        }

        match outcome {
            RecordingOutcome::Failed(reason) => {
                warn!("Recording of {} failed: {}", self.source, reason)
            }
            other => info!("Stream on {} ended: {:?}", self.source, other),
        }
        self.listeners.notify(|l| l.stream_ended(&self.source));
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct CompletionHook {
    detector: Weak<PresenceDetector>,
    generation: u64,
}

impl RecordingCompleteListener for CompletionHook {
    fn recording_complete(&self, _source: &VideoSource, outcome: &RecordingOutcome) {
        if let Some(detector) = self.detector.upgrade() {
            detector.session_completed(self.generation, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureEngine;
    use crate::data::Locator;
    use crate::error::RecorderError;
    use crate::sync::session::SessionSettings;
    use crate::sync::transcode::TranscodeQueue;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeProbe {
        last: Mutex<Option<Instant>>,
        failure: Mutex<Option<String>>,
    }

    impl FakeProbe {
        fn arrive(&self, at: Instant) {
            *self.last.lock().unwrap() = Some(at);
        }
    }

    impl PresenceProbe for FakeProbe {
        fn last_receipt(&self) -> Option<Instant> {
            *self.last.lock().unwrap()
        }

        fn check_health(&self) -> RecorderResult<()> {
            match self.failure.lock().unwrap().clone() {
                Some(reason) => Err(RecorderError::Monitor(reason)),
                None => Ok(()),
            }
        }
    }

    struct EmptyCapture {
        fail: bool,
    }

    impl CaptureEngine for EmptyCapture {
        fn start(&mut self, _locator: &Locator, container: &Path) -> RecorderResult<()> {
            if self.fail {
                return Err(RecorderError::CaptureStart("refused".to_string()));
            }
            std::fs::File::create(container)?;
            Ok(())
        }

        fn stop(&mut self) {}
    }

    #[derive(Default)]
    struct TransitionLog {
        events: Mutex<Vec<&'static str>>,
    }

    impl StreamListener for TransitionLog {
        fn stream_started(&self, _source: &VideoSource) {
            self.events.lock().unwrap().push("started");
        }

        fn stream_ended(&self, _source: &VideoSource) {
            self.events.lock().unwrap().push("ended");
        }
    }

    struct Harness {
        detector: Arc<PresenceDetector>,
        probe: Arc<FakeProbe>,
        log: Arc<TransitionLog>,
        created: Arc<AtomicUsize>,
        _dir: tempfile::TempDir,
    }

    /// `flush_ms` controls how soon a session with an empty container ends
    fn harness(flush_ms: u64, fail_capture: bool, failing_creates: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root: PathBuf = dir.path().to_path_buf();
        let probe = Arc::new(FakeProbe::default());
        let created = Arc::new(AtomicUsize::new(0));
        let (queue, _rx) = TranscodeQueue::detached(4);

        let counter = created.clone();
        let factory = move |source: &VideoSource| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < failing_creates {
                return Err(RecorderError::InvalidAddress {
                    address: "nowhere:0".to_string(),
                    reason: "unresolvable".to_string(),
                });
            }
            RecordingSession::new(
                source.clone(),
                SessionSettings {
                    scratch_directory: root.join("scratch"),
                    library_directory: root.join("library"),
                    metadata_filename: "metadata.fr".to_string(),
                    container_extension: "ts".to_string(),
                    flush_period: Duration::from_millis(flush_ms),
                    initial_delay: Duration::from_millis(flush_ms),
                    frame_rate: 30,
                    quality: 3,
                },
                Box::new(EmptyCapture { fail: fail_capture }),
                queue.clone(),
            )
        };

        let detector = PresenceDetector::new(
            VideoSource::file("feed", "/dev/null"),
            probe.clone(),
            factory,
            &DetectionConfig {
                poll_interval_ms: 50,
                presence_timeout_secs: 12,
            },
        );
        let log = Arc::new(TransitionLog::default());
        detector.add_listener(log.clone());

        Harness {
            detector,
            probe,
            log,
            created,
            _dir: dir,
        }
    }

    async fn wait_for(detector: &PresenceDetector, state: DetectorState) {
        for _ in 0..100 {
            if detector.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("detector never reached {:?}", state);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_arrival_stays_inactive() {
        let h = harness(10_000, false, 0);
        assert_eq!(h.detector.poll_at(Instant::now()), DetectorState::Inactive);
        assert_eq!(h.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stale_arrival_stays_inactive() {
        let h = harness(10_000, false, 0);
        let t0 = Instant::now();
        h.probe.arrive(t0);

        let now = t0 + Duration::from_secs(12);
        assert_eq!(h.detector.poll_at(now), DetectorState::Inactive);
        assert!(h.log.events.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_continuous_arrivals_activate_exactly_once() {
        let h = harness(10_000, false, 0);
        let t0 = Instant::now();

        for step in 0..5u64 {
            let now = t0 + Duration::from_secs(2 * step);
            h.probe.arrive(now);
            assert_eq!(h.detector.poll_at(now), DetectorState::Active);
        }

        // Silence does not end the stream while the session runs
        let later = t0 + Duration::from_secs(60);
        assert_eq!(h.detector.poll_at(later), DetectorState::Active);

        assert_eq!(h.created.load(Ordering::SeqCst), 1);
        assert_eq!(*h.log.events.lock().unwrap(), ["started"]);
        assert!(h.detector.active_session().is_some());

        let session = h.detector.active_session().unwrap();
        assert_eq!(session.listener_count(), 1);

        h.detector.stop_active();
        assert_eq!(h.detector.state(), DetectorState::Inactive);
        assert!(h.detector.active_session().is_none());
        assert_eq!(*h.log.events.lock().unwrap(), ["started", "ended"]);
        assert_eq!(session.listener_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_end_of_stream_returns_to_inactive_and_rearms() {
        let h = harness(100, false, 0);
        h.probe.arrive(Instant::now());
        assert_eq!(h.detector.poll_at(Instant::now()), DetectorState::Active);

        // The capture never writes, so the first tick ends the session
        wait_for(&h.detector, DetectorState::Inactive).await;
        assert_eq!(*h.log.events.lock().unwrap(), ["started", "ended"]);

        h.probe.arrive(Instant::now());
        assert_eq!(h.detector.poll_at(Instant::now()), DetectorState::Active);
        assert_eq!(h.created.load(Ordering::SeqCst), 2);
        h.detector.stop_active();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_setup_errors_are_retried() {
        let h = harness(10_000, false, 2);
        h.probe.arrive(Instant::now());

        assert_eq!(h.detector.poll_at(Instant::now()), DetectorState::Inactive);
        assert_eq!(h.detector.poll_at(Instant::now()), DetectorState::Inactive);
        assert!(h.log.events.lock().unwrap().is_empty());

        assert_eq!(h.detector.poll_at(Instant::now()), DetectorState::Active);
        assert_eq!(h.created.load(Ordering::SeqCst), 3);
        h.detector.stop_active();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_capture_failure_ends_in_order() {
        let h = harness(10_000, true, 0);
        h.probe.arrive(Instant::now());

        assert_eq!(h.detector.poll_at(Instant::now()), DetectorState::Inactive);
        assert_eq!(*h.log.events.lock().unwrap(), ["started", "ended"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_stops_session_on_shutdown() {
        let h = harness(10_000, false, 0);
        h.probe.arrive(Instant::now());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(h.detector.clone().run(shutdown.clone()));

        wait_for(&h.detector, DetectorState::Active).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(h.detector.state(), DetectorState::Inactive);
        assert_eq!(*h.log.events.lock().unwrap(), ["started", "ended"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_surfaces_monitor_failure() {
        let h = harness(10_000, false, 0);
        *h.probe.failure.lock().unwrap() = Some("socket closed".to_string());

        let result = h.detector.clone().run(CancellationToken::new()).await;
        assert!(matches!(result, Err(RecorderError::Monitor(_))));
    }
}
