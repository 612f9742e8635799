//! stream-recorder
//!
//! Watches a multicast group, records the stream while traffic is present and
//! extracts still frames from the recording as it grows.

mod capture;
mod config;
mod data;
mod error;
mod logging;
mod sync;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use capture::{FfmpegCapture, PresenceMonitor};
use config::Config;
use data::VideoSource;
use sync::{
    FfmpegExtractor, PresenceDetector, RecordingSession, SessionSettings, StreamListener,
    TranscodePool,
};

/// How long shutdown waits for queued transcodes
const DRAIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Logs stream transitions and counts the streams seen this run
#[derive(Default)]
struct StreamJournal {
    started: AtomicU64,
    ended: AtomicU64,
}

impl StreamListener for StreamJournal {
    fn stream_started(&self, source: &VideoSource) {
        let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Stream #{} on {} is live", n, source);
    }

    fn stream_ended(&self, source: &VideoSource) {
        let n = self.ended.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Stream #{} on {} is over", n, source);
    }
}

#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    list: bool,
    help: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => parsed.help = true,
            "-l" | "--list" => parsed.list = true,
            "-c" | "--config" => {
                let path = args.next().context("--config needs a path")?;
                parsed.config = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("Unknown argument: {} (see --help)", other),
        }
    }

    Ok(parsed)
}

fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;

    if args.help {
        print_help();
        return Ok(());
    }

    let _log_guard = logging::init_logging()?;
    info!("stream-recorder starting...");

    let config = Config::load(args.config.as_deref())?;
    info!("Configuration loaded from {:?}", config.config_path()?);

    if args.list {
        list_recordings(&config);
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(config))?;

    info!("Shutdown complete");
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let source = config.video_source()?;

    // Presence is always observed on the group, even when recording a file
    let group = VideoSource::network(&config.source.name, &config.source.host, config.source.port)?
        .locator()
        .socket_addr()?;
    let monitor =
        Arc::new(PresenceMonitor::start(group).context("Failed to start presence monitor")?);
    info!("Watching for traffic on {} (bound {})", group, monitor.local_addr());

    let pool = TranscodePool::new(
        Arc::new(FfmpegExtractor::new(&config.transcode)),
        config.transcode.max_concurrent,
        config.transcode.queue_depth,
    );

    let settings = SessionSettings::from_config(&config);
    let capture_config = config.capture.clone();
    let queue = pool.queue();
    let factory = move |source: &VideoSource| {
        RecordingSession::new(
            source.clone(),
            settings.clone(),
            Box::new(FfmpegCapture::new(&capture_config)),
            queue.clone(),
        )
    };

    let detector = PresenceDetector::new(source, monitor.clone(), factory, &config.detection);
    let journal = Arc::new(StreamJournal::default());
    detector.add_listener(journal.clone());

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        ctrl_c.cancel();
    })?;

    info!("Press Ctrl+C to exit...");
    let result = detector.clone().run(shutdown).await;

    // The detector's factory holds a queue handle; the pool only drains once
    // every handle is gone
    drop(detector);

    info!("Waiting for in-flight transcodes...");
    if tokio::time::timeout(DRAIN_TIMEOUT, pool.drain()).await.is_err() {
        warn!(
            "Transcodes still running after {:?}, exiting anyway",
            DRAIN_TIMEOUT
        );
    }

    drop(monitor);
    info!(
        "Recorded {} stream(s) this run",
        journal.ended.load(Ordering::SeqCst)
    );
    result.context("Presence detection stopped")
}

fn list_recordings(config: &Config) {
    let root = &config.recording.library_directory;
    let recordings = data::library::scan(root, &config.recording.metadata_filename);

    if recordings.is_empty() {
        println!("No recordings in {:?}", root);
        return;
    }

    for recording in recordings {
        let started = chrono::DateTime::from_timestamp_millis(recording.start_time_ms())
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| recording.start_time_ms().to_string());
        let length = if recording.is_open() {
            "open".to_string()
        } else {
            format!(
                "{}s",
                (recording.end_time_ms() - recording.start_time_ms()) / 1000
            )
        };
        let size = recording
            .dimensions()
            .map(|(w, h)| format!("{}x{}", w, h))
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{}  {}  {}  {}fps  {}",
            started,
            recording.name(),
            length,
            recording.fps(),
            size
        );
        println!("    id:        {}", recording.recording_id());
        println!("    source:    {}", recording.source_id());
        println!("    frames:    {}", recording.frame_directory().display());
        println!("    container: {}", recording.container_path().display());
    }
}

fn print_help() {
    println!("stream-recorder - Record multicast video streams into still frames");
    println!();
    println!("USAGE:");
    println!("    stream-recorder [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <PATH>  Use this config file instead of the default");
    println!("    -l, --list           List recordings in the library and exit");
    println!("    -h, --help           Print this help message");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG                  Set log level (e.g., debug, info, warn)");
    println!("    STREAM_RECORDER_LOG_PATH  Directory for log files");
    if let Ok(dir) = logging::get_log_dir() {
        println!();
        println!("Logs are written to {}", dir.display());
    }
}
