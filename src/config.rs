//! Configuration management for stream-recorder
//!
//! The configuration is loaded once at startup and handed to components by
//! value. Nothing reads it through global state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::data::VideoSource;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// The monitored source
    #[serde(default)]
    pub source: SourceConfig,

    /// Presence detection timing
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Recording session layout and cadence
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Capture engine
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Frame extraction
    #[serde(default)]
    pub transcode: TranscodeConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Human-readable source name, used as the session name prefix
    #[serde(default = "default_source_name")]
    pub name: String,

    /// Multicast group to watch
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the multicast group
    #[serde(default = "default_port")]
    pub port: u32,

    /// Record from this file instead of the group; presence is still
    /// detected on host and port
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// How often the detector re-reads the last arrival time (ms)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Maximum tolerated silence before the source counts as absent (s)
    #[serde(default = "default_presence_timeout")]
    pub presence_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Interval between segmenting ticks (s)
    #[serde(default = "default_flush_period")]
    pub flush_period_secs: u64,

    /// Delay before the first segmenting tick (s), defaults to the flush period
    pub initial_delay_secs: Option<u64>,

    /// Where container files and segments are written
    #[serde(default = "default_scratch_directory")]
    pub scratch_directory: PathBuf,

    /// Where per-session frame directories are created
    #[serde(default = "default_library_directory")]
    pub library_directory: PathBuf,

    /// File name of the metadata descriptor inside each frame directory
    #[serde(default = "default_metadata_filename")]
    pub metadata_filename: String,

    /// Container file extension
    #[serde(default = "default_container_extension")]
    pub container_extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Capture engine executable
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    /// URL scheme used to address network sources
    #[serde(default = "default_url_scheme")]
    pub url_scheme: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeConfig {
    /// Transcoder executable
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    /// Frames extracted per second of video
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// JPEG quality, 1 (best) to 31 (worst)
    #[serde(default = "default_quality")]
    pub quality: u32,

    /// Maximum number of transcodes running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Segments allowed to wait for a free transcode worker
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

// Default value functions
fn default_source_name() -> String {
    "Source".to_string()
}

fn default_host() -> String {
    "239.255.0.1".to_string()
}

fn default_port() -> u32 {
    5004
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_presence_timeout() -> u64 {
    12
}

fn default_flush_period() -> u64 {
    5
}

fn default_scratch_directory() -> PathBuf {
    PathBuf::from("./scratch")
}

fn default_library_directory() -> PathBuf {
    PathBuf::from("./recordings")
}

fn default_metadata_filename() -> String {
    "metadata.fr".to_string()
}

fn default_container_extension() -> String {
    "ts".to_string()
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_url_scheme() -> String {
    "udp".to_string()
}

fn default_frame_rate() -> u32 {
    30
}

fn default_quality() -> u32 {
    3
}

fn default_max_concurrent() -> usize {
    2
}

fn default_queue_depth() -> usize {
    8
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: default_source_name(),
            host: default_host(),
            port: default_port(),
            file: None,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            presence_timeout_secs: default_presence_timeout(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            flush_period_secs: default_flush_period(),
            initial_delay_secs: None,
            scratch_directory: default_scratch_directory(),
            library_directory: default_library_directory(),
            metadata_filename: default_metadata_filename(),
            container_extension: default_container_extension(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            url_scheme: default_url_scheme(),
        }
    }
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            frame_rate: default_frame_rate(),
            quality: default_quality(),
            max_concurrent: default_max_concurrent(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl DetectionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_secs(self.presence_timeout_secs)
    }
}

impl RecordingConfig {
    pub fn flush_period(&self) -> Duration {
        Duration::from_secs(self.flush_period_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs.unwrap_or(self.flush_period_secs))
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location when none
    /// is given. A missing file is created with defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_config_path()?,
        };

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            toml::from_str::<Config>(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?
        } else {
            Config::default()
        };

        config.config_path = Some(config_path.clone());
        if !config_path.exists() {
            config.save()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "stream-recorder", "recorder")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(1..=65535).contains(&self.source.port) {
            anyhow::bail!("source.port must be within 1-65535, got {}", self.source.port);
        }
        if self.detection.poll_interval_ms == 0 {
            anyhow::bail!("detection.poll_interval_ms must be greater than zero");
        }
        if self.recording.flush_period_secs == 0 {
            anyhow::bail!("recording.flush_period_secs must be greater than zero");
        }
        if !(1..=31).contains(&self.transcode.quality) {
            anyhow::bail!(
                "transcode.quality must be within 1-31, got {}",
                self.transcode.quality
            );
        }
        if self.transcode.frame_rate == 0 {
            anyhow::bail!("transcode.frame_rate must be greater than zero");
        }
        if self.transcode.max_concurrent == 0 {
            anyhow::bail!("transcode.max_concurrent must be greater than zero");
        }
        if self.transcode.queue_depth == 0 {
            anyhow::bail!("transcode.queue_depth must be greater than zero");
        }
        Ok(())
    }

    /// Build the monitored video source
    pub fn video_source(&self) -> Result<VideoSource> {
        if let Some(file) = &self.source.file {
            return Ok(VideoSource::file(&self.source.name, file));
        }
        VideoSource::network(&self.source.name, &self.source.host, self.source.port)
            .context("Invalid [source] configuration")
    }
}
