//! Recording metadata descriptor
//!
//! One descriptor is written into the frame directory when a session starts and
//! amended with the end time when it stops. The on-disk form is flat
//! `key=value` text so non-Rust tooling can read it back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{RecorderError, RecorderResult};

/// End time value while a recording is still open
pub const OPEN_END_TIME: i64 = -1;

const KEY_RECORDING_ID: &str = "recording.id";
const KEY_SOURCE_ID: &str = "video.source.id";
const KEY_NAME: &str = "name";
const KEY_FPS: &str = "fps";
const KEY_FRAME_DIR: &str = "frame.dir";
const KEY_CONTAINER: &str = "original.file.name";
const KEY_START_TIME: &str = "start.time";
const KEY_END_TIME: &str = "end.time";
const KEY_WIDTH: &str = "image.width";
const KEY_HEIGHT: &str = "image.height";

/// Descriptor of one recording session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingMetadata {
    recording_id: Uuid,
    source_id: Uuid,
    name: String,
    fps: u32,
    container_path: PathBuf,
    frame_directory: PathBuf,
    /// Milliseconds since the Unix epoch
    start_time_ms: i64,
    /// Milliseconds since the Unix epoch, [`OPEN_END_TIME`] while recording
    end_time_ms: i64,
    width: Option<u32>,
    height: Option<u32>,
}

impl RecordingMetadata {
    /// Create the descriptor for a session that is starting now
    pub fn new(
        source_id: Uuid,
        name: String,
        fps: u32,
        container_path: PathBuf,
        frame_directory: PathBuf,
        start_time_ms: i64,
    ) -> Self {
        Self {
            recording_id: Uuid::new_v4(),
            source_id,
            name,
            fps,
            container_path,
            frame_directory,
            start_time_ms,
            end_time_ms: OPEN_END_TIME,
            width: None,
            height: None,
        }
    }

    pub fn recording_id(&self) -> Uuid {
        self.recording_id
    }

    pub fn source_id(&self) -> Uuid {
        self.source_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn container_path(&self) -> &Path {
        &self.container_path
    }

    pub fn frame_directory(&self) -> &Path {
        &self.frame_directory
    }

    pub fn start_time_ms(&self) -> i64 {
        self.start_time_ms
    }

    pub fn end_time_ms(&self) -> i64 {
        self.end_time_ms
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.width.zip(self.height)
    }

    /// Whether the recording has not been closed yet
    pub fn is_open(&self) -> bool {
        self.end_time_ms == OPEN_END_TIME
    }

    /// Record the end of the session. Dimensions already known are kept.
    pub fn close(&mut self, end_time_ms: i64, dimensions: Option<(u32, u32)>) {
        self.end_time_ms = end_time_ms;
        if self.dimensions().is_none() {
            if let Some((w, h)) = dimensions {
                self.width = Some(w);
                self.height = Some(h);
            }
        }
    }

    /// Serialize to flat key=value text
    pub fn to_properties(&self) -> String {
        let mut out = String::new();
        out.push_str("# stream-recorder recording metadata\n");

        let mut push = |key: &str, value: &str| {
            out.push_str(key);
            out.push('=');
            out.push_str(&escape(value));
            out.push('\n');
        };

        push(KEY_RECORDING_ID, &self.recording_id.to_string());
        push(KEY_SOURCE_ID, &self.source_id.to_string());
        push(KEY_NAME, &self.name);
        push(KEY_FPS, &self.fps.to_string());
        push(KEY_FRAME_DIR, &self.frame_directory.to_string_lossy());
        push(KEY_CONTAINER, &self.container_path.to_string_lossy());
        push(KEY_START_TIME, &self.start_time_ms.to_string());
        push(KEY_END_TIME, &self.end_time_ms.to_string());
        if let Some((w, h)) = self.dimensions() {
            push(KEY_WIDTH, &w.to_string());
            push(KEY_HEIGHT, &h.to_string());
        }

        out
    }

    /// Parse flat key=value text. Any missing or malformed required field fails
    /// the whole parse.
    pub fn parse(text: &str) -> RecorderResult<Self> {
        let fields = parse_properties(text);

        let width: Option<u32> = optional(&fields, KEY_WIDTH)?;
        let height: Option<u32> = optional(&fields, KEY_HEIGHT)?;
        if width.is_some() != height.is_some() {
            let missing = if width.is_none() { KEY_WIDTH } else { KEY_HEIGHT };
            return Err(RecorderError::MissingField(missing));
        }

        Ok(Self {
            recording_id: required(&fields, KEY_RECORDING_ID)?,
            source_id: required(&fields, KEY_SOURCE_ID)?,
            name: required_str(&fields, KEY_NAME)?.to_string(),
            fps: required(&fields, KEY_FPS)?,
            frame_directory: PathBuf::from(required_str(&fields, KEY_FRAME_DIR)?),
            container_path: PathBuf::from(required_str(&fields, KEY_CONTAINER)?),
            start_time_ms: required(&fields, KEY_START_TIME)?,
            end_time_ms: required(&fields, KEY_END_TIME)?,
            width,
            height,
        })
    }

    /// Write the descriptor, replacing any previous version atomically
    pub fn save(&self, path: &Path) -> RecorderResult<()> {
        let io_err = |source| RecorderError::MetadataIo {
            path: path.to_path_buf(),
            source,
        };

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, self.to_properties()).map_err(io_err)?;
        std::fs::rename(&tmp_path, path).map_err(io_err)
    }

    /// Read a descriptor from disk
    pub fn load(path: &Path) -> RecorderResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| RecorderError::MetadataIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }
}

fn required_str<'a>(
    fields: &'a HashMap<String, String>,
    key: &'static str,
) -> RecorderResult<&'a str> {
    fields
        .get(key)
        .map(String::as_str)
        .ok_or(RecorderError::MissingField(key))
}

fn required<T: FromStr>(fields: &HashMap<String, String>, key: &'static str) -> RecorderResult<T> {
    let value = required_str(fields, key)?;
    value.trim().parse().map_err(|_| RecorderError::MalformedField {
        key,
        value: value.to_string(),
    })
}

fn optional<T: FromStr>(
    fields: &HashMap<String, String>,
    key: &'static str,
) -> RecorderResult<Option<T>> {
    match fields.get(key) {
        None => Ok(None),
        Some(_) => required(fields, key).map(Some),
    }
}

fn parse_properties(text: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();

    for line in text.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        fields.insert(key.trim().to_string(), unescape(value));
    }

    fields
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
