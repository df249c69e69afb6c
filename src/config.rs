//! Relay configuration
//!
//! Loaded once from a JSON file, validated, then handed to each component.
//! Every field has a default, so a file only needs to list its streams:
//!
//! ```json
//! {
//!   "segment_directory": "/var/lib/camrelay",
//!   "streams": [
//!     { "id": "front-door", "url": "rtsp://10.0.0.7/stream1", "record": true },
//!     { "id": "lobby", "url": "rtsp://10.0.0.8/live", "on_demand": true }
//!   ]
//! }
//! ```
//!
//! Durations are written in whole seconds.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::registry::{RegistryConfig, StreamDescriptor, DEFAULT_QUEUE_CAPACITY};

/// Default root for per-stream segment directories
pub const DEFAULT_SEGMENT_DIRECTORY: &str = "./segments";

/// Default segment size threshold (128 MiB)
pub const DEFAULT_SEGMENT_FILE_SIZE: usize = 128 * 1024 * 1024;

/// Default number of segments kept per stream
pub const DEFAULT_SEGMENT_COUNT: usize = 5;

/// Default in-memory lookback budget (32 MiB)
pub const DEFAULT_RAM_BUFFER_SIZE: usize = 32 * 1024 * 1024;

/// Ingestion worker timings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Connect and negotiate must finish within this time
    #[serde(with = "secs")]
    pub dial_timeout: Duration,

    /// Wait after a failed dial before trying again
    #[serde(with = "secs")]
    pub dial_backoff: Duration,

    /// Wait after a dropped session before reconnecting
    #[serde(with = "secs")]
    pub reconnect_delay: Duration,

    /// Reconnect if no keyframe (or audio, for audio-only streams) arrives
    /// within this window
    #[serde(with = "secs")]
    pub keyframe_timeout: Duration,

    /// How long an on-demand stream may run without viewers
    #[serde(with = "secs")]
    pub idle_timeout: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(3),
            dial_backoff: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
            keyframe_timeout: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(20),
        }
    }
}

impl IngestConfig {
    /// Set the dial timeout
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the backoff after a failed dial
    pub fn dial_backoff(mut self, backoff: Duration) -> Self {
        self.dial_backoff = backoff;
        self
    }

    /// Set the delay before reconnecting a dropped session
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the keyframe watchdog window
    pub fn keyframe_timeout(mut self, timeout: Duration) -> Self {
        self.keyframe_timeout = timeout;
        self
    }

    /// Set the on-demand idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// One upstream stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Unique stream identity
    pub id: String,

    /// Upstream source URL
    pub url: String,

    #[serde(default)]
    pub description: String,

    /// Connect upstream only while someone is watching
    #[serde(default)]
    pub on_demand: bool,

    /// Keep a lookback buffer and a rolling on-disk archive
    #[serde(default)]
    pub record: bool,

    /// Do not set up the upstream audio track
    #[serde(default)]
    pub disable_audio: bool,

    /// Byte budget of the in-memory lookback
    #[serde(default = "default_ram_buffer_size")]
    pub ram_buffer_size: usize,

    /// A segment is closed at the first keyframe past this many bytes
    #[serde(default = "default_segment_file_size")]
    pub segment_file_size: usize,

    /// Segments kept on disk
    #[serde(default = "default_segment_count")]
    pub segment_count: usize,
}

fn default_ram_buffer_size() -> usize {
    DEFAULT_RAM_BUFFER_SIZE
}

fn default_segment_file_size() -> usize {
    DEFAULT_SEGMENT_FILE_SIZE
}

fn default_segment_count() -> usize {
    DEFAULT_SEGMENT_COUNT
}

impl StreamConfig {
    /// Create an always-on, unrecorded stream with default retention sizes
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            description: String::new(),
            on_demand: false,
            record: false,
            disable_audio: false,
            ram_buffer_size: DEFAULT_RAM_BUFFER_SIZE,
            segment_file_size: DEFAULT_SEGMENT_FILE_SIZE,
            segment_count: DEFAULT_SEGMENT_COUNT,
        }
    }

    /// Set the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark the stream as on-demand
    pub fn on_demand(mut self, on_demand: bool) -> Self {
        self.on_demand = on_demand;
        self
    }

    /// Enable or disable recording
    pub fn record(mut self, record: bool) -> Self {
        self.record = record;
        self
    }

    /// Drop the upstream audio track
    pub fn disable_audio(mut self, disable: bool) -> Self {
        self.disable_audio = disable;
        self
    }

    /// Set the in-memory lookback budget
    pub fn ram_buffer_size(mut self, bytes: usize) -> Self {
        self.ram_buffer_size = bytes;
        self
    }

    /// Set the segment size threshold
    pub fn segment_file_size(mut self, bytes: usize) -> Self {
        self.segment_file_size = bytes;
        self
    }

    /// Set the number of segments kept
    pub fn segment_count(mut self, count: usize) -> Self {
        self.segment_count = count;
        self
    }

    /// Registry descriptor for this stream
    pub fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor::new(self.id.as_str(), self.url.clone())
            .description(self.description.clone())
            .on_demand(self.on_demand)
            .record(self.record)
    }
}

/// Whole relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root under which each recorded stream gets its own directory
    pub segment_directory: PathBuf,

    /// Packets queued per subscriber before drops start
    pub subscriber_queue: usize,

    pub ingest: IngestConfig,

    pub streams: Vec<StreamConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            segment_directory: PathBuf::from(DEFAULT_SEGMENT_DIRECTORY),
            subscriber_queue: DEFAULT_QUEUE_CAPACITY,
            ingest: IngestConfig::default(),
            streams: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Read and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let config = Self::from_json(&text)?;

        tracing::info!(
            path = %path.display(),
            streams = config.streams.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the components cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscriber_queue == 0 {
            return Err(ConfigError::Invalid(
                "subscriber_queue must be at least 1".into(),
            ));
        }

        if self.ingest.keyframe_timeout.is_zero() || self.ingest.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "keyframe_timeout and idle_timeout must be non-zero".into(),
            ));
        }

        let mut seen = HashSet::new();
        for stream in &self.streams {
            if stream.id.is_empty() {
                return Err(ConfigError::Invalid("stream with empty id".into()));
            }
            if !seen.insert(stream.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate stream id '{}'",
                    stream.id
                )));
            }
            if stream.url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "stream '{}' has no url",
                    stream.id
                )));
            }
            if stream.record {
                let zero = [
                    ("ram_buffer_size", stream.ram_buffer_size),
                    ("segment_file_size", stream.segment_file_size),
                    ("segment_count", stream.segment_count),
                ]
                .into_iter()
                .find(|(_, value)| *value == 0);

                if let Some((field, _)) = zero {
                    return Err(ConfigError::Invalid(format!(
                        "recorded stream '{}' needs a non-zero {}",
                        stream.id, field
                    )));
                }
            }
        }
        Ok(())
    }

    /// Registry settings derived from this config
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig::default().queue_capacity(self.subscriber_queue)
    }

    /// Set the segment root directory
    pub fn segment_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.segment_directory = directory.into();
        self
    }

    /// Set the per-subscriber queue capacity
    pub fn subscriber_queue(mut self, capacity: usize) -> Self {
        self.subscriber_queue = capacity;
        self
    }

    /// Set the ingestion timings
    pub fn ingest(mut self, ingest: IngestConfig) -> Self {
        self.ingest = ingest;
        self
    }

    /// Add a stream
    pub fn stream(mut self, stream: StreamConfig) -> Self {
        self.streams.push(stream);
        self
    }
}

/// `Duration` as whole seconds
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
