//! Error types
//!
//! Component errors are returned to their immediate caller, which decides
//! whether to retry, log and continue, or escalate. The crate-level [`Error`]
//! wraps them for APIs that cross component boundaries.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

pub use crate::registry::RegistryError;

/// Result alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level error
#[derive(Debug)]
pub enum Error {
    /// Filesystem or socket failure
    Io(std::io::Error),
    /// Invalid or unreadable configuration
    Config(ConfigError),
    /// Stream registry failure
    Registry(RegistryError),
    /// Upstream source failure
    Source(SourceError),
    /// Segment container failure
    Container(ContainerError),
    /// No data covers the requested time
    Lookup(LookupError),
}

impl Error {
    /// Whether this error means "no data for that time / that stream"
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Lookup(_) | Error::Registry(RegistryError::StreamNotFound(_))
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Config(e) => write!(f, "Config error: {}", e),
            Error::Registry(e) => write!(f, "Registry error: {}", e),
            Error::Source(e) => write!(f, "Source error: {}", e),
            Error::Container(e) => write!(f, "Container error: {}", e),
            Error::Lookup(e) => write!(f, "Not found: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Config(e) => Some(e),
            Error::Registry(e) => Some(e),
            Error::Source(e) => Some(e),
            Error::Container(e) => Some(e),
            Error::Lookup(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Error::Registry(e)
    }
}

impl From<SourceError> for Error {
    fn from(e: SourceError) -> Self {
        Error::Source(e)
    }
}

impl From<ContainerError> for Error {
    fn from(e: ContainerError) -> Self {
        Error::Container(e)
    }
}

impl From<LookupError> for Error {
    fn from(e: LookupError) -> Self {
        Error::Lookup(e)
    }
}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read
    Read(PathBuf, std::io::Error),
    /// Config file is not valid JSON for the expected shape
    Parse(serde_json::Error),
    /// Semantically invalid value
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read(path, e) => write!(f, "can't read {}: {}", path.display(), e),
            ConfigError::Parse(e) => write!(f, "can't parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Upstream source errors
///
/// Every variant is retryable: the ingestion worker logs it and reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Could not connect to, or negotiate with, the upstream source
    Dial(String),
    /// Connected but the source reported no usable codecs
    NoCodecs,
    /// Read failure on an established connection
    Read(String),
    /// Upstream signaled that the stream stopped
    Disconnected,
    /// No keyframe (or audio packet, for audio-only streams) within the watchdog window
    NoVideo(Duration),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Dial(msg) => write!(f, "dial failed: {}", msg),
            SourceError::NoCodecs => write!(f, "source reported no codecs"),
            SourceError::Read(msg) => write!(f, "read failed: {}", msg),
            SourceError::Disconnected => write!(f, "upstream stopped the stream"),
            SourceError::NoVideo(window) => {
                write!(f, "no video on stream for {}s", window.as_secs())
            }
        }
    }
}

impl std::error::Error for SourceError {}

/// Segment container errors
#[derive(Debug)]
pub enum ContainerError {
    /// Underlying file failure
    Io(std::io::Error),
    /// File does not start with a valid container header
    InvalidHeader,
    /// Container data is structurally broken
    Malformed(String),
    /// The container cannot carry this codec or track
    Unsupported(String),
    /// Header metadata lacks a required field
    MissingMetadata(&'static str),
}

impl std::fmt::Display for ContainerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerError::Io(e) => write!(f, "{}", e),
            ContainerError::InvalidHeader => write!(f, "invalid container header"),
            ContainerError::Malformed(msg) => write!(f, "malformed container: {}", msg),
            ContainerError::Unsupported(msg) => write!(f, "unsupported: {}", msg),
            ContainerError::MissingMetadata(key) => write!(f, "missing metadata field '{}'", key),
        }
    }
}

impl std::error::Error for ContainerError {}

impl From<std::io::Error> for ContainerError {
    fn from(e: std::io::Error) -> Self {
        ContainerError::Io(e)
    }
}

/// Point-in-time lookup failures; all of them mean "no data for that time"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// Target lies outside the retained `(first, last)` window
    OutOfRange {
        target: SystemTime,
        first: SystemTime,
        last: SystemTime,
    },
    /// No keyframe precedes the target within the retained data
    NoKeyframe(SystemTime),
    /// No indexed segment interval contains the target
    NoSegment(SystemTime),
    /// The index named a segment that is no longer on disk
    SegmentMissing(PathBuf),
    /// The stream has no archive
    NotArchived(String),
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::OutOfRange {
                target,
                first,
                last,
            } => write!(
                f,
                "no packet at {:?} (retained {:?} .. {:?})",
                target, first, last
            ),
            LookupError::NoKeyframe(target) => write!(f, "no keyframe before {:?}", target),
            LookupError::NoSegment(target) => write!(f, "no segment covers {:?}", target),
            LookupError::SegmentMissing(path) => {
                write!(f, "segment {} is missing on disk", path.display())
            }
            LookupError::NotArchived(id) => write!(f, "stream {} is not archived", id),
        }
    }
}

impl std::error::Error for LookupError {}
