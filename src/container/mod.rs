//! Segment container formats
//!
//! Segment files are written and read through the [`ContainerFormat`] seam:
//! the archive never parses container bytes itself. It writes a header from
//! the codec list, one packet at a time, and a trailer carrying the segment's
//! wall-clock start. Reading back gives the codec list, the header metadata,
//! keyframe-aligned seeking and sequential packet reads.
//!
//! FLV is the built-in format ([`flv::FlvFormat`]).

pub mod amf;
pub mod flv;

use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::error::ContainerError;
use crate::media::{CodecDescriptor, Packet};

pub use flv::FlvFormat;

/// Movie-level metadata read from a segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Wall-clock time of the segment's first packet
    pub creation_time: SystemTime,
    /// Presentation offset of the last video packet
    pub duration: Duration,
}

/// Write side of a segment file
pub trait SegmentMuxer: Send {
    /// Write the container header for the given codec list
    fn write_header(&mut self, codecs: &[CodecDescriptor]) -> Result<(), ContainerError>;

    /// Append one packet
    ///
    /// Packet times are stream-relative; the muxer rebases them on the first
    /// packet it writes.
    fn write_packet(&mut self, packet: &Packet) -> Result<(), ContainerError>;

    /// Finish the file, recording its real-world start time
    fn write_trailer(&mut self, start_time: SystemTime) -> Result<(), ContainerError>;
}

/// Read side of a segment file
pub trait SegmentDemuxer: Send {
    /// Codecs recorded in the header, indexed by packet `stream_index`
    fn codecs(&self) -> &[CodecDescriptor];

    /// Header metadata
    fn info(&self) -> SegmentInfo;

    /// Position the reader on the last video keyframe at or before `offset`
    fn seek_to_time(&mut self, offset: Duration) -> Result<(), ContainerError>;

    /// Next packet, or `None` at end of file
    fn read_packet(&mut self) -> Result<Option<Packet>, ContainerError>;

    /// Presentation offset of the last packet read
    fn current_time(&self) -> Duration;
}

/// A segment container format
pub trait ContainerFormat: Send + Sync {
    /// File extension of finalized segments, without the dot
    fn extension(&self) -> &'static str;

    /// Create a new segment file for writing
    fn create(&self, path: &Path) -> Result<Box<dyn SegmentMuxer>, ContainerError>;

    /// Open an existing segment file for reading
    fn open(&self, path: &Path) -> Result<Box<dyn SegmentDemuxer>, ContainerError>;
}
