//! FLV segment files
//!
//! One video track (H.264 or H.265) and one audio track (AAC, G.711 A-law or
//! mu-law) per file. The `onMetaData` script tag records the segment's
//! wall-clock start as `creationtime` (unix milliseconds) next to the usual
//! `duration` (seconds), plus the codec list positions of both tracks so a
//! reader can rebuild packet stream indexes.

pub mod demuxer;
pub mod muxer;
pub mod tag;

use std::path::Path;

use crate::container::{ContainerFormat, SegmentDemuxer, SegmentMuxer};
use crate::error::ContainerError;

pub use demuxer::FlvDemuxer;
pub use muxer::FlvMuxer;

pub(crate) const KEY_DURATION: &str = "duration";
pub(crate) const KEY_CREATION_TIME: &str = "creationtime";

/// FLV segment container
#[derive(Debug, Clone, Copy, Default)]
pub struct FlvFormat;

impl ContainerFormat for FlvFormat {
    fn extension(&self) -> &'static str {
        "flv"
    }

    fn create(&self, path: &Path) -> Result<Box<dyn SegmentMuxer>, ContainerError> {
        Ok(Box::new(FlvMuxer::create(path)?))
    }

    fn open(&self, path: &Path) -> Result<Box<dyn SegmentDemuxer>, ContainerError> {
        Ok(Box::new(FlvDemuxer::open(path)?))
    }
}
