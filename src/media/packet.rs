//! Elementary-stream packets
//!
//! A packet is one access unit read from an upstream source: a video frame or
//! an audio frame, tagged with the elementary stream it belongs to.

use std::time::Duration;

use bytes::Bytes;

/// A demultiplexed media packet
///
/// Cheap to clone: the payload is reference counted, so every subscriber gets
/// its own `Packet` value without copying the frame data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Index into the stream's codec list
    pub stream_index: usize,
    /// Decode time relative to the start of the upstream session
    pub time: Duration,
    /// Presentation offset from `time`, when the source reports one
    pub composition_time: Option<Duration>,
    /// Whether the packet is a random access point
    pub is_keyframe: bool,
    /// Raw payload
    pub data: Bytes,
}

impl Packet {
    /// Create a packet with no composition offset
    pub fn new(stream_index: usize, time: Duration, is_keyframe: bool, data: Bytes) -> Self {
        Self {
            stream_index,
            time,
            composition_time: None,
            is_keyframe,
            data,
        }
    }

    /// Attach a composition offset
    pub fn with_composition_time(mut self, offset: Duration) -> Self {
        self.composition_time = Some(offset);
        self
    }

    /// Presentation time: decode time plus the composition offset
    pub fn presentation_time(&self) -> Duration {
        self.time + self.composition_time.unwrap_or_default()
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}
