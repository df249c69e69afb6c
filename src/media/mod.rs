//! Packet and codec model
//!
//! Value types shared by every other component:
//! - `Packet`: one demultiplexed access unit
//! - `CodecDescriptor`: per-elementary-stream codec information

pub mod codec;
pub mod packet;

pub use codec::{is_audio_only, video_stream_index, CodecDescriptor, CodecKind, MediaKind};
pub use packet::Packet;
