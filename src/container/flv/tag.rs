//! FLV file and tag framing
//!
//! FLV File Format:
//! ```text
//! +============+==================+==============+==================+
//! | FLV Header | PrevTagSize0 (0) | Tag 1        | PrevTagSize1 ... |
//! | (9 bytes)  | (4 bytes)        | (11+N bytes) | (4 bytes)        |
//! +============+==================+==============+==================+
//! ```
//!
//! FLV Tag Structure:
//! ```text
//! +--------+-------------+-----------+-------------+---------+
//! | Type(1)| DataSize(3) | TS(3+1)   | StreamID(3) | Data(N) |
//! +--------+-------------+-----------+-------------+---------+
//! ```
//!
//! Video Data:
//! ```text
//! +----------+----------+------------+-------------+
//! | FrameType| CodecID  | PacketType | CTS (SI24)  | CodecData...
//! | (4 bits) | (4 bits) | (1 byte)   | (3 bytes)   |
//! +----------+----------+------------+-------------+
//! ```
//!
//! Audio Data:
//! ```text
//! +-----------+---------+----------+----------+
//! |SoundFormat|SoundRate|SoundSize |SoundType | [AACPacketType] AudioData...
//! | (4 bits)  | (2 bits)| (1 bit)  | (1 bit)  |
//! +-----------+---------+----------+----------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ContainerError;
use crate::media::CodecKind;

/// FLV file signature: "FLV" in ASCII
const FLV_SIGNATURE: [u8; 3] = [0x46, 0x4C, 0x56];

/// FLV version (always 1)
const FLV_VERSION: u8 = 0x01;

const FLAG_AUDIO: u8 = 0x04;
const FLAG_VIDEO: u8 = 0x01;

/// FLV header (9 bytes) plus PreviousTagSize0 (4 bytes)
pub const FILE_HEADER_SIZE: usize = 13;

/// Tag header size
pub const TAG_HEADER_SIZE: usize = 11;

/// Trailing PreviousTagSize after every tag
pub const PREV_TAG_SIZE: usize = 4;

/// AVC/HEVC/AAC packet type: decoder configuration
pub const PACKET_SEQUENCE_HEADER: u8 = 0;

/// AVC/HEVC/AAC packet type: coded data
pub const PACKET_DATA: u8 = 1;

/// FLV tag type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlvTagType {
    Audio = 8,
    Video = 9,
    Script = 18,
}

impl FlvTagType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x1F {
            8 => Some(FlvTagType::Audio),
            9 => Some(FlvTagType::Video),
            18 => Some(FlvTagType::Script),
            _ => None,
        }
    }
}

/// Video frame type (upper 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    Keyframe = 1,
    InterFrame = 2,
}

impl VideoFrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            1 => Some(VideoFrameType::Keyframe),
            2 => Some(VideoFrameType::InterFrame),
            _ => None,
        }
    }
}

/// FLV video codec id for a codec, if FLV can carry it
pub fn video_codec_id(kind: CodecKind) -> Option<u8> {
    match kind {
        CodecKind::H264 => Some(7),
        CodecKind::H265 => Some(12),
        _ => None,
    }
}

/// Codec for an FLV video codec id
pub fn video_codec_from_id(id: u8) -> Option<CodecKind> {
    match id & 0x0F {
        7 => Some(CodecKind::H264),
        12 => Some(CodecKind::H265),
        _ => None,
    }
}

/// First byte of an audio tag body for a codec, if FLV can carry it
///
/// AAC is always signaled as 44 kHz stereo 16-bit; the real parameters live in
/// the AudioSpecificConfig. G.711 is signaled as mono 16-bit.
pub fn audio_header_byte(kind: CodecKind) -> Option<u8> {
    match kind {
        CodecKind::Aac => Some(0xAF),
        CodecKind::Pcma => Some(0x72),
        CodecKind::Pcmu => Some(0x82),
        _ => None,
    }
}

/// Codec for an FLV sound format (upper 4 bits of the first audio byte)
pub fn audio_codec_from_byte(b: u8) -> Option<CodecKind> {
    match (b >> 4) & 0x0F {
        7 => Some(CodecKind::Pcma),
        8 => Some(CodecKind::Pcmu),
        10 => Some(CodecKind::Aac),
        _ => None,
    }
}

/// Encode the file header and PreviousTagSize0
pub fn file_header(has_video: bool, has_audio: bool) -> [u8; FILE_HEADER_SIZE] {
    let mut flags = 0;
    if has_video {
        flags |= FLAG_VIDEO;
    }
    if has_audio {
        flags |= FLAG_AUDIO;
    }

    let mut header = [0u8; FILE_HEADER_SIZE];
    header[..3].copy_from_slice(&FLV_SIGNATURE);
    header[3] = FLV_VERSION;
    header[4] = flags;
    header[5..9].copy_from_slice(&9u32.to_be_bytes());
    header
}

/// Validate a file header, returning the offset of the first tag
pub fn parse_file_header(header: &[u8; FILE_HEADER_SIZE]) -> Result<u64, ContainerError> {
    if header[..3] != FLV_SIGNATURE {
        return Err(ContainerError::InvalidHeader);
    }
    let data_offset = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
    if data_offset < 9 {
        return Err(ContainerError::InvalidHeader);
    }
    Ok(data_offset as u64 + PREV_TAG_SIZE as u64)
}

/// Parsed tag header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagHeader {
    pub tag_type: FlvTagType,
    pub data_size: u32,
    /// Timestamp in milliseconds
    pub timestamp: u32,
}

impl TagHeader {
    pub fn encode(&self) -> [u8; TAG_HEADER_SIZE] {
        let size = self.data_size;
        let ts = self.timestamp;
        [
            self.tag_type as u8,
            ((size >> 16) & 0xFF) as u8,
            ((size >> 8) & 0xFF) as u8,
            (size & 0xFF) as u8,
            // Lower 24 bits, then upper 8 bits (extension byte)
            ((ts >> 16) & 0xFF) as u8,
            ((ts >> 8) & 0xFF) as u8,
            (ts & 0xFF) as u8,
            ((ts >> 24) & 0xFF) as u8,
            // Stream ID (always 0 in FLV files)
            0,
            0,
            0,
        ]
    }

    pub fn parse(buf: &[u8; TAG_HEADER_SIZE]) -> Result<Self, ContainerError> {
        let tag_type = FlvTagType::from_byte(buf[0]).ok_or_else(|| {
            ContainerError::Malformed(format!("unknown tag type {}", buf[0]))
        })?;
        let data_size = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[7], buf[4], buf[5], buf[6]]);

        Ok(Self {
            tag_type,
            data_size,
            timestamp,
        })
    }
}

/// Build a video tag body
pub fn video_body(codec_id: u8, keyframe: bool, packet_type: u8, cts: i32, data: &[u8]) -> Bytes {
    let frame_type = if keyframe {
        VideoFrameType::Keyframe
    } else {
        VideoFrameType::InterFrame
    };

    let mut buf = BytesMut::with_capacity(5 + data.len());
    buf.put_u8(((frame_type as u8) << 4) | (codec_id & 0x0F));
    buf.put_u8(packet_type);
    let cts = cts.clamp(-0x80_0000, 0x7F_FFFF) as u32;
    buf.put_u8(((cts >> 16) & 0xFF) as u8);
    buf.put_u8(((cts >> 8) & 0xFF) as u8);
    buf.put_u8((cts & 0xFF) as u8);
    buf.put_slice(data);
    buf.freeze()
}

/// Build an audio tag body
pub fn audio_body(header_byte: u8, packet_type: Option<u8>, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + data.len());
    buf.put_u8(header_byte);
    if let Some(pt) = packet_type {
        buf.put_u8(pt);
    }
    buf.put_slice(data);
    buf.freeze()
}

/// Parsed video tag body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoTagBody {
    pub codec: CodecKind,
    pub keyframe: bool,
    pub packet_type: u8,
    /// Composition time offset in milliseconds
    pub cts: i32,
    pub data: Bytes,
}

impl VideoTagBody {
    pub fn is_sequence_header(&self) -> bool {
        self.packet_type == PACKET_SEQUENCE_HEADER
    }
}

pub fn parse_video_body(body: Bytes) -> Result<VideoTagBody, ContainerError> {
    if body.len() < 5 {
        return Err(ContainerError::Malformed("short video tag".into()));
    }

    let codec = video_codec_from_id(body[0]).ok_or_else(|| {
        ContainerError::Unsupported(format!("FLV video codec id {}", body[0] & 0x0F))
    })?;
    let keyframe = VideoFrameType::from_byte(body[0]) == Some(VideoFrameType::Keyframe);

    // Sign-extend the 24-bit composition time
    let raw = u32::from_be_bytes([0, body[2], body[3], body[4]]);
    let cts = ((raw << 8) as i32) >> 8;

    Ok(VideoTagBody {
        codec,
        keyframe,
        packet_type: body[1],
        cts,
        data: body.slice(5..),
    })
}

/// Parsed audio tag body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTagBody {
    pub codec: CodecKind,
    pub is_sequence_header: bool,
    pub data: Bytes,
}

pub fn parse_audio_body(body: Bytes) -> Result<AudioTagBody, ContainerError> {
    if body.is_empty() {
        return Err(ContainerError::Malformed("empty audio tag".into()));
    }

    let codec = audio_codec_from_byte(body[0]).ok_or_else(|| {
        ContainerError::Unsupported(format!("FLV sound format {}", body[0] >> 4))
    })?;

    if codec == CodecKind::Aac {
        if body.len() < 2 {
            return Err(ContainerError::Malformed("short AAC tag".into()));
        }
        return Ok(AudioTagBody {
            codec,
            is_sequence_header: body[1] == PACKET_SEQUENCE_HEADER,
            data: body.slice(2..),
        });
    }

    Ok(AudioTagBody {
        codec,
        is_sequence_header: false,
        data: body.slice(1..),
    })
}
