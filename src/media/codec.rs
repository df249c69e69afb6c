//! Codec descriptors
//!
//! The codec list of a stream is positional: a packet's `stream_index` is an
//! index into it. Descriptors carry only what muxers and decoders need to
//! initialize; no bitstream parsing happens here.

use bytes::Bytes;

/// Broad media category of an elementary stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Codecs the relay knows how to carry and archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    /// H.264 / AVC
    H264,
    /// H.265 / HEVC
    H265,
    /// AAC (raw frames, no ADTS)
    Aac,
    /// G.711 A-law
    Pcma,
    /// G.711 mu-law
    Pcmu,
}

impl CodecKind {
    /// Media category of this codec
    pub fn media_kind(&self) -> MediaKind {
        match self {
            CodecKind::H264 | CodecKind::H265 => MediaKind::Video,
            CodecKind::Aac | CodecKind::Pcma | CodecKind::Pcmu => MediaKind::Audio,
        }
    }

    /// Short lowercase name, as used in logs and stream listings
    pub fn name(&self) -> &'static str {
        match self {
            CodecKind::H264 => "h264",
            CodecKind::H265 => "h265",
            CodecKind::Aac => "aac",
            CodecKind::Pcma => "pcma",
            CodecKind::Pcmu => "pcmu",
        }
    }
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Description of one elementary stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecDescriptor {
    /// Codec of the stream
    pub kind: CodecKind,
    /// Decoder configuration record (AVCDecoderConfigurationRecord,
    /// HEVCDecoderConfigurationRecord, AudioSpecificConfig); empty if unknown
    pub extra_data: Bytes,
    /// Picture width in pixels (video only)
    pub width: Option<u32>,
    /// Picture height in pixels (video only)
    pub height: Option<u32>,
    /// Sample rate in Hz (audio only)
    pub sample_rate: Option<u32>,
    /// Channel count (audio only)
    pub channels: Option<u16>,
}

impl CodecDescriptor {
    /// Create a video descriptor
    pub fn video(kind: CodecKind, extra_data: Bytes) -> Self {
        Self {
            kind,
            extra_data,
            width: None,
            height: None,
            sample_rate: None,
            channels: None,
        }
    }

    /// Create an audio descriptor
    pub fn audio(kind: CodecKind, extra_data: Bytes, sample_rate: u32, channels: u16) -> Self {
        Self {
            kind,
            extra_data,
            width: None,
            height: None,
            sample_rate: Some(sample_rate),
            channels: Some(channels),
        }
    }

    /// Set the picture dimensions
    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Whether this is a video stream
    pub fn is_video(&self) -> bool {
        self.kind.media_kind() == MediaKind::Video
    }

    /// Whether this is an audio stream
    pub fn is_audio(&self) -> bool {
        self.kind.media_kind() == MediaKind::Audio
    }
}

/// Index of the first video stream, defaulting to 0 when none is flagged video
pub fn video_stream_index(codecs: &[CodecDescriptor]) -> usize {
    codecs.iter().position(|c| c.is_video()).unwrap_or(0)
}

/// Whether the codec list describes a stream with no video at all
pub fn is_audio_only(codecs: &[CodecDescriptor]) -> bool {
    !codecs.is_empty() && codecs.iter().all(|c| c.is_audio())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aac() -> CodecDescriptor {
        CodecDescriptor::audio(CodecKind::Aac, Bytes::from_static(&[0x12, 0x10]), 44100, 2)
    }

    #[test]
    fn test_video_stream_index() {
        let h264 = CodecDescriptor::video(CodecKind::H264, Bytes::new());

        assert_eq!(video_stream_index(&[h264.clone(), aac()]), 0);
        assert_eq!(video_stream_index(&[aac(), h264]), 1);
    }

    #[test]
    fn test_video_stream_index_defaults_to_zero() {
        assert_eq!(video_stream_index(&[aac()]), 0);
        assert_eq!(video_stream_index(&[]), 0);
    }

    #[test]
    fn test_audio_only() {
        assert!(is_audio_only(&[aac()]));
        assert!(!is_audio_only(&[]));
        assert!(!is_audio_only(&[
            aac(),
            CodecDescriptor::video(CodecKind::H265, Bytes::new())
        ]));
    }

    #[test]
    fn test_media_kind() {
        assert_eq!(CodecKind::H264.media_kind(), MediaKind::Video);
        assert_eq!(CodecKind::H265.media_kind(), MediaKind::Video);
        assert_eq!(CodecKind::Pcmu.media_kind(), MediaKind::Audio);
        assert_eq!(CodecKind::Aac.to_string(), "aac");
    }
}
