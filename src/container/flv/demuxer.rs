//! FLV segment reader
//!
//! Opening a file reads the metadata and decoder configuration, then walks
//! the tag headers once to build an index of media tags. Bodies are only read
//! on `read_packet`, so opening a large segment to read a few frames stays
//! cheap.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::container::amf::{Amf0Decoder, AmfValue};
use crate::container::{SegmentDemuxer, SegmentInfo};
use crate::error::ContainerError;
use crate::media::{CodecDescriptor, CodecKind, MediaKind, Packet};

use super::tag::{self, FlvTagType, TagHeader};
use super::{KEY_CREATION_TIME, KEY_DURATION};

/// Largest script tag accepted
const MAX_SCRIPT_SIZE: u32 = 64 * 1024;

/// One media tag in the file
#[derive(Debug, Clone, Copy)]
struct TagEntry {
    /// File offset of the tag body
    body_offset: u64,
    size: u32,
    media: MediaKind,
    timestamp: u32,
    keyframe: bool,
}

/// Reads one FLV segment file
pub struct FlvDemuxer {
    reader: BufReader<File>,
    codecs: Vec<CodecDescriptor>,
    /// Codec list position of the video and audio track
    video_index: Option<usize>,
    audio_index: Option<usize>,
    info: SegmentInfo,
    tags: Vec<TagEntry>,
    cursor: usize,
    current_time: Duration,
}

impl FlvDemuxer {
    /// Open and index the file at `path`
    pub fn open(path: &Path) -> Result<Self, ContainerError> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut header = [0u8; tag::FILE_HEADER_SIZE];
        reader.read_exact(&mut header).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => ContainerError::InvalidHeader,
            _ => ContainerError::Io(e),
        })?;
        let first_tag = tag::parse_file_header(&header)?;
        reader.seek(SeekFrom::Start(first_tag))?;

        let script_header = read_tag_header(&mut reader)?
            .ok_or(ContainerError::MissingMetadata("onMetaData"))?;
        if script_header.tag_type != FlvTagType::Script
            || script_header.data_size > MAX_SCRIPT_SIZE
        {
            return Err(ContainerError::MissingMetadata("onMetaData"));
        }
        let script = read_body(&mut reader, script_header.data_size)?;
        skip_prev_tag_size(&mut reader)?;
        let metadata = parse_metadata(script)?;

        let info = SegmentInfo {
            creation_time: metadata_time(&metadata)?,
            duration: metadata_duration(&metadata)?,
        };
        let mut layout = TrackLayout::from_metadata(&metadata)?;

        let mut tags = Vec::new();
        let mut pos = reader.stream_position()?;
        while let Some(header) = read_tag_header(&mut reader)? {
            let body_offset = pos + tag::TAG_HEADER_SIZE as u64;
            let next = body_offset + header.data_size as u64 + tag::PREV_TAG_SIZE as u64;
            if next > file_len {
                tracing::debug!(
                    path = %path.display(),
                    offset = pos,
                    "Truncated trailing tag ignored"
                );
                break;
            }

            match header.tag_type {
                FlvTagType::Video => {
                    if header.data_size < 5 {
                        return Err(ContainerError::Malformed("short video tag".into()));
                    }
                    // Frame type and packet type are enough to index
                    let prefix = read_body(&mut reader, 5)?;
                    if prefix[1] == tag::PACKET_SEQUENCE_HEADER {
                        let config = read_body(&mut reader, header.data_size - 5)?;
                        layout.set_extra_data(MediaKind::Video, config);
                    } else {
                        tags.push(TagEntry {
                            body_offset,
                            size: header.data_size,
                            media: MediaKind::Video,
                            timestamp: header.timestamp,
                            keyframe: tag::VideoFrameType::from_byte(prefix[0])
                                == Some(tag::VideoFrameType::Keyframe),
                        });
                    }
                }
                FlvTagType::Audio => {
                    let prefix = read_body(&mut reader, header.data_size.min(2))?;
                    let is_sequence_header = prefix.len() == 2
                        && tag::audio_codec_from_byte(prefix[0]) == Some(CodecKind::Aac)
                        && prefix[1] == tag::PACKET_SEQUENCE_HEADER;

                    if is_sequence_header {
                        let config = read_body(&mut reader, header.data_size - 2)?;
                        layout.set_extra_data(MediaKind::Audio, config);
                    } else {
                        tags.push(TagEntry {
                            body_offset,
                            size: header.data_size,
                            media: MediaKind::Audio,
                            timestamp: header.timestamp,
                            keyframe: false,
                        });
                    }
                }
                FlvTagType::Script => {}
            }

            reader.seek(SeekFrom::Start(next))?;
            pos = next;
        }

        let (codecs, video_index, audio_index) = layout.into_codecs();

        Ok(Self {
            reader,
            codecs,
            video_index,
            audio_index,
            info,
            tags,
            cursor: 0,
            current_time: Duration::ZERO,
        })
    }

    /// Track that seeking aligns to: video, or audio in audio-only files
    fn primary(&self) -> MediaKind {
        if self.video_index.is_some() {
            MediaKind::Video
        } else {
            MediaKind::Audio
        }
    }

    fn is_sync_point(&self, entry: &TagEntry) -> bool {
        entry.media == self.primary() && (entry.keyframe || entry.media == MediaKind::Audio)
    }
}

impl SegmentDemuxer for FlvDemuxer {
    fn codecs(&self) -> &[CodecDescriptor] {
        &self.codecs
    }

    fn info(&self) -> SegmentInfo {
        self.info
    }

    fn seek_to_time(&mut self, offset: Duration) -> Result<(), ContainerError> {
        let target = offset.as_millis().min(u32::MAX as u128) as u32;

        let mut found = None;
        for (i, entry) in self.tags.iter().enumerate() {
            if !self.is_sync_point(entry) {
                continue;
            }
            if entry.timestamp > target && found.is_some() {
                break;
            }
            found = Some(i);
            if entry.timestamp > target {
                break;
            }
        }

        let index =
            found.ok_or_else(|| ContainerError::Malformed("segment has no keyframe".into()))?;
        self.cursor = index;
        self.current_time = Duration::from_millis(self.tags[index].timestamp as u64);
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, ContainerError> {
        let Some(entry) = self.tags.get(self.cursor).copied() else {
            return Ok(None);
        };
        self.cursor += 1;

        self.reader.seek(SeekFrom::Start(entry.body_offset))?;
        let body = read_body(&mut self.reader, entry.size)?;
        let time = Duration::from_millis(entry.timestamp as u64);

        let packet = match entry.media {
            MediaKind::Video => {
                let parsed = tag::parse_video_body(body)?;
                let stream_index = self.video_index.unwrap_or_default();
                let packet = Packet::new(stream_index, time, parsed.keyframe, parsed.data);
                if parsed.cts > 0 {
                    packet.with_composition_time(Duration::from_millis(parsed.cts as u64))
                } else {
                    packet
                }
            }
            MediaKind::Audio => {
                let parsed = tag::parse_audio_body(body)?;
                let stream_index = self.audio_index.unwrap_or_default();
                Packet::new(stream_index, time, false, parsed.data)
            }
        };

        self.current_time = packet.presentation_time();
        Ok(Some(packet))
    }

    fn current_time(&self) -> Duration {
        self.current_time
    }
}

/// Tracks declared by the metadata, completed by the sequence headers
struct TrackLayout {
    video: Option<(usize, CodecDescriptor)>,
    audio: Option<(usize, CodecDescriptor)>,
}

impl TrackLayout {
    fn from_metadata(metadata: &AmfValue) -> Result<Self, ContainerError> {
        let number = |key: &str| metadata.get(key).and_then(AmfValue::as_number);

        let video = match (number("videoindex"), number("videocodecid")) {
            (Some(index), Some(id)) => {
                let kind = tag::video_codec_from_id(id as u8).ok_or_else(|| {
                    ContainerError::Unsupported(format!("FLV video codec id {}", id))
                })?;
                let mut codec = CodecDescriptor::video(kind, Bytes::new());
                if let (Some(w), Some(h)) = (number("width"), number("height")) {
                    codec = codec.with_dimensions(w as u32, h as u32);
                }
                Some((index as usize, codec))
            }
            _ => None,
        };

        let audio = match (number("audioindex"), number("audiocodecid")) {
            (Some(index), Some(id)) => {
                let kind = tag::audio_codec_from_byte((id as u8) << 4).ok_or_else(|| {
                    ContainerError::Unsupported(format!("FLV sound format {}", id))
                })?;
                let rate = number("audiosamplerate").unwrap_or(8000.0) as u32;
                let channels = number("audiochannels").unwrap_or(1.0) as u16;
                Some((
                    index as usize,
                    CodecDescriptor::audio(kind, Bytes::new(), rate, channels),
                ))
            }
            _ => None,
        };

        if video.is_none() && audio.is_none() {
            return Err(ContainerError::MissingMetadata("videoindex"));
        }

        Ok(Self { video, audio })
    }

    fn set_extra_data(&mut self, media: MediaKind, data: Bytes) {
        let slot = match media {
            MediaKind::Video => &mut self.video,
            MediaKind::Audio => &mut self.audio,
        };
        if let Some((_, codec)) = slot {
            codec.extra_data = data;
        }
    }

    /// Codec list in original stream order, plus each track's position in it
    fn into_codecs(self) -> (Vec<CodecDescriptor>, Option<usize>, Option<usize>) {
        match (self.video, self.audio) {
            (Some((vi, v)), Some((ai, a))) if ai < vi => (vec![a, v], Some(1), Some(0)),
            (Some((_, v)), Some((_, a))) => (vec![v, a], Some(0), Some(1)),
            (Some((_, v)), None) => (vec![v], Some(0), None),
            (None, Some((_, a))) => (vec![a], None, Some(0)),
            (None, None) => (Vec::new(), None, None),
        }
    }
}

fn read_tag_header(reader: &mut BufReader<File>) -> Result<Option<TagHeader>, ContainerError> {
    let mut buf = [0u8; tag::TAG_HEADER_SIZE];
    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(Some(TagHeader::parse(&buf)?)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_body(reader: &mut BufReader<File>, size: u32) -> Result<Bytes, ContainerError> {
    let mut body = vec![0u8; size as usize];
    reader.read_exact(&mut body)?;
    Ok(Bytes::from(body))
}

fn skip_prev_tag_size(reader: &mut BufReader<File>) -> Result<(), ContainerError> {
    reader.seek_relative(tag::PREV_TAG_SIZE as i64)?;
    Ok(())
}

fn parse_metadata(mut script: Bytes) -> Result<AmfValue, ContainerError> {
    let values = Amf0Decoder::new().decode_all(&mut script)?;
    match values.as_slice() {
        [name, metadata, ..] if name.as_str() == Some("onMetaData") => Ok(metadata.clone()),
        _ => Err(ContainerError::MissingMetadata("onMetaData")),
    }
}

fn metadata_time(metadata: &AmfValue) -> Result<SystemTime, ContainerError> {
    let ms = metadata
        .get(KEY_CREATION_TIME)
        .and_then(AmfValue::as_number)
        .ok_or(ContainerError::MissingMetadata(KEY_CREATION_TIME))?;
    if !ms.is_finite() || ms < 0.0 {
        return Err(ContainerError::Malformed(format!("bad creation time {}", ms)));
    }
    Ok(SystemTime::UNIX_EPOCH + Duration::from_millis(ms as u64))
}

fn metadata_duration(metadata: &AmfValue) -> Result<Duration, ContainerError> {
    let secs = metadata
        .get(KEY_DURATION)
        .and_then(AmfValue::as_number)
        .ok_or(ContainerError::MissingMetadata(KEY_DURATION))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(ContainerError::Malformed(format!("bad duration {}", secs)));
    }
    Ok(Duration::from_millis((secs * 1000.0).round() as u64))
}
