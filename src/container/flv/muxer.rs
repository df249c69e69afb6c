//! FLV segment writer

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::container::amf::{Amf0Encoder, AmfValue};
use crate::container::SegmentMuxer;
use crate::error::ContainerError;
use crate::media::{CodecDescriptor, CodecKind, MediaKind, Packet};

use super::tag::{self, FlvTagType, TagHeader};
use super::{KEY_CREATION_TIME, KEY_DURATION};

/// A track the file carries, mapped from the codec list
#[derive(Debug, Clone, Copy)]
struct Track {
    stream_index: usize,
    kind: CodecKind,
}

/// Writes one FLV segment file
///
/// Layout: file header, an `onMetaData` script tag whose `duration` and
/// `creationtime` numbers are patched by the trailer, codec sequence headers,
/// then one tag per packet. Tag timestamps are milliseconds since the first
/// written packet. The recorded duration is the presentation offset of the
/// last video packet, or of the last audio packet in audio-only files.
pub struct FlvMuxer {
    writer: BufWriter<File>,

    /// Bytes written so far; the file offset of the next tag
    offset: u64,

    video: Option<Track>,
    audio: Option<Track>,

    /// File offsets of the metadata numbers patched by the trailer
    duration_pos: u64,
    creation_pos: u64,

    header_written: bool,
    base_time: Option<Duration>,
    last_primary_offset: Duration,
}

impl FlvMuxer {
    /// Create the file at `path`, truncating any existing one
    pub fn create(path: &Path) -> Result<Self, ContainerError> {
        let file = File::create(path)?;

        Ok(Self {
            writer: BufWriter::new(file),
            offset: 0,
            video: None,
            audio: None,
            duration_pos: 0,
            creation_pos: 0,
            header_written: false,
            base_time: None,
            last_primary_offset: Duration::ZERO,
        })
    }

    fn write_tag(
        &mut self,
        tag_type: FlvTagType,
        timestamp: u32,
        body: &[u8],
    ) -> Result<(), ContainerError> {
        let header = TagHeader {
            tag_type,
            data_size: body.len() as u32,
            timestamp,
        };

        self.writer.write_all(&header.encode())?;
        self.writer.write_all(body)?;
        let prev_tag_size = (tag::TAG_HEADER_SIZE + body.len()) as u32;
        self.writer.write_all(&prev_tag_size.to_be_bytes())?;

        self.offset += (tag::TAG_HEADER_SIZE + body.len() + tag::PREV_TAG_SIZE) as u64;
        Ok(())
    }

    fn metadata_body(&self, codecs: &[CodecDescriptor]) -> (Bytes, usize, usize) {
        let mut props: Vec<(String, AmfValue)> = Vec::new();

        if let Some(track) = self.video {
            let codec = &codecs[track.stream_index];
            props.push(("videoindex".into(), AmfValue::Number(track.stream_index as f64)));
            if let Some(id) = tag::video_codec_id(track.kind) {
                props.push(("videocodecid".into(), AmfValue::Number(id as f64)));
            }
            if let (Some(w), Some(h)) = (codec.width, codec.height) {
                props.push(("width".into(), AmfValue::Number(w as f64)));
                props.push(("height".into(), AmfValue::Number(h as f64)));
            }
        }

        if let Some(track) = self.audio {
            let codec = &codecs[track.stream_index];
            props.push(("audioindex".into(), AmfValue::Number(track.stream_index as f64)));
            if let Some(byte) = tag::audio_header_byte(track.kind) {
                props.push(("audiocodecid".into(), AmfValue::Number((byte >> 4) as f64)));
            }
            if let Some(rate) = codec.sample_rate {
                props.push(("audiosamplerate".into(), AmfValue::Number(rate as f64)));
            }
            if let Some(channels) = codec.channels {
                props.push(("audiochannels".into(), AmfValue::Number(channels as f64)));
            }
        }

        props.push(("encoder".into(), AmfValue::String("camrelay".into())));

        let mut enc = Amf0Encoder::new();
        enc.encode(&AmfValue::String("onMetaData".into()));
        enc.begin_ecma_array(props.len() + 2);

        // Fixed-position numbers first; the trailer rewrites them in place
        enc.write_key(KEY_DURATION);
        let duration_at = enc.len() + 1;
        enc.encode(&AmfValue::Number(0.0));
        enc.write_key(KEY_CREATION_TIME);
        let creation_at = enc.len() + 1;
        enc.encode(&AmfValue::Number(0.0));

        for (key, value) in &props {
            enc.write_key(key);
            enc.encode(value);
        }
        enc.end_object();

        (enc.finish(), duration_at, creation_at)
    }

    fn patch_number(&mut self, pos: u64, value: f64) -> Result<(), ContainerError> {
        self.writer.seek(SeekFrom::Start(pos))?;
        self.writer.write_all(&value.to_be_bytes())?;
        Ok(())
    }
}

impl SegmentMuxer for FlvMuxer {
    fn write_header(&mut self, codecs: &[CodecDescriptor]) -> Result<(), ContainerError> {
        if self.header_written {
            return Err(ContainerError::Malformed("header already written".into()));
        }

        for (stream_index, codec) in codecs.iter().enumerate() {
            let track = Track {
                stream_index,
                kind: codec.kind,
            };
            let slot = match codec.kind.media_kind() {
                MediaKind::Video => &mut self.video,
                MediaKind::Audio => &mut self.audio,
            };
            if slot.is_none() {
                *slot = Some(track);
            } else {
                tracing::debug!(
                    codec = %codec.kind,
                    stream_index = stream_index,
                    "Extra track not stored in segment"
                );
            }
        }

        if self.video.is_none() && self.audio.is_none() {
            return Err(ContainerError::Unsupported("no tracks to record".into()));
        }

        self.writer
            .write_all(&tag::file_header(self.video.is_some(), self.audio.is_some()))?;
        self.offset = tag::FILE_HEADER_SIZE as u64;

        let (script, duration_at, creation_at) = self.metadata_body(codecs);
        let body_pos = self.offset + tag::TAG_HEADER_SIZE as u64;
        self.duration_pos = body_pos + duration_at as u64;
        self.creation_pos = body_pos + creation_at as u64;
        self.write_tag(FlvTagType::Script, 0, &script)?;

        if let Some(track) = self.video {
            if let Some(id) = tag::video_codec_id(track.kind) {
                let extra = codecs[track.stream_index].extra_data.clone();
                let body = tag::video_body(id, true, tag::PACKET_SEQUENCE_HEADER, 0, &extra);
                self.write_tag(FlvTagType::Video, 0, &body)?;
            }
        }

        if let Some(track) = self.audio {
            if track.kind == CodecKind::Aac {
                let extra = codecs[track.stream_index].extra_data.clone();
                let body = tag::audio_body(0xAF, Some(tag::PACKET_SEQUENCE_HEADER), &extra);
                self.write_tag(FlvTagType::Audio, 0, &body)?;
            }
        }

        self.header_written = true;
        Ok(())
    }

    fn write_packet(&mut self, packet: &Packet) -> Result<(), ContainerError> {
        if !self.header_written {
            return Err(ContainerError::Malformed("packet before header".into()));
        }

        let base = *self.base_time.get_or_insert(packet.time);
        let offset = packet.time.saturating_sub(base);
        let timestamp = offset.as_millis() as u32;

        match (self.video, self.audio) {
            (Some(track), _) if track.stream_index == packet.stream_index => {
                let id = tag::video_codec_id(track.kind).ok_or_else(|| {
                    ContainerError::Unsupported(format!("{} video in FLV", track.kind))
                })?;
                let cts = packet.composition_time.unwrap_or_default();
                let body = tag::video_body(
                    id,
                    packet.is_keyframe,
                    tag::PACKET_DATA,
                    cts.as_millis() as i32,
                    &packet.data,
                );
                self.write_tag(FlvTagType::Video, timestamp, &body)?;
                self.last_primary_offset = offset + cts;
            }
            (_, Some(track)) if track.stream_index == packet.stream_index => {
                let byte = tag::audio_header_byte(track.kind).ok_or_else(|| {
                    ContainerError::Unsupported(format!("{} audio in FLV", track.kind))
                })?;
                let packet_type = (track.kind == CodecKind::Aac).then_some(tag::PACKET_DATA);
                let body = tag::audio_body(byte, packet_type, &packet.data);
                self.write_tag(FlvTagType::Audio, timestamp, &body)?;
                if self.video.is_none() {
                    self.last_primary_offset = offset;
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn write_trailer(&mut self, start_time: SystemTime) -> Result<(), ContainerError> {
        if !self.header_written {
            return Err(ContainerError::Malformed("trailer before header".into()));
        }

        let creation_ms = start_time
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as f64;

        self.patch_number(self.duration_pos, self.last_primary_offset.as_secs_f64())?;
        self.patch_number(self.creation_pos, creation_ms)?;
        self.writer.seek(SeekFrom::Start(self.offset))?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}
