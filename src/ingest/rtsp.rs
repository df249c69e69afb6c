//! RTSP upstream source built on `retina`
//!
//! Describes the camera, sets up every track the relay can carry, plays and
//! demuxes. A background task pumps demuxed frames into the session queues
//! until the upstream ends or the worker drops the session.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use retina::client::{Credentials, PlayOptions, Session, SessionOptions, SetupOptions};
use retina::codec::{CodecItem, ParametersRef};
use tokio::sync::mpsc;
use url::Url;

use crate::error::SourceError;
use crate::media::{CodecDescriptor, CodecKind, MediaKind, Packet};

use super::source::{ConnectOptions, MediaSource, SourceSession, SourceSignal};

/// Packets buffered between the RTSP reader and the worker
const PACKET_QUEUE: usize = 256;

/// RTSP camera source
#[derive(Debug, Clone, Default)]
pub struct RtspSource {
    user_agent: Option<String>,
}

impl RtspSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the User-Agent sent to cameras
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

#[async_trait]
impl MediaSource for RtspSource {
    async fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<SourceSession, SourceError> {
        let url = Url::parse(url).map_err(|e| SourceError::Dial(format!("invalid url: {}", e)))?;

        let creds = (!url.username().is_empty()).then(|| Credentials {
            username: url.username().to_string(),
            password: url.password().unwrap_or("").to_string(),
        });
        let mut session_options = SessionOptions::default().creds(creds);
        if let Some(agent) = &self.user_agent {
            session_options = session_options.user_agent(agent.clone());
        }

        let mut session = Session::describe(url, session_options)
            .await
            .map_err(|e| SourceError::Dial(format!("describe failed: {}", e)))?;

        // retina stream index -> position in our codec list
        let mut tracks = HashMap::new();
        let mut codecs = Vec::new();
        for (i, stream) in session.streams().iter().enumerate() {
            let Some(kind) = codec_kind(stream.encoding_name()) else {
                tracing::debug!(
                    media = stream.media(),
                    encoding = stream.encoding_name(),
                    "Skipping unsupported RTSP track"
                );
                continue;
            };
            if options.disable_audio && kind.media_kind() == MediaKind::Audio {
                continue;
            }
            let channels = stream.channels().map(|c| c.get());
            tracks.insert(i, codecs.len());
            codecs.push(describe(kind, stream.parameters(), stream.clock_rate_hz(), channels));
        }

        if codecs.is_empty() {
            return Err(SourceError::NoCodecs);
        }

        let mut setup: Vec<usize> = tracks.keys().copied().collect();
        setup.sort_unstable();
        for i in setup {
            session
                .setup(i, SetupOptions::default())
                .await
                .map_err(|e| SourceError::Dial(format!("setup failed: {}", e)))?;
        }

        let demuxed = session
            .play(PlayOptions::default())
            .await
            .map_err(|e| SourceError::Dial(format!("play failed: {}", e)))?
            .demuxed()
            .map_err(|e| SourceError::Dial(format!("demux failed: {}", e)))?;

        let (packet_tx, packets) = mpsc::channel(PACKET_QUEUE);
        let (signal_tx, signals) = mpsc::channel(4);
        tokio::spawn(pump(demuxed, tracks, codecs.clone(), packet_tx, signal_tx));

        Ok(SourceSession {
            codecs,
            packets,
            signals,
        })
    }
}

async fn pump(
    demuxed: retina::client::Demuxed,
    tracks: HashMap<usize, usize>,
    mut codecs: Vec<CodecDescriptor>,
    packets: mpsc::Sender<Packet>,
    signals: mpsc::Sender<SourceSignal>,
) {
    tokio::pin!(demuxed);

    loop {
        let item = match demuxed.next().await {
            Some(Ok(item)) => item,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "RTSP read failed");
                break;
            }
            None => break,
        };

        let packet = match item {
            CodecItem::VideoFrame(frame) => {
                let Some(&index) = tracks.get(&frame.stream_id()) else {
                    continue;
                };

                if frame.has_new_parameters() {
                    let stream = &demuxed.streams()[frame.stream_id()];
                    let kind = codecs[index].kind;
                    codecs[index] = describe(kind, stream.parameters(), stream.clock_rate_hz(), None);
                    if signals.send(SourceSignal::CodecUpdate(codecs.clone())).await.is_err() {
                        return;
                    }
                }

                let time = stream_time(frame.timestamp());
                let is_keyframe = frame.is_random_access_point();
                Packet::new(index, time, is_keyframe, Bytes::from(frame.into_data()))
            }
            CodecItem::AudioFrame(frame) => {
                let Some(&index) = tracks.get(&frame.stream_id()) else {
                    continue;
                };
                // Every audio frame is a sync point
                Packet::new(
                    index,
                    stream_time(frame.timestamp()),
                    true,
                    Bytes::copy_from_slice(frame.data()),
                )
            }
            _ => continue,
        };

        if packets.send(packet).await.is_err() {
            // Worker dropped the session
            return;
        }
    }

    let _ = signals.send(SourceSignal::Stopped).await;
}

fn codec_kind(encoding: &str) -> Option<CodecKind> {
    match encoding.to_ascii_lowercase().as_str() {
        "h264" => Some(CodecKind::H264),
        "h265" => Some(CodecKind::H265),
        "mpeg4-generic" => Some(CodecKind::Aac),
        "pcma" => Some(CodecKind::Pcma),
        "pcmu" => Some(CodecKind::Pcmu),
        _ => None,
    }
}

fn describe(
    kind: CodecKind,
    parameters: Option<ParametersRef<'_>>,
    clock_rate: u32,
    channels: Option<u16>,
) -> CodecDescriptor {
    match (kind.media_kind(), parameters) {
        (MediaKind::Video, Some(ParametersRef::Video(video))) => {
            let (width, height) = video.pixel_dimensions();
            CodecDescriptor::video(kind, Bytes::copy_from_slice(video.extra_data()))
                .with_dimensions(width, height)
        }
        // Parameters not in the SDP; they arrive in-band with a later frame
        (MediaKind::Video, _) => CodecDescriptor::video(kind, Bytes::new()),
        (MediaKind::Audio, Some(ParametersRef::Audio(audio))) => CodecDescriptor::audio(
            kind,
            Bytes::copy_from_slice(audio.extra_data()),
            audio.clock_rate(),
            channels.unwrap_or(1),
        ),
        (MediaKind::Audio, _) => {
            CodecDescriptor::audio(kind, Bytes::new(), clock_rate, channels.unwrap_or(1))
        }
    }
}

/// Stream-relative time of an RTP timestamp
fn stream_time(timestamp: retina::Timestamp) -> Duration {
    let ticks = timestamp.elapsed().max(0) as u128;
    let rate = u128::from(timestamp.clock_rate().get());
    Duration::from_nanos((ticks * 1_000_000_000 / rate) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_kind() {
        assert_eq!(codec_kind("H264"), Some(CodecKind::H264));
        assert_eq!(codec_kind("h265"), Some(CodecKind::H265));
        assert_eq!(codec_kind("MPEG4-GENERIC"), Some(CodecKind::Aac));
        assert_eq!(codec_kind("pcmu"), Some(CodecKind::Pcmu));
        assert_eq!(codec_kind("jpeg"), None);
    }

    #[test]
    fn test_describe_without_parameters() {
        let video = describe(CodecKind::H264, None, 90_000, None);
        assert!(video.is_video());
        assert!(video.extra_data.is_empty());

        let audio = describe(CodecKind::Pcma, None, 8000, None);
        assert_eq!(audio.sample_rate, Some(8000));
        assert_eq!(audio.channels, Some(1));
    }
}
