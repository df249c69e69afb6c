//! Subscriber feeders
//!
//! Each retention tier consumes the stream as its own registry subscriber, so
//! a slow disk never holds back the ring buffer (or live viewers). A feeder
//! runs until its subscription is closed and detaches itself on exit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::media::video_stream_index;
use crate::registry::{StreamId, StreamRegistry, StreamStatus, Subscriber};

use super::ring::RingBuffer;
use super::writer::{SegmentWriter, SessionEnd};

/// Pause before restarting the writer after a failed or stale session
pub const WRITER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Feed video packets into the ring buffer
///
/// The ring is cleared whenever the stream goes offline, reconnects or
/// publishes new codecs, so pre-reconnect data is never served as current.
pub async fn run_ring_feeder(
    registry: Arc<StreamRegistry>,
    mut sub: Subscriber,
    ring: Arc<Mutex<RingBuffer>>,
) {
    let stream = sub.stream.clone();
    let mut status = *sub.status.borrow_and_update();
    let mut video_index = current_video_index(&registry, &stream).await;

    tracing::debug!(stream = %stream, "Ring buffer feeder started");

    loop {
        tokio::select! {
            biased;

            changed = sub.status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *sub.status.borrow_and_update();
                let codecs_changed = current.codec_version != status.codec_version;

                if !current.live || current.is_new_session(&status) || codecs_changed {
                    ring.lock().await.clear();
                }
                if codecs_changed {
                    video_index = current_video_index(&registry, &stream).await;
                }
                status = current;
            }

            packet = sub.packets.recv() => {
                let Some(packet) = packet else {
                    break;
                };
                if status.live && packet.stream_index == video_index {
                    let mut ring = ring.lock().await;
                    if let Some(origin) = status.origin {
                        ring.anchor(origin);
                    }
                    ring.append(packet);
                }
            }
        }
    }

    registry.detach(&stream, sub.id).await;
    tracing::debug!(stream = %stream, "Ring buffer feeder stopped");
}

async fn current_video_index(registry: &StreamRegistry, stream: &StreamId) -> usize {
    video_stream_index(&registry.codecs(stream).await.unwrap_or_default())
}

/// Record every live session of a stream to disk
pub async fn run_segment_feeder(
    registry: Arc<StreamRegistry>,
    mut sub: Subscriber,
    mut writer: SegmentWriter,
) {
    let stream = sub.stream.clone();
    tracing::debug!(stream = %stream, "Segment writer feeder started");

    while let Some(status) = wait_live(&mut sub).await {
        let codecs = match registry.codecs(&stream).await {
            Ok(codecs) if !codecs.is_empty() => codecs,
            Ok(_) => {
                tracing::debug!(stream = %stream, "Live without codecs, waiting");
                if sub.status.changed().await.is_err() {
                    break;
                }
                continue;
            }
            Err(e) => {
                tracing::warn!(stream = %stream, error = %e, "Stream vanished from registry");
                break;
            }
        };

        tracing::info!(
            stream = %stream,
            session = status.session,
            "Recording session started"
        );

        match writer.run_session(&codecs, status, &mut sub).await {
            SessionEnd::Closed => break,
            SessionEnd::StaleFeed | SessionEnd::WriteFailed => {
                tokio::time::sleep(WRITER_RETRY_DELAY).await;
            }
            SessionEnd::Offline | SessionEnd::NewSession | SessionEnd::CodecChange => {}
        }
    }

    registry.detach(&stream, sub.id).await;
    tracing::debug!(stream = %stream, "Segment writer feeder stopped");
}

/// Wait until the stream is live, discarding anything queued meanwhile
///
/// Returns `None` once the subscription is closed.
async fn wait_live(sub: &mut Subscriber) -> Option<StreamStatus> {
    loop {
        let status = *sub.status.borrow_and_update();
        if status.live {
            return Some(status);
        }

        tokio::select! {
            biased;

            changed = sub.status.changed() => {
                changed.ok()?;
            }

            packet = sub.packets.recv() => {
                packet?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;
    use crate::archive::store::SegmentStore;
    use crate::container::FlvFormat;
    use crate::media::{CodecDescriptor, CodecKind, Packet};
    use crate::registry::StreamDescriptor;

    fn codecs() -> Vec<CodecDescriptor> {
        vec![
            CodecDescriptor::video(CodecKind::H264, Bytes::from_static(&[1, 2, 3])),
            CodecDescriptor::audio(CodecKind::Pcmu, Bytes::new(), 8000, 1),
        ]
    }

    fn video(i: u64, key: bool) -> Packet {
        Packet::new(0, Duration::from_millis(i * 40), key, Bytes::from(vec![i as u8; 100]))
    }

    async fn live_registry() -> (Arc<StreamRegistry>, StreamId) {
        let registry = Arc::new(StreamRegistry::new());
        let id = StreamId::new("cam");
        registry
            .add_stream(StreamDescriptor::new(id.clone(), "rtsp://cam"))
            .await
            .unwrap();
        registry.set_codecs(&id, codecs()).await.unwrap();
        registry.set_live(&id, true).await.unwrap();
        (registry, id)
    }

    /// Let spawned feeders drain their queues
    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_ring_feeder_buffers_video_only() {
        let (registry, id) = live_registry().await;
        let ring = Arc::new(Mutex::new(RingBuffer::new(1_000_000)));
        let sub = registry.attach(&id).await.unwrap();
        let feeder = tokio::spawn(run_ring_feeder(registry.clone(), sub, ring.clone()));

        for i in 0..10 {
            registry.broadcast(&id, &video(i, i == 0)).await;
            let audio = Packet::new(1, Duration::from_millis(i * 40 + 5), false, Bytes::from_static(b"a"));
            registry.broadcast(&id, &audio).await;
        }
        settle().await;

        assert_eq!(ring.lock().await.len(), 10);

        feeder.abort();
    }

    #[tokio::test]
    async fn test_ring_feeder_clears_on_offline() {
        let (registry, id) = live_registry().await;
        let ring = Arc::new(Mutex::new(RingBuffer::new(1_000_000)));
        let sub = registry.attach(&id).await.unwrap();
        let feeder = tokio::spawn(run_ring_feeder(registry.clone(), sub, ring.clone()));

        for i in 0..5 {
            registry.broadcast(&id, &video(i, i == 0)).await;
        }
        settle().await;
        assert_eq!(ring.lock().await.len(), 5);

        registry.set_live(&id, false).await.unwrap();
        settle().await;
        assert!(ring.lock().await.is_empty());

        // Reconnect restarts stream time at zero; the fresh clock maps it to now
        registry.set_live(&id, true).await.unwrap();
        registry.broadcast(&id, &video(0, true)).await;
        settle().await;

        let ring = ring.lock().await;
        assert_eq!(ring.len(), 1);
        let (first, _) = ring.time_range().unwrap();
        let age = SystemTime::now().duration_since(first).unwrap_or_default();
        assert!(age < Duration::from_secs(5));

        feeder.abort();
    }

    #[tokio::test]
    async fn test_ring_feeder_detaches_on_close() {
        let (registry, id) = live_registry().await;
        let ring = Arc::new(Mutex::new(RingBuffer::new(1_000)));
        let sub = registry.attach(&id).await.unwrap();
        let sub_id = sub.id;
        let feeder = tokio::spawn(run_ring_feeder(registry.clone(), sub, ring));

        registry.detach(&id, sub_id).await;
        feeder.await.unwrap();
        assert_eq!(registry.subscriber_count(&id).await, 0);
    }

    #[tokio::test]
    async fn test_segment_feeder_records_each_session() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            SegmentStore::open(StreamId::new("cam"), dir.path(), 10, Arc::new(FlvFormat))
                .await
                .unwrap(),
        );

        let (registry, id) = live_registry().await;
        let sub = registry.attach(&id).await.unwrap();
        let sub_id = sub.id;
        let writer = SegmentWriter::new(store.clone(), 1_000_000);
        let feeder = tokio::spawn(run_segment_feeder(registry.clone(), sub, writer));

        for i in 0..10 {
            registry.broadcast(&id, &video(i, i == 0)).await;
        }
        settle().await;

        // Going offline closes the session's segment
        registry.set_live(&id, false).await.unwrap();
        settle().await;
        assert_eq!(store.segments().await.len(), 1);

        registry.set_live(&id, true).await.unwrap();
        settle().await;
        for i in 0..10 {
            registry.broadcast(&id, &video(i, i == 0)).await;
        }
        settle().await;

        registry.detach(&id, sub_id).await;
        feeder.await.unwrap();

        let segments = store.segments().await;
        assert_eq!(segments.len(), 2);
        assert!(segments[0].1.end <= segments[1].1.start);
    }
}
