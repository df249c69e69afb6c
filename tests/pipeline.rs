//! End-to-end relay pipeline: scripted upstream -> worker -> registry ->
//! ring/segment feeders -> point-in-time retrieval

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::mpsc;

use camrelay::archive::{ArchiveSet, Tier};
use camrelay::config::{AppConfig, StreamConfig};
use camrelay::error::SourceError;
use camrelay::ingest::{ConnectOptions, MediaSource, SourceSession, StreamManager};
use camrelay::media::{CodecDescriptor, CodecKind, Packet};
use camrelay::registry::{StreamId, StreamRegistry};

const FRAMES: u64 = 30;

/// Plays 30 frames at 25 fps (keyframe every 5th), then holds the session open
struct ScriptedCamera;

#[async_trait]
impl MediaSource for ScriptedCamera {
    async fn connect(
        &self,
        _url: &str,
        _options: &ConnectOptions,
    ) -> Result<SourceSession, SourceError> {
        let (packet_tx, packets) = mpsc::channel(64);
        let (signal_tx, signals) = mpsc::channel(1);

        tokio::spawn(async move {
            for i in 0..FRAMES {
                let packet = Packet::new(
                    0,
                    Duration::from_millis(i * 40),
                    i % 5 == 0,
                    Bytes::from(vec![i as u8; 100]),
                );
                if packet_tx.send(packet).await.is_err() {
                    return;
                }
            }
            packet_tx.closed().await;
            drop(signal_tx);
        });

        Ok(SourceSession {
            codecs: vec![CodecDescriptor::video(CodecKind::H264, Bytes::from_static(&[1, 2, 3]))],
            packets,
            signals,
        })
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_relay_records_and_serves_both_tiers() {
    let dir = TempDir::new().unwrap();
    let config = AppConfig::default()
        .segment_directory(dir.path())
        .stream(
            StreamConfig::new("cam", "scripted://cam")
                .record(true)
                .ram_buffer_size(1_000_000)
                .segment_file_size(1000),
        );
    config.validate().unwrap();
    let id = StreamId::new("cam");

    let registry = Arc::new(StreamRegistry::with_config(config.registry_config()));
    let manager = StreamManager::from_config(registry.clone(), Arc::new(ScriptedCamera), &config)
        .await
        .unwrap();
    let archives = ArchiveSet::start(registry.clone(), &config).await.unwrap();
    let mut viewer = manager.attach_viewer(&id).await.unwrap();
    manager.start().await.unwrap();

    // The live viewer gets the stream in order, starting on a keyframe
    let first = viewer.recv().await.unwrap();
    assert!(first.is_keyframe);
    assert_eq!(first.time, Duration::ZERO);
    assert!(viewer.current_status().live);

    let archive = archives.archive(&id).unwrap().clone();
    eventually("ring buffer to fill", || async {
        archive.ring().lock().await.len() == FRAMES as usize
    })
    .await;

    // Hot tier: 510 ms in resolves to the keyframe at 400 ms through 520 ms
    let target = archive.ring().lock().await.first_time() + Duration::from_millis(510);
    let snapshot = archives.find_packets(&id, target).await.unwrap();
    assert_eq!(snapshot.tier, Tier::Memory);
    assert_eq!(snapshot.codecs.len(), 1);
    let times: Vec<u64> = snapshot
        .packets
        .iter()
        .map(|p| p.time.as_millis() as u64)
        .collect();
    assert_eq!(times, vec![400, 440, 480, 520]);

    // The keyframe at 800 ms has closed the segment holding 400-760 ms
    eventually("two segments", || async {
        archive.store().segments().await.len() >= 2
    })
    .await;

    // Upstream goes away: ring is cleared, the open segment is finalized
    manager.detach_viewer(&id, viewer.id).await;
    manager.shutdown().await;
    assert!(!registry.is_live(&id).await.unwrap());
    eventually("ring buffer to clear", || async {
        archive.ring().lock().await.is_empty()
    })
    .await;
    archives.shutdown().await;

    let segments = archive.store().segments().await;
    assert!(segments.len() >= 2);
    for pair in segments.windows(2) {
        assert!(pair[0].1.end <= pair[1].1.start);
    }

    // Cold tier answers the same question from disk
    let snapshot = archive.find_packets(&registry, target).await.unwrap();
    assert_eq!(snapshot.tier, Tier::Disk);
    assert_eq!(snapshot.codecs.len(), 1);
    assert!(snapshot.packets[0].is_keyframe);
    assert_eq!(snapshot.packets[0].data[0], 10);
    assert_eq!(snapshot.packets.last().unwrap().data[0], 13);
    assert_eq!(registry.subscriber_count(&id).await, 0);
}

#[tokio::test]
async fn test_unrecorded_stream_has_no_archive() {
    let dir = TempDir::new().unwrap();
    let config = AppConfig::default()
        .segment_directory(dir.path())
        .stream(StreamConfig::new("lobby", "scripted://lobby"));
    let id = StreamId::new("lobby");

    let registry = Arc::new(StreamRegistry::new());
    let manager = StreamManager::from_config(registry.clone(), Arc::new(ScriptedCamera), &config)
        .await
        .unwrap();
    let archives = ArchiveSet::start(registry.clone(), &config).await.unwrap();
    assert!(archives.is_empty());

    let mut viewer = manager.attach_viewer(&id).await.unwrap();
    manager.start().await.unwrap();
    assert!(viewer.recv().await.unwrap().is_keyframe);

    let err = archives
        .find_packets(&id, std::time::SystemTime::now())
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    manager.shutdown().await;
    archives.shutdown().await;
}
