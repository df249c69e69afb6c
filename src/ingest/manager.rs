//! Stream manager
//!
//! Owns the ingestion worker of every configured stream. Always-on and
//! recorded streams get their worker at startup; on-demand streams get one
//! when the first viewer attaches and lose it once the worker idles out.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::{AppConfig, IngestConfig, StreamConfig};
use crate::error::RegistryError;
use crate::registry::{StreamId, StreamRegistry, Subscriber, SubscriberId};

use super::source::{ConnectOptions, MediaSource};
use super::worker::{IngestWorker, WorkerHandle, WorkerState};

/// Starts, tracks and stops ingestion workers
pub struct StreamManager {
    registry: Arc<StreamRegistry>,
    source: Arc<dyn MediaSource>,
    config: IngestConfig,
    options: HashMap<StreamId, ConnectOptions>,
    workers: Mutex<HashMap<StreamId, WorkerHandle>>,
}

impl StreamManager {
    pub fn new(
        registry: Arc<StreamRegistry>,
        source: Arc<dyn MediaSource>,
        config: IngestConfig,
    ) -> Self {
        Self {
            registry,
            source,
            config,
            options: HashMap::new(),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Create a manager and register every stream of `config`
    pub async fn from_config(
        registry: Arc<StreamRegistry>,
        source: Arc<dyn MediaSource>,
        config: &AppConfig,
    ) -> Result<Self, RegistryError> {
        let mut manager = Self::new(registry, source, config.ingest.clone());
        for stream in &config.streams {
            manager.register(stream).await?;
        }
        Ok(manager)
    }

    /// Register a stream with the registry
    pub async fn register(&mut self, stream: &StreamConfig) -> Result<(), RegistryError> {
        let descriptor = stream.descriptor();
        let id = descriptor.id.clone();
        self.registry.add_stream(descriptor).await?;
        self.options.insert(
            id,
            ConnectOptions {
                disable_audio: stream.disable_audio,
            },
        );
        Ok(())
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// Start the worker of every stream that must run without viewers
    ///
    /// Recorded streams always run, on-demand or not: the archive is their
    /// viewer.
    pub async fn start(&self) -> Result<usize, RegistryError> {
        let mut started = 0;
        for id in self.registry.list_ids().await {
            let descriptor = self.registry.descriptor(&id).await?;
            if (!descriptor.on_demand || descriptor.record) && self.ensure_worker(&id).await? {
                started += 1;
            }
        }

        tracing::info!(workers = started, "Stream workers started");
        Ok(started)
    }

    /// Start a stream's worker unless one is already running
    ///
    /// Returns whether a worker was started.
    pub async fn ensure_worker(&self, id: &StreamId) -> Result<bool, RegistryError> {
        let descriptor = self.registry.descriptor(id).await?;
        let mut workers = self.workers.lock().await;
        workers.retain(|_, handle| !handle.is_finished());

        if !self.registry.try_claim_worker(id).await? {
            return Ok(false);
        }

        let options = self.options.get(id).cloned().unwrap_or_default();
        let handle = IngestWorker::spawn(
            &descriptor,
            options,
            self.registry.clone(),
            self.source.clone(),
            self.config.clone(),
        );
        workers.insert(id.clone(), handle);
        Ok(true)
    }

    /// Attach a viewer, starting the stream's worker if needed
    pub async fn attach_viewer(&self, id: &StreamId) -> Result<Subscriber, RegistryError> {
        // Attach first so a starting on-demand worker already sees the viewer
        let subscriber = self.registry.attach(id).await?;
        if let Err(e) = self.ensure_worker(id).await {
            self.registry.detach(id, subscriber.id).await;
            return Err(e);
        }
        Ok(subscriber)
    }

    /// Detach a viewer
    ///
    /// An on-demand worker notices the missing viewers on its next idle check.
    pub async fn detach_viewer(&self, id: &StreamId, subscriber: SubscriberId) {
        self.registry.detach(id, subscriber).await;
    }

    /// State of a stream's worker, `None` if it never ran
    pub async fn worker_state(&self, id: &StreamId) -> Option<WorkerState> {
        self.workers.lock().await.get(id).map(|h| h.state())
    }

    /// Number of workers still running
    pub async fn running_workers(&self) -> usize {
        self.workers
            .lock()
            .await
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Stop every worker and wait for them
    pub async fn shutdown(&self) {
        let workers: Vec<WorkerHandle> = self.workers.lock().await.drain().map(|(_, h)| h).collect();

        for handle in &workers {
            handle.stop();
        }
        for handle in workers {
            let stream = handle.stream().clone();
            let exit = handle.join().await;
            tracing::debug!(stream = %stream, exit = ?exit, "Worker joined");
        }
        tracing::info!("Stream workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::error::SourceError;
    use crate::ingest::source::{SourceSession, SourceSignal};
    use crate::ingest::worker::WorkerExit;
    use crate::media::{CodecDescriptor, CodecKind};

    /// Connects every time and keeps the session open until the worker drops it
    struct IdleSource {
        dials: AtomicUsize,
        keep: std::sync::Mutex<Vec<mpsc::Sender<SourceSignal>>>,
    }

    impl IdleSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                dials: AtomicUsize::new(0),
                keep: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MediaSource for IdleSource {
        async fn connect(
            &self,
            _url: &str,
            _options: &ConnectOptions,
        ) -> Result<SourceSession, SourceError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (packet_tx, packets) = mpsc::channel(8);
            let (signal_tx, signals) = mpsc::channel(1);
            self.keep.lock().unwrap().push(signal_tx);

            // Feed keyframes so the watchdog stays quiet
            tokio::spawn(async move {
                let mut ms = 0;
                loop {
                    let packet = crate::media::Packet::new(
                        0,
                        Duration::from_millis(ms),
                        true,
                        Bytes::from_static(b"k"),
                    );
                    if packet_tx.send(packet).await.is_err() {
                        break;
                    }
                    ms += 1000;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            });

            Ok(SourceSession {
                codecs: vec![CodecDescriptor::video(CodecKind::H264, Bytes::new())],
                packets,
                signals,
            })
        }
    }

    fn config() -> AppConfig {
        AppConfig::default()
            .stream(StreamConfig::new("always", "rtsp://always"))
            .stream(StreamConfig::new("demand", "rtsp://demand").on_demand(true))
            .stream(
                StreamConfig::new("recorded", "rtsp://recorded")
                    .on_demand(true)
                    .record(true),
            )
    }

    async fn manager(source: &Arc<IdleSource>) -> StreamManager {
        let registry = Arc::new(StreamRegistry::new());
        StreamManager::from_config(registry, source.clone(), &config())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_skips_on_demand() {
        let source = IdleSource::new();
        let manager = manager(&source).await;

        assert_eq!(manager.start().await.unwrap(), 2);
        assert!(manager.worker_state(&StreamId::new("always")).await.is_some());
        assert!(manager.worker_state(&StreamId::new("recorded")).await.is_some());
        assert!(manager.worker_state(&StreamId::new("demand")).await.is_none());

        manager.shutdown().await;
        assert_eq!(manager.running_workers().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_two_workers() {
        let source = IdleSource::new();
        let manager = manager(&source).await;
        let id = StreamId::new("always");

        assert!(manager.ensure_worker(&id).await.unwrap());
        assert!(!manager.ensure_worker(&id).await.unwrap());
        let _viewer = manager.attach_viewer(&id).await.unwrap();
        assert_eq!(manager.running_workers().await, 1);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewer_starts_on_demand_stream() {
        let source = IdleSource::new();
        let manager = manager(&source).await;
        let id = StreamId::new("demand");

        let mut viewer = manager.attach_viewer(&id).await.unwrap();
        assert!(viewer.recv().await.unwrap().is_keyframe);
        assert_eq!(manager.worker_state(&id).await, Some(WorkerState::Streaming));

        // Viewer leaves: the worker idles out and releases the stream
        manager.detach_viewer(&id, viewer.id).await;
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(manager.worker_state(&id).await, Some(WorkerState::Stopped));
        assert!(!manager.registry().is_live(&id).await.unwrap());

        // A new viewer brings it back
        let _viewer = manager.attach_viewer(&id).await.unwrap();
        let mut state = {
            let workers = manager.workers.lock().await;
            workers.get(&id).unwrap().watch_state()
        };
        state
            .wait_for(|s| *s == WorkerState::Streaming)
            .await
            .unwrap();
        assert_eq!(source.dials.load(Ordering::SeqCst), 2);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_stream() {
        let source = IdleSource::new();
        let manager = manager(&source).await;

        let err = manager
            .attach_viewer(&StreamId::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::StreamNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_exits_cleanly() {
        let source = IdleSource::new();
        let manager = manager(&source).await;
        let id = StreamId::new("always");
        manager.ensure_worker(&id).await.unwrap();

        let handle = manager.workers.lock().await.remove(&id).unwrap();
        assert_eq!(handle.shutdown().await, WorkerExit::Stopped);
        assert!(manager.registry().try_claim_worker(&id).await.unwrap());
    }
}
