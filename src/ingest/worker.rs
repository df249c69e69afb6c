//! Ingestion worker
//!
//! One task per upstream stream. It keeps a connection to the source alive,
//! publishes codecs and liveness to the registry and broadcasts every packet
//! it reads.
//!
//! ```text
//!            ┌────────────┐  dial ok   ┌───────────┐
//!   start ──►│ Connecting │───────────►│ Streaming │──── stop ────► Stopped
//!            └────────────┘            └───────────┘
//!               ▲     │ dial failed         │  │ idle (on-demand)
//!               │     ▼                     │  └─────────────────► Stopped
//!            ┌──────────────┐   disconnect, │
//!            │ Reconnecting │◄──────────────┘   no-video watchdog,
//!            └──────────────┘                   read error
//! ```
//!
//! Every source error is retryable. The worker only terminates on an explicit
//! stop or, for on-demand streams, when nobody is watching.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::IngestConfig;
use crate::error::SourceError;
use crate::media::{is_audio_only, video_stream_index, CodecDescriptor};
use crate::registry::{StreamDescriptor, StreamId, StreamRegistry};

use super::source::{ConnectOptions, MediaSource, SourceSession, SourceSignal};

/// Observable worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Dialing the upstream source
    Connecting,
    /// Connected and broadcasting
    Streaming,
    /// Waiting before the next dial
    Reconnecting,
    /// Terminated
    Stopped,
}

/// Why a worker terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stop was requested
    Stopped,
    /// On-demand stream without viewers
    Idle,
}

/// Handle to a running worker
#[derive(Debug)]
pub struct WorkerHandle {
    stream: StreamId,
    state: watch::Receiver<WorkerState>,
    stop: mpsc::Sender<()>,
    task: JoinHandle<WorkerExit>,
}

impl WorkerHandle {
    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    /// Current worker state
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Receiver following every state change
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Whether the worker task has ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the worker to stop; does not wait
    pub fn stop(&self) {
        let _ = self.stop.try_send(());
    }

    /// Wait for the worker to end
    pub async fn join(self) -> WorkerExit {
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                tracing::error!(stream = %self.stream, error = %e, "Ingestion worker panicked");
                WorkerExit::Stopped
            }
        }
    }

    /// Stop the worker and wait for it
    pub async fn shutdown(self) -> WorkerExit {
        self.stop();
        self.join().await
    }
}

/// Ingestion worker for one stream
pub struct IngestWorker {
    stream: StreamId,
    url: String,
    on_demand: bool,
    options: ConnectOptions,
    registry: Arc<StreamRegistry>,
    source: Arc<dyn MediaSource>,
    config: IngestConfig,
    state: watch::Sender<WorkerState>,
    stop: mpsc::Receiver<()>,
}

impl IngestWorker {
    /// Spawn a worker for `descriptor`
    ///
    /// The caller must hold the stream's worker claim; the worker releases it
    /// when it terminates. Dropping the handle stops the worker.
    pub fn spawn(
        descriptor: &StreamDescriptor,
        options: ConnectOptions,
        registry: Arc<StreamRegistry>,
        source: Arc<dyn MediaSource>,
        config: IngestConfig,
    ) -> WorkerHandle {
        let (state_tx, state_rx) = watch::channel(WorkerState::Connecting);
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let worker = Self {
            stream: descriptor.id.clone(),
            url: descriptor.url.clone(),
            on_demand: descriptor.on_demand,
            options,
            registry,
            source,
            config,
            state: state_tx,
            stop: stop_rx,
        };

        let stream = descriptor.id.clone();
        let task = tokio::spawn(async move {
            let registry = worker.registry.clone();
            let stream = worker.stream.clone();

            let exit = worker.run().await;
            registry.release_worker(&stream).await;
            exit
        });

        WorkerHandle {
            stream,
            state: state_rx,
            stop: stop_tx,
            task,
        }
    }

    /// Connect, stream, reconnect until stopped or idle
    pub async fn run(mut self) -> WorkerExit {
        tracing::info!(stream = %self.stream, on_demand = self.on_demand, "Ingestion worker started");

        let exit = loop {
            self.set_state(WorkerState::Connecting);

            let session = match self.dial().await {
                Ok(Some(session)) => session,
                Ok(None) => break WorkerExit::Stopped,
                Err(e) => {
                    tracing::warn!(stream = %self.stream, error = %e, "Upstream dial failed");
                    if let Some(exit) = self.retry_after(self.config.dial_backoff).await {
                        break exit;
                    }
                    continue;
                }
            };

            let result = self.stream_session(session).await;
            self.publish_live(false).await;

            match result {
                Ok(exit) => break exit,
                Err(e) => {
                    tracing::warn!(stream = %self.stream, error = %e, "Upstream session ended");
                    if let Some(exit) = self.retry_after(self.config.reconnect_delay).await {
                        break exit;
                    }
                }
            }
        };

        self.set_state(WorkerState::Stopped);
        tracing::info!(stream = %self.stream, exit = ?exit, "Ingestion worker stopped");
        exit
    }

    /// Dial under the timeout; `None` if stop was requested meanwhile
    async fn dial(&mut self) -> Result<Option<SourceSession>, SourceError> {
        let timeout = self.config.dial_timeout;
        let connect = self.source.connect(&self.url, &self.options);

        let result = tokio::select! {
            biased;
            _ = self.stop.recv() => return Ok(None),
            result = tokio::time::timeout(timeout, connect) => result,
        };

        let session = result
            .map_err(|_| SourceError::Dial(format!("timed out after {}s", timeout.as_secs())))??;
        if session.codecs.is_empty() {
            return Err(SourceError::NoCodecs);
        }

        tracing::info!(
            stream = %self.stream,
            codecs = session.codecs.len(),
            "Upstream connected"
        );
        Ok(Some(session))
    }

    /// Wait `delay` before the next dial
    ///
    /// Returns the exit reason instead if the worker should terminate: a stop
    /// request, or an on-demand stream nobody is watching.
    async fn retry_after(&mut self, delay: Duration) -> Option<WorkerExit> {
        if self.on_demand && !self.registry.has_viewers(&self.stream).await {
            return Some(WorkerExit::Idle);
        }

        self.set_state(WorkerState::Reconnecting);
        tokio::select! {
            biased;
            _ = self.stop.recv() => Some(WorkerExit::Stopped),
            _ = tokio::time::sleep(delay) => None,
        }
    }

    async fn stream_session(&mut self, mut session: SourceSession) -> Result<WorkerExit, SourceError> {
        let keyframe_timeout = self.config.keyframe_timeout;
        let idle_timeout = self.config.idle_timeout;
        let mut audio_only = is_audio_only(&session.codecs);
        let mut video_index = video_stream_index(&session.codecs);

        // Codecs first, so every subscriber that sees live=true can read them
        self.publish_codecs(session.codecs).await;
        self.publish_live(true).await;
        self.set_state(WorkerState::Streaming);

        let watchdog = tokio::time::sleep(keyframe_timeout);
        tokio::pin!(watchdog);
        let mut idle_check = tokio::time::interval_at(Instant::now() + idle_timeout, idle_timeout);

        loop {
            tokio::select! {
                biased;

                _ = self.stop.recv() => {
                    return Ok(WorkerExit::Stopped);
                }

                signal = session.signals.recv() => match signal {
                    Some(SourceSignal::CodecUpdate(codecs)) => {
                        tracing::info!(
                            stream = %self.stream,
                            codecs = codecs.len(),
                            "Upstream codecs updated"
                        );
                        audio_only = is_audio_only(&codecs);
                        video_index = video_stream_index(&codecs);
                        self.publish_codecs(codecs).await;
                        self.publish_live(true).await;
                    }
                    Some(SourceSignal::Stopped) | None => {
                        return Err(SourceError::Disconnected);
                    }
                },

                packet = session.packets.recv() => {
                    let Some(packet) = packet else {
                        return Err(SourceError::Read("packet queue closed".into()));
                    };
                    // Only video keyframes prove the video is alive
                    let video_key = packet.stream_index == video_index && packet.is_keyframe;
                    if video_key || audio_only {
                        watchdog.as_mut().reset(Instant::now() + keyframe_timeout);
                    }
                    self.registry.broadcast(&self.stream, &packet).await;
                }

                _ = &mut watchdog => {
                    return Err(SourceError::NoVideo(keyframe_timeout));
                }

                _ = idle_check.tick(), if self.on_demand => {
                    if !self.registry.has_viewers(&self.stream).await {
                        tracing::info!(stream = %self.stream, "No viewers, closing on-demand stream");
                        return Ok(WorkerExit::Idle);
                    }
                }
            }
        }
    }

    async fn publish_codecs(&self, codecs: Vec<CodecDescriptor>) {
        if let Err(e) = self.registry.set_codecs(&self.stream, codecs).await {
            tracing::warn!(stream = %self.stream, error = %e, "Can't publish codecs");
        }
    }

    async fn publish_live(&self, live: bool) {
        if let Err(e) = self.registry.set_live(&self.stream, live).await {
            tracing::warn!(stream = %self.stream, error = %e, "Can't update stream status");
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::media::{CodecKind, Packet};

    /// What the scripted source does on the next connect
    enum Dial {
        Fail,
        Hang,
        Connect(Vec<CodecDescriptor>),
    }

    /// Upstream ends the test drives
    struct Upstream {
        packets: mpsc::Sender<Packet>,
        signals: mpsc::Sender<SourceSignal>,
    }

    struct ScriptedSource {
        script: Mutex<VecDeque<Dial>>,
        upstreams: mpsc::UnboundedSender<Upstream>,
        dials: Mutex<usize>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Dial>) -> (Arc<Self>, mpsc::UnboundedReceiver<Upstream>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let source = Arc::new(Self {
                script: Mutex::new(script.into()),
                upstreams: tx,
                dials: Mutex::new(0),
            });
            (source, rx)
        }

        fn dials(&self) -> usize {
            *self.dials.lock().unwrap()
        }
    }

    #[async_trait]
    impl MediaSource for ScriptedSource {
        async fn connect(
            &self,
            _url: &str,
            _options: &ConnectOptions,
        ) -> Result<SourceSession, SourceError> {
            *self.dials.lock().unwrap() += 1;
            let next = self.script.lock().unwrap().pop_front();

            match next {
                Some(Dial::Connect(codecs)) => {
                    let (packet_tx, packets) = mpsc::channel(64);
                    let (signal_tx, signals) = mpsc::channel(4);
                    let _ = self.upstreams.send(Upstream {
                        packets: packet_tx,
                        signals: signal_tx,
                    });
                    Ok(SourceSession {
                        codecs,
                        packets,
                        signals,
                    })
                }
                Some(Dial::Hang) => std::future::pending().await,
                Some(Dial::Fail) | None => Err(SourceError::Dial("connection refused".into())),
            }
        }
    }

    fn video_codecs() -> Vec<CodecDescriptor> {
        vec![CodecDescriptor::video(CodecKind::H264, Bytes::from_static(&[1]))]
    }

    fn audio_codecs() -> Vec<CodecDescriptor> {
        vec![CodecDescriptor::audio(CodecKind::Pcma, Bytes::new(), 8000, 1)]
    }

    fn packet(ms: u64, key: bool) -> Packet {
        Packet::new(0, Duration::from_millis(ms), key, Bytes::from_static(b"frame"))
    }

    async fn setup(on_demand: bool) -> (Arc<StreamRegistry>, StreamDescriptor) {
        let registry = Arc::new(StreamRegistry::new());
        let descriptor = StreamDescriptor::new("cam", "rtsp://cam").on_demand(on_demand);
        registry.add_stream(descriptor.clone()).await.unwrap();
        assert!(registry.try_claim_worker(&descriptor.id).await.unwrap());
        (registry, descriptor)
    }

    fn spawn(
        descriptor: &StreamDescriptor,
        registry: &Arc<StreamRegistry>,
        source: &Arc<ScriptedSource>,
    ) -> WorkerHandle {
        IngestWorker::spawn(
            descriptor,
            ConnectOptions::default(),
            registry.clone(),
            source.clone(),
            IngestConfig::default(),
        )
    }

    async fn wait_for(handle: &WorkerHandle, state: WorkerState) {
        let mut rx = handle.watch_state();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_publishes_and_broadcasts() {
        let (registry, descriptor) = setup(false).await;
        let mut viewer = registry.attach(&descriptor.id).await.unwrap();
        let (source, mut upstreams) = ScriptedSource::new(vec![Dial::Connect(video_codecs())]);

        let handle = spawn(&descriptor, &registry, &source);
        let upstream = upstreams.recv().await.unwrap();
        wait_for(&handle, WorkerState::Streaming).await;

        assert!(registry.is_live(&descriptor.id).await.unwrap());
        assert_eq!(registry.codecs(&descriptor.id).await.unwrap(), video_codecs());

        upstream.packets.send(packet(0, true)).await.unwrap();
        upstream.packets.send(packet(40, false)).await.unwrap();
        assert_eq!(viewer.recv().await.unwrap().time, Duration::ZERO);
        assert_eq!(viewer.recv().await.unwrap().time, Duration::from_millis(40));

        assert_eq!(handle.shutdown().await, WorkerExit::Stopped);
        assert!(!registry.is_live(&descriptor.id).await.unwrap());
        // Claim released
        assert!(registry.try_claim_worker(&descriptor.id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_failure_backs_off_and_retries() {
        let (registry, descriptor) = setup(false).await;
        let (source, mut upstreams) =
            ScriptedSource::new(vec![Dial::Fail, Dial::Fail, Dial::Connect(video_codecs())]);

        let start = Instant::now();
        let handle = spawn(&descriptor, &registry, &source);
        let _upstream = upstreams.recv().await.unwrap();

        assert_eq!(source.dials(), 3);
        // Two 5 s backoffs
        assert!(start.elapsed() >= Duration::from_secs(10));

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_timeout() {
        let (registry, descriptor) = setup(false).await;
        let (source, mut upstreams) =
            ScriptedSource::new(vec![Dial::Hang, Dial::Connect(video_codecs())]);

        let start = Instant::now();
        let handle = spawn(&descriptor, &registry, &source);
        let _upstream = upstreams.recv().await.unwrap();

        // 3 s dial timeout, then the 5 s backoff
        assert!(start.elapsed() >= Duration::from_secs(8));
        assert_eq!(source.dials(), 2);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyframe_watchdog_reconnects() {
        let (registry, descriptor) = setup(false).await;
        let (source, mut upstreams) =
            ScriptedSource::new(vec![Dial::Connect(video_codecs()), Dial::Connect(video_codecs())]);

        let handle = spawn(&descriptor, &registry, &source);
        let first = upstreams.recv().await.unwrap();
        wait_for(&handle, WorkerState::Streaming).await;
        let session = registry.status(&descriptor.id).await.unwrap().session;

        // Inter frames only: the watchdog is never fed
        for i in 0..10 {
            first.packets.send(packet(i * 40, false)).await.unwrap();
        }

        let second = upstreams.recv().await.unwrap();
        wait_for(&handle, WorkerState::Streaming).await;
        assert_eq!(source.dials(), 2);
        assert!(registry.status(&descriptor.id).await.unwrap().session > session);

        drop(second);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_feeds_watchdog_on_audio_only_stream() {
        let (registry, descriptor) = setup(false).await;
        let (source, mut upstreams) = ScriptedSource::new(vec![Dial::Connect(audio_codecs())]);

        let handle = spawn(&descriptor, &registry, &source);
        let upstream = upstreams.recv().await.unwrap();
        wait_for(&handle, WorkerState::Streaming).await;

        // 30 s of audio, one packet a second, no keyframes flagged
        for i in 0..30 {
            upstream.packets.send(packet(i * 1000, false)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        assert_eq!(handle.state(), WorkerState::Streaming);
        assert_eq!(source.dials(), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_does_not_feed_video_watchdog() {
        let (registry, descriptor) = setup(false).await;
        let av = vec![
            CodecDescriptor::video(CodecKind::H264, Bytes::from_static(&[1])),
            CodecDescriptor::audio(CodecKind::Aac, Bytes::from_static(&[0x12, 0x10]), 16000, 1),
        ];
        let (source, mut upstreams) =
            ScriptedSource::new(vec![Dial::Connect(av.clone()), Dial::Connect(av)]);

        let handle = spawn(&descriptor, &registry, &source);
        let first = upstreams.recv().await.unwrap();
        wait_for(&handle, WorkerState::Streaming).await;
        let session = registry.status(&descriptor.id).await.unwrap().session;

        // Video died; audio sync frames keep arriving every second
        first.packets.send(packet(0, true)).await.unwrap();
        let audio = first.packets.clone();
        tokio::spawn(async move {
            for i in 1..60u64 {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let frame = Packet::new(1, Duration::from_secs(i), true, Bytes::from_static(b"aac"));
                if audio.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let _second = upstreams.recv().await.unwrap();
        wait_for(&handle, WorkerState::Streaming).await;
        assert_eq!(source.dials(), 2);
        assert!(registry.status(&descriptor.id).await.unwrap().session > session);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_marks_offline_and_reconnects() {
        let (registry, descriptor) = setup(false).await;
        let (source, mut upstreams) =
            ScriptedSource::new(vec![Dial::Connect(video_codecs()), Dial::Connect(video_codecs())]);

        let handle = spawn(&descriptor, &registry, &source);
        let first = upstreams.recv().await.unwrap();
        wait_for(&handle, WorkerState::Streaming).await;

        let mut status = registry.attach(&descriptor.id).await.unwrap().status;
        first.signals.send(SourceSignal::Stopped).await.unwrap();

        status.wait_for(|s| !s.live).await.unwrap();
        let _second = upstreams.recv().await.unwrap();
        status.wait_for(|s| s.live).await.unwrap();

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_codec_update_republishes() {
        let (registry, descriptor) = setup(false).await;
        let (source, mut upstreams) = ScriptedSource::new(vec![Dial::Connect(video_codecs())]);

        let handle = spawn(&descriptor, &registry, &source);
        let upstream = upstreams.recv().await.unwrap();
        wait_for(&handle, WorkerState::Streaming).await;
        let before = registry.status(&descriptor.id).await.unwrap();

        let updated = vec![
            CodecDescriptor::video(CodecKind::H264, Bytes::from_static(&[2])),
            CodecDescriptor::audio(CodecKind::Aac, Bytes::from_static(&[0x12, 0x10]), 44100, 2),
        ];
        upstream
            .signals
            .send(SourceSignal::CodecUpdate(updated.clone()))
            .await
            .unwrap();

        let mut status = registry.attach(&descriptor.id).await.unwrap().status;
        status
            .wait_for(|s| s.codec_version > before.codec_version)
            .await
            .unwrap();

        assert_eq!(registry.codecs(&descriptor.id).await.unwrap(), updated);
        let after = registry.status(&descriptor.id).await.unwrap();
        assert!(after.live);
        assert_eq!(after.session, before.session);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_demand_idles_out_without_viewers() {
        let (registry, descriptor) = setup(true).await;
        let (source, mut upstreams) = ScriptedSource::new(vec![Dial::Connect(video_codecs())]);

        let start = Instant::now();
        let handle = spawn(&descriptor, &registry, &source);
        let _upstream = upstreams.recv().await.unwrap();

        assert_eq!(handle.join().await, WorkerExit::Idle);
        assert!(start.elapsed() >= Duration::from_secs(20));
        assert!(!registry.is_live(&descriptor.id).await.unwrap());
        assert_eq!(source.dials(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_demand_keeps_running_with_viewer() {
        let (registry, descriptor) = setup(true).await;
        let _viewer = registry.attach(&descriptor.id).await.unwrap();
        let (source, mut upstreams) = ScriptedSource::new(vec![Dial::Connect(video_codecs())]);

        let handle = spawn(&descriptor, &registry, &source);
        let upstream = upstreams.recv().await.unwrap();

        for i in 0..60 {
            upstream.packets.send(packet(i * 1000, true)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(handle.state(), WorkerState::Streaming);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_demand_gives_up_reconnecting_without_viewers() {
        let (registry, descriptor) = setup(true).await;
        let (source, _upstreams) = ScriptedSource::new(vec![Dial::Fail]);

        let handle = spawn(&descriptor, &registry, &source);
        assert_eq!(handle.join().await, WorkerExit::Idle);
        assert_eq!(source.dials(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_backoff() {
        let (registry, descriptor) = setup(false).await;
        let (source, _upstreams) = ScriptedSource::new(vec![]);

        let handle = spawn(&descriptor, &registry, &source);
        wait_for(&handle, WorkerState::Reconnecting).await;

        assert_eq!(handle.shutdown().await, WorkerExit::Stopped);
    }
}
