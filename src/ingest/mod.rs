//! Upstream ingestion
//!
//! One [`IngestWorker`] per stream keeps the upstream connection alive and
//! feeds the registry; the [`StreamManager`] decides which workers run.
//! Sources plug in through the [`MediaSource`] trait; the RTSP
//! implementation sits behind the `rtsp` feature.

pub mod manager;
pub mod source;
pub mod worker;

#[cfg(feature = "rtsp")]
pub mod rtsp;

pub use manager::StreamManager;
pub use source::{ConnectOptions, MediaSource, SourceSession, SourceSignal};
pub use worker::{IngestWorker, WorkerExit, WorkerHandle, WorkerState};

#[cfg(feature = "rtsp")]
pub use rtsp::RtspSource;
