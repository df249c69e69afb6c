//! camrelay: live camera relay with lookback and a rolling archive
//!
//! Connects to upstream camera sources, fans every stream out to any number
//! of viewers without letting a slow one hold the others back, and, for
//! recorded streams, keeps the recent past in two tiers: a byte-budgeted
//! in-memory ring buffer and a count-budgeted set of segment files on disk.
//! Either tier can answer "show me the frames needed to render time T".
//!
//! # Architecture
//!
//! ```text
//!   camera ──► IngestWorker ──► StreamRegistry ──┬──► viewers
//!              (ingest)         (registry)       ├──► ring feeder ──► RingBuffer
//!                                                └──► segment feeder ──► SegmentWriter
//!                                                                        │
//!                                       ArchiveSet::find_packets ◄───────┘
//!                                            (archive)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use camrelay::archive::ArchiveSet;
//! use camrelay::config::AppConfig;
//! use camrelay::ingest::{MediaSource, StreamManager};
//! use camrelay::registry::StreamRegistry;
//!
//! async fn run(source: Arc<dyn MediaSource>) -> camrelay::error::Result<()> {
//!     let config = AppConfig::load("camrelay.json")?;
//!     let registry = Arc::new(StreamRegistry::with_config(config.registry_config()));
//!
//!     let manager = StreamManager::from_config(registry.clone(), source, &config).await?;
//!     let archives = ArchiveSet::start(registry.clone(), &config).await?;
//!     manager.start().await?;
//!
//!     // ... serve viewers with manager.attach_viewer(), lookups with
//!     // archives.find_packets() ...
//!
//!     manager.shutdown().await;
//!     archives.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod container;
pub mod error;
pub mod ingest;
pub mod media;
pub mod registry;

pub use error::{Error, Result};
