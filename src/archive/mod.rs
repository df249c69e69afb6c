//! Two-tier retention and point-in-time retrieval
//!
//! Every recorded stream keeps two views of its recent past:
//!
//! - a [`RingBuffer`] of recent video packets under a byte budget (the hot tier)
//! - a [`SegmentStore`] of rolling segment files under a count budget (disk)
//!
//! Both are fed by their own registry subscriber, so neither can stall the
//! other or the live viewers.
//!
//! # Architecture
//!
//! ```text
//!                  StreamRegistry
//!                 ┌──────┴───────┐
//!                 ▼              ▼
//!          [ring feeder]   [segment feeder]
//!                 │              │
//!                 ▼              ▼
//!            RingBuffer     SegmentWriter ──► <dir>/<millis>.flv
//!                 │              │
//!                 │              ▼
//!                 │         SegmentStore (SegmentIndex)
//!                 │              │
//!                 └──────┬───────┘
//!                        ▼
//!              find_packets(stream, t)
//! ```
//!
//! # Time
//!
//! Both tiers map stream time to wall-clock time with a [`StreamClock`]
//! anchored on the first packet of each upstream session, so a time taken
//! from one tier resolves to the same packet in the other (up to the few
//! milliseconds between the two feeders seeing that first packet).

pub mod clock;
pub mod feeder;
pub mod index;
pub mod name;
pub mod ring;
pub mod store;
pub mod writer;

pub use clock::StreamClock;
pub use feeder::{run_ring_feeder, run_segment_feeder};
pub use index::{SegmentIndex, SegmentInterval};
pub use name::SegmentName;
pub use ring::{AppendOutcome, RingBuffer};
pub use store::SegmentStore;
pub use writer::{SegmentWriter, SessionEnd};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::container::{ContainerFormat, FlvFormat};
use crate::error::{Error, LookupError};
use crate::media::{CodecDescriptor, Packet};
use crate::registry::{StreamId, StreamRegistry, SubscriberId};

/// Which retention tier answered a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Memory,
    Disk,
}

/// Packets needed to render a stream at a point in time
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Codecs the packets were encoded with
    pub codecs: Vec<CodecDescriptor>,
    /// Run from the preceding keyframe up to the target, oldest first
    pub packets: Vec<Packet>,
    pub tier: Tier,
}

/// Retention state of one recorded stream
pub struct StreamArchive {
    stream: StreamId,
    ring: Arc<Mutex<RingBuffer>>,
    store: Arc<SegmentStore>,
}

impl StreamArchive {
    /// Open a stream's archive, indexing segments already in `directory`
    pub async fn open(
        stream: StreamId,
        directory: impl Into<PathBuf>,
        ram_budget: usize,
        segment_count: usize,
        format: Arc<dyn ContainerFormat>,
    ) -> Result<Self, Error> {
        let store = SegmentStore::open(stream.clone(), directory, segment_count, format).await?;

        Ok(Self {
            stream,
            ring: Arc::new(Mutex::new(RingBuffer::new(ram_budget))),
            store: Arc::new(store),
        })
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    pub fn ring(&self) -> &Arc<Mutex<RingBuffer>> {
        &self.ring
    }

    pub fn store(&self) -> &Arc<SegmentStore> {
        &self.store
    }

    /// Packet run at `target`
    ///
    /// Served from memory when the ring buffer's window covers `target`,
    /// otherwise from the segment covering it. A ring lookup that fails (no
    /// keyframe left in memory, say) falls through to disk.
    pub async fn find_packets(
        &self,
        registry: &StreamRegistry,
        target: SystemTime,
    ) -> Result<Snapshot, Error> {
        let from_ring = {
            let ring = self.ring.lock().await;
            if ring.covers(target) {
                match ring.find_packet_run(target) {
                    Ok(packets) => Some(packets),
                    Err(e) => {
                        tracing::debug!(
                            stream = %self.stream,
                            error = %e,
                            "Ring buffer lookup failed, trying disk"
                        );
                        None
                    }
                }
            } else {
                None
            }
        };

        if let Some(packets) = from_ring {
            let codecs = registry.codecs(&self.stream).await?;
            return Ok(Snapshot {
                codecs,
                packets,
                tier: Tier::Memory,
            });
        }

        let (codecs, packets) = self.store.find_packets(target).await?;
        Ok(Snapshot {
            codecs,
            packets,
            tier: Tier::Disk,
        })
    }
}

/// Archives of every recorded stream, with their feeder tasks
pub struct ArchiveSet {
    registry: Arc<StreamRegistry>,
    archives: HashMap<StreamId, Arc<StreamArchive>>,
    subscribers: Vec<(StreamId, SubscriberId)>,
    feeders: Vec<JoinHandle<()>>,
}

impl ArchiveSet {
    /// Open an archive for every stream configured with `record` and start
    /// feeding it
    ///
    /// Streams must already be registered. Each archive lives in its own
    /// directory under `segment_directory`.
    pub async fn start(registry: Arc<StreamRegistry>, config: &AppConfig) -> Result<Self, Error> {
        config.validate()?;

        let format: Arc<dyn ContainerFormat> = Arc::new(FlvFormat);
        let mut set = Self {
            registry: registry.clone(),
            archives: HashMap::new(),
            subscribers: Vec::new(),
            feeders: Vec::new(),
        };

        for stream in config.streams.iter().filter(|s| s.record) {
            let id = StreamId::new(&stream.id);
            let directory = config.segment_directory.join(directory_name(&stream.id));

            let archive = Arc::new(
                StreamArchive::open(
                    id.clone(),
                    directory,
                    stream.ram_buffer_size,
                    stream.segment_count,
                    format.clone(),
                )
                .await?,
            );

            let ring_sub = registry.attach(&id).await?;
            let segment_sub = match registry.attach(&id).await {
                Ok(sub) => sub,
                Err(e) => {
                    registry.detach(&id, ring_sub.id).await;
                    return Err(e.into());
                }
            };
            set.subscribers.push((id.clone(), ring_sub.id));
            set.subscribers.push((id.clone(), segment_sub.id));

            let writer = SegmentWriter::new(archive.store().clone(), stream.segment_file_size)
                .resume_after(archive.store().last_segment().await);

            set.feeders.push(tokio::spawn(run_ring_feeder(
                registry.clone(),
                ring_sub,
                archive.ring().clone(),
            )));
            set.feeders.push(tokio::spawn(run_segment_feeder(
                registry.clone(),
                segment_sub,
                writer,
            )));

            tracing::info!(stream = %id, "Archive started");
            set.archives.insert(id, archive);
        }

        Ok(set)
    }

    /// Archive of one stream
    pub fn archive(&self, id: &StreamId) -> Option<&Arc<StreamArchive>> {
        self.archives.get(id)
    }

    /// Number of archived streams
    pub fn len(&self) -> usize {
        self.archives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }

    /// Point-in-time retrieval for a stream
    ///
    /// Every failure means there is no data for that time; see
    /// [`Error::is_not_found`].
    pub async fn find_packets(&self, id: &StreamId, target: SystemTime) -> Result<Snapshot, Error> {
        let archive = self
            .archives
            .get(id)
            .ok_or_else(|| LookupError::NotArchived(id.to_string()))?;
        archive.find_packets(&self.registry, target).await
    }

    /// Stop the feeders, finalizing any segment being written
    pub async fn shutdown(self) {
        for (id, sub) in &self.subscribers {
            self.registry.detach(id, *sub).await;
        }
        for feeder in self.feeders {
            if let Err(e) = feeder.await {
                tracing::warn!(error = %e, "Archive feeder task failed");
            }
        }
        tracing::info!(streams = self.archives.len(), "Archives stopped");
    }
}

/// Directory name for a stream id
///
/// ASCII letters, digits, `-`, `_` and non-leading dots are kept; every other
/// byte becomes `%XX`. Distinct ids get distinct directories, and none of
/// them leaves the segment root.
fn directory_name(id: &str) -> String {
    let mut name = String::with_capacity(id.len());
    for (i, b) in id.bytes().enumerate() {
        let keep = b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || (b == b'.' && i > 0);
        if keep {
            name.push(char::from(b));
        } else {
            name.push_str(&format!("%{:02X}", b));
        }
    }
    name
}
