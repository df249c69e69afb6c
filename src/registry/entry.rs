//! Stream entry and descriptor types
//!
//! This module defines the per-stream state stored in the registry. Entries
//! are only ever touched with the registry lock held.

use std::collections::HashMap;
use std::time::SystemTime;

use tokio::sync::{mpsc, watch};

use crate::media::{CodecDescriptor, Packet};

use super::id::{StreamId, SubscriberId};
use super::subscriber::StreamStatus;

/// Static description of a configured stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Unique stream identity
    pub id: StreamId,
    /// Upstream source URL
    pub url: String,
    /// Human description
    pub description: String,
    /// Only connect upstream while someone is watching
    pub on_demand: bool,
    /// Whether the stream is archived
    pub record: bool,
}

impl StreamDescriptor {
    /// Create a descriptor for an always-on, unrecorded stream
    pub fn new(id: impl Into<StreamId>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            description: String::new(),
            on_demand: false,
            record: false,
        }
    }

    /// Set the human description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark the stream as on-demand
    pub fn on_demand(mut self, on_demand: bool) -> Self {
        self.on_demand = on_demand;
        self
    }

    /// Mark the stream as recorded
    pub fn record(mut self, record: bool) -> Self {
        self.record = record;
        self
    }
}

/// Entry for a single stream in the registry
pub(super) struct StreamEntry {
    pub descriptor: StreamDescriptor,

    /// Codecs published by the last successful upstream connection
    pub codecs: Vec<CodecDescriptor>,

    /// Current status; the watch channel fans it out to every subscriber
    pub status: StreamStatus,
    status_tx: watch::Sender<StreamStatus>,

    /// Packet queues of attached subscribers
    pub subscribers: HashMap<SubscriberId, mpsc::Sender<Packet>>,

    /// Whether an ingestion worker currently owns this stream
    pub worker_running: bool,
}

impl StreamEntry {
    pub(super) fn new(descriptor: StreamDescriptor) -> Self {
        let status = StreamStatus::default();
        let (status_tx, _) = watch::channel(status);

        Self {
            descriptor,
            codecs: Vec::new(),
            status,
            status_tx,
            subscribers: HashMap::new(),
            worker_running: false,
        }
    }

    /// Subscribe to status changes, starting from the current status
    pub(super) fn subscribe_status(&self) -> watch::Receiver<StreamStatus> {
        self.status_tx.subscribe()
    }

    /// Publish the current status to every subscriber
    ///
    /// Overwrites any status a subscriber has not consumed yet.
    pub(super) fn notify_status(&self) {
        self.status_tx.send_replace(self.status);
    }

    /// Update the live flag, starting a new session on dead-to-live
    ///
    /// Returns true if the flag changed.
    pub(super) fn set_live(&mut self, live: bool) -> bool {
        if self.status.live == live {
            return false;
        }
        if live {
            self.status.session += 1;
        }
        self.status.live = live;
        self.status.origin = None;
        true
    }

    pub(super) fn set_codecs(&mut self, codecs: Vec<CodecDescriptor>) {
        self.codecs = codecs;
        self.status.codec_version += 1;
    }

    /// Offer a packet to every subscriber without waiting
    ///
    /// The first packet of a live session fixes the session's clock origin.
    ///
    /// Full queues drop the packet for that subscriber only. Subscribers whose
    /// receiver is gone are removed. Returns the number of queues that
    /// accepted the packet.
    pub(super) fn broadcast(&mut self, packet: &Packet) -> usize {
        if self.status.live && self.status.origin.is_none() {
            let origin = SystemTime::now()
                .checked_sub(packet.time)
                .unwrap_or(SystemTime::UNIX_EPOCH);
            self.status.origin = Some(origin);
            self.notify_status();
        }

        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, tx) in &self.subscribers {
            match tx.try_send(packet.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::trace!(
                        stream = %self.descriptor.id,
                        subscriber = %id,
                        "Subscriber queue full, packet dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
            tracing::debug!(
                stream = %self.descriptor.id,
                subscriber = %id,
                "Pruned subscriber with closed queue"
            );
        }

        delivered
    }

    pub(super) fn stats(&self) -> StreamStats {
        StreamStats {
            live: self.status.live,
            session: self.status.session,
            subscriber_count: self.subscribers.len(),
            codec_count: self.codecs.len(),
            on_demand: self.descriptor.on_demand,
            worker_running: self.worker_running,
        }
    }
}

/// Statistics for a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    /// Whether the upstream is live
    pub live: bool,
    /// Upstream session epoch
    pub session: u64,
    /// Number of attached subscribers
    pub subscriber_count: usize,
    /// Number of elementary streams
    pub codec_count: usize,
    /// Whether the stream is on-demand
    pub on_demand: bool,
    /// Whether an ingestion worker owns the stream
    pub worker_running: bool,
}
