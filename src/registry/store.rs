//! Stream registry implementation
//!
//! The process-wide table of configured streams. Every operation takes the
//! single table lock for its whole duration, readers included; operations are
//! O(1) or O(subscribers) and infrequent next to packet rates, so one
//! exclusive lock keeps the state trivially consistent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, Mutex};

use crate::media::{CodecDescriptor, Packet};

use super::config::RegistryConfig;
use super::entry::{StreamDescriptor, StreamEntry, StreamStats};
use super::error::RegistryError;
use super::id::{StreamId, SubscriberId};
use super::subscriber::{StreamStatus, Subscriber};

/// Central registry for all configured streams
pub struct StreamRegistry {
    /// Map of stream id to stream entry
    streams: Mutex<HashMap<StreamId, StreamEntry>>,

    next_subscriber_id: AtomicU64,

    config: RegistryConfig,
}

impl StreamRegistry {
    /// Create a new stream registry with default configuration
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new stream registry with custom configuration
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            config,
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a configured stream
    pub async fn add_stream(&self, descriptor: StreamDescriptor) -> Result<(), RegistryError> {
        let mut streams = self.streams.lock().await;

        if streams.contains_key(&descriptor.id) {
            return Err(RegistryError::StreamAlreadyExists(descriptor.id));
        }

        tracing::info!(
            stream = %descriptor.id,
            url = %descriptor.url,
            on_demand = descriptor.on_demand,
            record = descriptor.record,
            "Stream registered"
        );
        streams.insert(descriptor.id.clone(), StreamEntry::new(descriptor));
        Ok(())
    }

    /// Check if a stream is registered
    pub async fn exists(&self, id: &StreamId) -> bool {
        self.streams.lock().await.contains_key(id)
    }

    /// Static description of a stream
    pub async fn descriptor(&self, id: &StreamId) -> Result<StreamDescriptor, RegistryError> {
        let streams = self.streams.lock().await;
        Ok(Self::entry(&streams, id)?.descriptor.clone())
    }

    /// Publish the codec list of the current upstream connection
    pub async fn set_codecs(
        &self,
        id: &StreamId,
        codecs: Vec<CodecDescriptor>,
    ) -> Result<(), RegistryError> {
        let mut streams = self.streams.lock().await;
        let entry = Self::entry_mut(&mut streams, id)?;

        tracing::debug!(
            stream = %id,
            codecs = ?codecs.iter().map(|c| c.kind.name()).collect::<Vec<_>>(),
            "Codecs updated"
        );
        entry.set_codecs(codecs);
        entry.notify_status();
        Ok(())
    }

    /// Update the live flag and notify subscribers
    pub async fn set_live(&self, id: &StreamId, live: bool) -> Result<(), RegistryError> {
        let mut streams = self.streams.lock().await;
        let entry = Self::entry_mut(&mut streams, id)?;

        if entry.set_live(live) {
            tracing::info!(
                stream = %id,
                live = live,
                session = entry.status.session,
                "Stream status changed"
            );
            entry.notify_status();
        }
        Ok(())
    }

    /// Codecs of a stream
    pub async fn codecs(&self, id: &StreamId) -> Result<Vec<CodecDescriptor>, RegistryError> {
        let streams = self.streams.lock().await;
        Ok(Self::entry(&streams, id)?.codecs.clone())
    }

    /// Live flag of a stream
    pub async fn is_live(&self, id: &StreamId) -> Result<bool, RegistryError> {
        let streams = self.streams.lock().await;
        Ok(Self::entry(&streams, id)?.status.live)
    }

    /// Full status of a stream
    pub async fn status(&self, id: &StreamId) -> Result<StreamStatus, RegistryError> {
        let streams = self.streams.lock().await;
        Ok(Self::entry(&streams, id)?.status)
    }

    /// Ids of all registered streams, sorted
    pub async fn list_ids(&self) -> Vec<StreamId> {
        let streams = self.streams.lock().await;
        let mut ids: Vec<StreamId> = streams.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Attach a new subscriber to a stream
    ///
    /// The returned status receiver starts at the stream's current status.
    pub async fn attach(&self, id: &StreamId) -> Result<Subscriber, RegistryError> {
        let mut streams = self.streams.lock().await;
        let entry = Self::entry_mut(&mut streams, id)?;

        let sub_id = SubscriberId(self.next_subscriber_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        entry.subscribers.insert(sub_id, tx);

        tracing::info!(
            stream = %id,
            subscriber = %sub_id,
            subscribers = entry.subscribers.len(),
            "Subscriber attached"
        );

        Ok(Subscriber {
            id: sub_id,
            stream: id.clone(),
            packets: rx,
            status: entry.subscribe_status(),
        })
    }

    /// Detach a subscriber
    ///
    /// Dropping the sending half closes the subscriber's queue; packets that
    /// were already queued remain readable. Unknown ids are ignored.
    pub async fn detach(&self, id: &StreamId, subscriber: SubscriberId) {
        let mut streams = self.streams.lock().await;

        if let Some(entry) = streams.get_mut(id) {
            if entry.subscribers.remove(&subscriber).is_some() {
                tracing::info!(
                    stream = %id,
                    subscriber = %subscriber,
                    subscribers = entry.subscribers.len(),
                    "Subscriber detached"
                );
            }
        }
    }

    /// Broadcast a packet to all subscribers of a stream
    ///
    /// Never waits on a slow consumer. Returns the number of subscribers that
    /// accepted the packet (0 for an unknown stream).
    pub async fn broadcast(&self, id: &StreamId, packet: &Packet) -> usize {
        let mut streams = self.streams.lock().await;

        match streams.get_mut(id) {
            Some(entry) => entry.broadcast(packet),
            None => 0,
        }
    }

    /// Number of subscribers attached to a stream (0 for an unknown stream)
    pub async fn subscriber_count(&self, id: &StreamId) -> usize {
        let streams = self.streams.lock().await;
        streams.get(id).map(|e| e.subscribers.len()).unwrap_or(0)
    }

    /// Whether anyone is attached to a stream
    ///
    /// An unknown stream has no viewers, so callers treat it as cold.
    pub async fn has_viewers(&self, id: &StreamId) -> bool {
        self.subscriber_count(id).await > 0
    }

    /// Get stream statistics
    pub async fn stream_stats(&self, id: &StreamId) -> Option<StreamStats> {
        let streams = self.streams.lock().await;
        streams.get(id).map(|e| e.stats())
    }

    /// Get total number of streams
    pub async fn stream_count(&self) -> usize {
        self.streams.lock().await.len()
    }

    /// Claim the right to run the ingestion worker of a stream
    ///
    /// Returns false if a worker already owns it.
    pub async fn try_claim_worker(&self, id: &StreamId) -> Result<bool, RegistryError> {
        let mut streams = self.streams.lock().await;
        let entry = Self::entry_mut(&mut streams, id)?;

        if entry.worker_running {
            return Ok(false);
        }
        entry.worker_running = true;
        Ok(true)
    }

    /// Release the worker claim of a stream
    pub async fn release_worker(&self, id: &StreamId) {
        let mut streams = self.streams.lock().await;
        if let Some(entry) = streams.get_mut(id) {
            entry.worker_running = false;
        }
    }

    fn entry<'a>(
        streams: &'a HashMap<StreamId, StreamEntry>,
        id: &StreamId,
    ) -> Result<&'a StreamEntry, RegistryError> {
        streams
            .get(id)
            .ok_or_else(|| RegistryError::StreamNotFound(id.clone()))
    }

    fn entry_mut<'a>(
        streams: &'a mut HashMap<StreamId, StreamEntry>,
        id: &StreamId,
    ) -> Result<&'a mut StreamEntry, RegistryError> {
        streams
            .get_mut(id)
            .ok_or_else(|| RegistryError::StreamNotFound(id.clone()))
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}
