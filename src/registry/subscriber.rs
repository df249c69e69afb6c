//! Subscriber handles and stream status
//!
//! A subscriber owns the receiving ends of two channels:
//! - a bounded packet queue; the broadcaster uses `try_send`, so a full queue
//!   drops packets for that subscriber only
//! - a status channel holding only the latest [`StreamStatus`]; rapid flaps
//!   coalesce and a consumer always observes the most recent state

use std::time::SystemTime;

use tokio::sync::{mpsc, watch};

use crate::media::Packet;

use super::id::{StreamId, SubscriberId};

/// Live state of a stream as seen by subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStatus {
    /// Whether the upstream source is currently delivering packets
    pub live: bool,
    /// Incremented on every dead-to-live transition
    pub session: u64,
    /// Incremented every time a codec list is published
    pub codec_version: u64,
    /// Wall-clock time of stream time zero in the current session, fixed by
    /// the first packet broadcast while live
    pub origin: Option<SystemTime>,
}

impl StreamStatus {
    /// Whether `self` belongs to a different upstream session than `earlier`
    pub fn is_new_session(&self, earlier: &StreamStatus) -> bool {
        self.session != earlier.session
    }
}

/// Consumer side of one attachment to a stream
#[derive(Debug)]
pub struct Subscriber {
    /// Subscriber identity, needed to detach
    pub id: SubscriberId,
    /// Stream this subscriber is attached to
    pub stream: StreamId,
    /// Bounded packet queue, in upstream read order
    pub packets: mpsc::Receiver<Packet>,
    /// Latest stream status
    pub status: watch::Receiver<StreamStatus>,
}

impl Subscriber {
    /// Receive the next packet; `None` once the subscriber has been detached
    pub async fn recv(&mut self) -> Option<Packet> {
        self.packets.recv().await
    }

    /// Current status without waiting
    pub fn current_status(&self) -> StreamStatus {
        *self.status.borrow()
    }
}
