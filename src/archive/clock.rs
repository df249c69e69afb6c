//! Stream time to wall-clock mapping
//!
//! Packets carry stream-relative times. Both retention tiers convert them to
//! wall-clock times the same way: the first packet of an upstream session
//! fixes `origin = now - packet.time`, and every packet then maps to
//! `origin + packet.time + composition_time`.
//!
//! The registry fixes that origin once per session (see
//! [`StreamStatus::origin`](crate::registry::StreamStatus::origin)); both
//! feeders anchor on it so the tiers agree on every packet's time.

use std::time::{Duration, SystemTime};

use crate::media::Packet;

/// Per-session anchor from stream time to wall-clock time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamClock {
    origin: Option<SystemTime>,
}

impl StreamClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wall-clock time of stream time zero, once anchored
    pub fn origin(&self) -> Option<SystemTime> {
        self.origin
    }

    /// Whether the clock has seen its first packet
    pub fn is_anchored(&self) -> bool {
        self.origin.is_some()
    }

    /// Anchor the clock on `packet` if this is the first packet seen
    pub fn anchor(&mut self, packet: &Packet, now: SystemTime) -> SystemTime {
        *self.origin.get_or_insert_with(|| {
            now.checked_sub(packet.time)
                .unwrap_or(SystemTime::UNIX_EPOCH)
        })
    }

    /// Anchor the clock on a known origin unless already anchored
    pub fn anchor_at(&mut self, origin: SystemTime) {
        self.origin.get_or_insert(origin);
    }

    /// Wall-clock presentation time of `packet`, anchoring on first use
    pub fn wall_time(&mut self, packet: &Packet, now: SystemTime) -> SystemTime {
        self.anchor(packet, now) + packet.presentation_time()
    }

    /// Wall-clock time of a stream-relative offset
    pub fn at(&self, stream_time: Duration) -> Option<SystemTime> {
        self.origin.map(|origin| origin + stream_time)
    }

    /// Forget the anchor; the next packet starts a new mapping
    pub fn reset(&mut self) {
        self.origin = None;
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn packet(ms: u64) -> Packet {
        Packet::new(0, Duration::from_millis(ms), true, Bytes::new())
    }

    #[test]
    fn test_anchor_on_first_packet() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let mut clock = StreamClock::new();
        assert!(!clock.is_anchored());

        // First packet arrives 2 s into the stream
        let wall = clock.wall_time(&packet(2_000), now);
        assert_eq!(wall, now);
        assert_eq!(clock.origin(), Some(now - Duration::from_secs(2)));

        // Later packets ignore the arrival time
        let later = now + Duration::from_secs(30);
        assert_eq!(
            clock.wall_time(&packet(2_040), later),
            now + Duration::from_millis(40)
        );
    }

    #[test]
    fn test_composition_time_included() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let mut clock = StreamClock::new();
        clock.anchor(&packet(0), now);

        let pkt = packet(40).with_composition_time(Duration::from_millis(80));
        assert_eq!(clock.wall_time(&pkt, now), now + Duration::from_millis(120));
        assert_eq!(clock.at(Duration::from_millis(40)), Some(now + Duration::from_millis(40)));
    }

    #[test]
    fn test_anchor_at_keeps_first_origin() {
        let origin = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let mut clock = StreamClock::new();
        clock.anchor_at(origin);
        clock.anchor_at(origin + Duration::from_secs(3));

        assert_eq!(clock.origin(), Some(origin));
        let later = origin + Duration::from_secs(60);
        assert_eq!(clock.wall_time(&packet(40), later), origin + Duration::from_millis(40));
    }

    #[test]
    fn test_reset() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let mut clock = StreamClock::new();
        clock.anchor(&packet(0), now);
        clock.reset();

        assert!(clock.at(Duration::ZERO).is_none());
        let later = now + Duration::from_secs(5);
        assert_eq!(clock.wall_time(&packet(0), later), later);
    }
}
