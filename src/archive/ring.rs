//! In-memory retention ring buffer
//!
//! Keeps the most recent packets of one stream under a byte budget, keyed by
//! their wall-clock presentation time. Entries are ordered oldest to newest;
//! eviction only ever removes from the oldest end.
//!
//! ```text
//!   first_time                                        last_time
//!       │                                                 │
//!       ▼                                                 ▼
//!     [K]──[P]──[P]──[P]──[K]──[P]──[P]──[K]──[P]──[P]──[P]
//!      ▲ evict                                         append ▲
//! ```
//!
//! A lookup returns the run from the closest preceding keyframe up to the
//! first entry at or after the target, so a decoder can reconstruct the
//! picture at that time.

use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;

use crate::error::LookupError;
use crate::media::Packet;

use super::clock::StreamClock;

/// What `append` did with a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored at the tail
    Stored,
    /// An entry already exists at the same wall-clock time
    Duplicate,
    /// Older than the newest entry; storing it would break ordering
    OutOfOrder,
}

/// Byte-budgeted packet store for one stream
#[derive(Debug)]
pub struct RingBuffer {
    /// Payload bytes above which each append evicts the oldest entry
    budget: usize,
    /// Payload bytes currently retained
    bytes: usize,

    /// Entry times, oldest first
    times: VecDeque<SystemTime>,
    packets: HashMap<SystemTime, Packet>,

    first_time: SystemTime,
    last_time: SystemTime,

    clock: StreamClock,
}

impl RingBuffer {
    /// Create an empty buffer retaining at most `budget` payload bytes
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            bytes: 0,
            times: VecDeque::new(),
            packets: HashMap::new(),
            first_time: SystemTime::UNIX_EPOCH,
            last_time: SystemTime::UNIX_EPOCH,
            clock: StreamClock::new(),
        }
    }

    /// Map stream time from `origin` until the next [`clear`](Self::clear)
    ///
    /// Has no effect once the clock is anchored.
    pub fn anchor(&mut self, origin: SystemTime) {
        self.clock.anchor_at(origin);
    }

    /// Append a packet received now
    pub fn append(&mut self, packet: Packet) -> AppendOutcome {
        self.append_at(packet, SystemTime::now())
    }

    /// Append a packet received at `now`
    ///
    /// The first packet after construction or [`clear`](Self::clear) anchors
    /// the stream clock.
    pub fn append_at(&mut self, packet: Packet, now: SystemTime) -> AppendOutcome {
        let time = self.clock.wall_time(&packet, now);

        if self.packets.contains_key(&time) {
            tracing::trace!(time = ?time, "Duplicate ring buffer entry ignored");
            return AppendOutcome::Duplicate;
        }

        if !self.times.is_empty() && time < self.last_time {
            tracing::debug!(
                time = ?time,
                last = ?self.last_time,
                "Out-of-order packet not buffered"
            );
            return AppendOutcome::OutOfOrder;
        }

        // One head entry goes per append while the buffer is over budget
        if self.bytes > self.budget && !self.times.is_empty() {
            self.evict_oldest();
        }

        if self.times.is_empty() {
            self.first_time = time;
        }
        self.last_time = time;
        self.bytes += packet.size();
        self.times.push_back(time);
        self.packets.insert(time, packet);

        AppendOutcome::Stored
    }

    fn evict_oldest(&mut self) {
        if let Some(time) = self.times.pop_front() {
            if let Some(packet) = self.packets.remove(&time) {
                self.bytes -= packet.size();
            }
        }
        self.first_time = self.times.front().copied().unwrap_or(self.last_time);
    }

    /// Packets needed to show the picture at `target`
    ///
    /// Returns the entries from the last keyframe at or before the first entry
    /// whose time is at or after `target`, up to and including that entry, in
    /// chronological order. `target` must lie strictly inside the retained
    /// window.
    pub fn find_packet_run(&self, target: SystemTime) -> Result<Vec<Packet>, LookupError> {
        if self.times.is_empty() || !(self.first_time < target && target < self.last_time) {
            return Err(LookupError::OutOfRange {
                target,
                first: self.first_time,
                last: self.last_time,
            });
        }

        let end = self
            .times
            .iter()
            .position(|t| *t >= target)
            .ok_or(LookupError::OutOfRange {
                target,
                first: self.first_time,
                last: self.last_time,
            })?;

        let start = (0..=end)
            .rev()
            .find(|&i| {
                self.packets
                    .get(&self.times[i])
                    .map(|p| p.is_keyframe)
                    .unwrap_or(false)
            })
            .ok_or(LookupError::NoKeyframe(target))?;

        Ok(self
            .times
            .range(start..=end)
            .filter_map(|t| self.packets.get(t).cloned())
            .collect())
    }

    /// Whether `target` lies within the retained window (bounds inclusive)
    pub fn covers(&self, target: SystemTime) -> bool {
        !self.times.is_empty() && self.first_time <= target && target <= self.last_time
    }

    /// Drop every entry and forget the stream clock
    pub fn clear(&mut self) {
        self.times.clear();
        self.packets.clear();
        self.bytes = 0;
        self.first_time = SystemTime::UNIX_EPOCH;
        self.last_time = SystemTime::UNIX_EPOCH;
        self.clock.reset();
    }

    /// Retained window, `None` when empty
    pub fn time_range(&self) -> Option<(SystemTime, SystemTime)> {
        (!self.times.is_empty()).then_some((self.first_time, self.last_time))
    }

    pub fn first_time(&self) -> SystemTime {
        self.first_time
    }

    pub fn last_time(&self) -> SystemTime {
        self.last_time
    }

    /// Number of retained packets
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Retained payload bytes
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn budget(&self) -> usize {
        self.budget
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn base() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn packet(ms: u64, size: usize, key: bool) -> Packet {
        Packet::new(0, Duration::from_millis(ms), key, Bytes::from(vec![0u8; size]))
    }

    /// Append with the clock anchored so stream time 0 maps to `base()`
    fn append(ring: &mut RingBuffer, ms: u64, size: usize, key: bool) -> AppendOutcome {
        ring.append_at(packet(ms, size, key), base() + Duration::from_millis(ms))
    }

    fn at(ms: u64) -> SystemTime {
        base() + Duration::from_millis(ms)
    }

    #[test]
    fn test_budget_evicts_oldest() {
        let mut ring = RingBuffer::new(1000);

        append(&mut ring, 0, 400, true);
        append(&mut ring, 1000, 400, false);
        append(&mut ring, 2000, 400, false);
        assert_eq!(ring.len(), 3);
        append(&mut ring, 3000, 400, false);

        // Over budget after t=2, so t=3 pushed out t=0
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.bytes(), 1200);
        assert_eq!(ring.first_time(), at(1000));
        assert_eq!(ring.last_time(), at(3000));

        // The keyframe at t=0 is gone, so there is nothing to decode from
        assert_eq!(
            ring.find_packet_run(at(2500)),
            Err(LookupError::NoKeyframe(at(2500)))
        );
        assert!(matches!(
            ring.find_packet_run(at(500)),
            Err(LookupError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_oversized_packet_goes_on_next_append() {
        let mut ring = RingBuffer::new(100);

        append(&mut ring, 0, 50, true);
        append(&mut ring, 40, 500, true);
        assert_eq!(ring.len(), 2);

        append(&mut ring, 80, 50, false);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.bytes(), 550);
        assert_eq!(ring.first_time(), at(40));

        append(&mut ring, 120, 50, false);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.bytes(), 100);
        assert_eq!(ring.first_time(), at(80));
    }

    #[test]
    fn test_bounds_hold_after_every_append() {
        let mut ring = RingBuffer::new(2_000);

        for i in 0..200u64 {
            let before = ring.len();
            let over = ring.bytes() > ring.budget();
            append(&mut ring, i * 40, 300, i % 10 == 0);

            // Equal-sized packets: at most one packet over the budget
            assert!(ring.bytes() <= ring.budget() + 300);
            if over {
                assert_eq!(ring.len(), before);
            }
            for t in &ring.times {
                assert!(ring.first_time() <= *t && *t <= ring.last_time());
            }
            let total: usize = ring.packets.values().map(Packet::size).sum();
            assert_eq!(total, ring.bytes());
        }
    }

    #[test]
    fn test_find_run_starts_at_keyframe() {
        let mut ring = RingBuffer::new(1_000_000);
        for i in 0..30u64 {
            append(&mut ring, i * 40, 100, i % 10 == 0);
        }

        // 530 ms falls between entries at 520 and 560
        let run = ring.find_packet_run(at(530)).unwrap();
        assert!(run[0].is_keyframe);
        assert_eq!(run[0].time, Duration::from_millis(400));
        assert_eq!(run.last().unwrap().time, Duration::from_millis(560));
        assert_eq!(run.len(), 5);

        // Exactly on an entry
        let run = ring.find_packet_run(at(520)).unwrap();
        assert_eq!(run.last().unwrap().time, Duration::from_millis(520));

        // Target on a keyframe gives a one-packet run
        let run = ring.find_packet_run(at(800)).unwrap();
        assert_eq!(run.len(), 1);
        assert!(run[0].is_keyframe);
    }

    #[test]
    fn test_find_outside_window() {
        let mut ring = RingBuffer::new(1_000_000);
        for i in 0..10u64 {
            append(&mut ring, i * 40, 100, i == 0);
        }

        // Bounds themselves are excluded
        assert!(matches!(
            ring.find_packet_run(at(0)),
            Err(LookupError::OutOfRange { .. })
        ));
        assert!(matches!(
            ring.find_packet_run(at(360)),
            Err(LookupError::OutOfRange { .. })
        ));
        assert!(ring.find_packet_run(at(10_000)).is_err());
        assert!(ring.find_packet_run(base() - Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_no_keyframe_in_window() {
        let mut ring = RingBuffer::new(1_000_000);
        for i in 0..5u64 {
            append(&mut ring, i * 40, 100, false);
        }

        assert_eq!(
            ring.find_packet_run(at(50)),
            Err(LookupError::NoKeyframe(at(50)))
        );
    }

    #[test]
    fn test_duplicate_and_out_of_order() {
        let mut ring = RingBuffer::new(1_000_000);

        assert_eq!(append(&mut ring, 0, 100, true), AppendOutcome::Stored);
        assert_eq!(append(&mut ring, 40, 100, false), AppendOutcome::Stored);
        assert_eq!(append(&mut ring, 40, 100, false), AppendOutcome::Duplicate);
        assert_eq!(append(&mut ring, 20, 100, false), AppendOutcome::OutOfOrder);

        assert_eq!(ring.len(), 2);
        assert_eq!(ring.bytes(), 200);
        assert_eq!(ring.last_time(), at(40));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut ring = RingBuffer::new(1_000);
        append(&mut ring, 0, 100, true);
        append(&mut ring, 40, 100, false);

        ring.clear();
        let once = (ring.len(), ring.bytes(), ring.first_time(), ring.last_time());
        ring.clear();
        let twice = (ring.len(), ring.bytes(), ring.first_time(), ring.last_time());

        assert_eq!(once, twice);
        assert!(ring.is_empty());
        assert_eq!(ring.first_time(), ring.last_time());
        assert!(ring.time_range().is_none());
        assert!(!ring.covers(at(20)));
    }

    #[test]
    fn test_anchor_fixes_origin() {
        let mut ring = RingBuffer::new(1_000);
        ring.anchor(base());

        // Arrival time no longer matters
        ring.append_at(packet(400, 100, true), base() + Duration::from_secs(9));
        assert_eq!(ring.first_time(), at(400));
    }

    #[test]
    fn test_clear_reanchors_clock() {
        let mut ring = RingBuffer::new(1_000);
        append(&mut ring, 5_000, 100, true);
        ring.clear();

        // Reconnected upstream restarts its clock at zero
        let now = base() + Duration::from_secs(60);
        ring.append_at(packet(0, 100, true), now);
        assert_eq!(ring.time_range(), Some((now, now)));
    }
}
