//! Segment/time index
//!
//! Maps segment names to the wall-clock interval each segment covers, in
//! append order. Holds at most `max_count` segments; appending beyond that
//! drops the oldest entry. Deleting the dropped file is the caller's job.

use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;

use crate::error::LookupError;

use super::name::SegmentName;

/// Half-open wall-clock interval `[start, end)` covered by a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInterval {
    pub start: SystemTime,
    pub end: SystemTime,
}

impl SegmentInterval {
    pub fn new(start: SystemTime, end: SystemTime) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn contains(&self, t: SystemTime) -> bool {
        self.start <= t && t < self.end
    }
}

/// Count-bounded index of closed segments for one stream
#[derive(Debug)]
pub struct SegmentIndex {
    max_count: usize,
    names: VecDeque<SegmentName>,
    intervals: HashMap<SegmentName, SegmentInterval>,
    first_time: SystemTime,
    last_time: SystemTime,
}

impl SegmentIndex {
    /// Create an empty index holding at most `max_count` segments
    pub fn new(max_count: usize) -> Self {
        Self {
            max_count: max_count.max(1),
            names: VecDeque::new(),
            intervals: HashMap::new(),
            first_time: SystemTime::UNIX_EPOCH,
            last_time: SystemTime::UNIX_EPOCH,
        }
    }

    /// Append a closed segment, returning the names evicted to stay in bounds
    ///
    /// A segment that starts before the previous one ends truncates the
    /// previous interval, so indexed intervals never overlap.
    pub fn append(&mut self, name: SegmentName, interval: SegmentInterval) -> Vec<SegmentName> {
        if let Some(prev) = self.names.back().and_then(|n| self.intervals.get_mut(n)) {
            if interval.start < prev.end && interval.start >= prev.start {
                prev.end = interval.start;
            }
        }

        if self.names.is_empty() {
            self.first_time = interval.start;
        }
        self.last_time = interval.end;
        self.names.push_back(name);
        self.intervals.insert(name, interval);

        let mut evicted = Vec::new();
        while self.names.len() > self.max_count && self.names.len() > 1 {
            if let Some(oldest) = self.names.pop_front() {
                self.intervals.remove(&oldest);
                evicted.push(oldest);
            }
            self.first_time = self.head_start();
        }
        evicted
    }

    /// Segment whose interval contains `target`, with its start time
    ///
    /// `target` must lie strictly inside the indexed window.
    pub fn find_segment(
        &self,
        target: SystemTime,
    ) -> Result<(SegmentName, SystemTime), LookupError> {
        if self.names.is_empty() || !(self.first_time < target && target < self.last_time) {
            return Err(LookupError::OutOfRange {
                target,
                first: self.first_time,
                last: self.last_time,
            });
        }

        // Linear scan; retention keeps the segment count small
        self.names
            .iter()
            .find_map(|name| {
                let interval = self.intervals.get(name)?;
                interval.contains(target).then_some((*name, interval.start))
            })
            .ok_or(LookupError::NoSegment(target))
    }

    /// Drop a segment's entry, e.g. because its file is gone
    pub fn remove(&mut self, name: SegmentName) -> bool {
        if self.intervals.remove(&name).is_none() {
            return false;
        }
        self.names.retain(|n| *n != name);

        if let Some(last) = self.names.back().and_then(|n| self.intervals.get(n)) {
            self.last_time = last.end;
        }
        self.first_time = self.head_start();
        true
    }

    fn head_start(&self) -> SystemTime {
        self.names
            .front()
            .and_then(|n| self.intervals.get(n))
            .map(|i| i.start)
            .unwrap_or(self.last_time)
    }

    pub fn contains(&self, name: SegmentName) -> bool {
        self.intervals.contains_key(&name)
    }

    pub fn interval(&self, name: SegmentName) -> Option<SegmentInterval> {
        self.intervals.get(&name).copied()
    }

    /// Indexed segments, oldest first
    pub fn names(&self) -> impl Iterator<Item = SegmentName> + '_ {
        self.names.iter().copied()
    }

    /// Indexed window, `None` when empty
    pub fn time_range(&self) -> Option<(SystemTime, SystemTime)> {
        (!self.names.is_empty()).then_some((self.first_time, self.last_time))
    }

    pub fn first_time(&self) -> SystemTime {
        self.first_time
    }

    pub fn last_time(&self) -> SystemTime {
        self.last_time
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    fn name(n: u64) -> SegmentName {
        SegmentName::from_millis(n)
    }

    /// Ten-second segments back to back
    fn filled(max: usize, count: u64) -> SegmentIndex {
        let mut index = SegmentIndex::new(max);
        for i in 0..count {
            index.append(name(i), SegmentInterval::new(at(i * 10), at(i * 10 + 10)));
        }
        index
    }

    #[test]
    fn test_eviction_keeps_most_recent() {
        let mut index = SegmentIndex::new(3);
        let mut evicted = Vec::new();
        for i in 0..7u64 {
            evicted.extend(index.append(name(i), SegmentInterval::new(at(i * 10), at(i * 10 + 10))));
            assert!(index.len() <= 3);
        }

        assert_eq!(index.len(), 3);
        assert_eq!(index.names().collect::<Vec<_>>(), vec![name(4), name(5), name(6)]);
        assert_eq!(evicted, vec![name(0), name(1), name(2), name(3)]);
        assert_eq!(index.first_time(), at(40));
        assert_eq!(index.last_time(), at(70));
    }

    #[test]
    fn test_find_segment() {
        let index = filled(5, 3);

        assert_eq!(index.find_segment(at(15)).unwrap(), (name(1), at(10)));
        // Interval start belongs to the segment, end to the next one
        assert_eq!(index.find_segment(at(20)).unwrap(), (name(2), at(20)));
        assert_eq!(index.find_segment(at(5)).unwrap(), (name(0), at(0)));
    }

    #[test]
    fn test_find_outside_window() {
        let index = filled(5, 3);

        assert!(matches!(
            index.find_segment(at(0)),
            Err(LookupError::OutOfRange { .. })
        ));
        assert!(index.find_segment(at(30)).is_err());
        assert!(index.find_segment(at(100)).is_err());
        assert!(SegmentIndex::new(5).find_segment(at(1)).is_err());
    }

    #[test]
    fn test_gap_between_segments() {
        let mut index = SegmentIndex::new(5);
        index.append(name(0), SegmentInterval::new(at(0), at(10)));
        index.append(name(1), SegmentInterval::new(at(20), at(30)));

        assert_eq!(index.find_segment(at(15)), Err(LookupError::NoSegment(at(15))));
    }

    #[test]
    fn test_overlap_truncates_previous() {
        let mut index = SegmentIndex::new(5);
        index.append(name(0), SegmentInterval::new(at(0), at(12)));
        index.append(name(1), SegmentInterval::new(at(10), at(20)));

        assert_eq!(index.interval(name(0)).unwrap().end, at(10));
        assert_eq!(index.find_segment(at(11)).unwrap().0, name(1));
    }

    #[test]
    fn test_single_entry_never_evicted() {
        let mut index = SegmentIndex::new(0);
        assert_eq!(index.max_count(), 1);

        index.append(name(0), SegmentInterval::new(at(0), at(10)));
        let evicted = index.append(name(1), SegmentInterval::new(at(10), at(20)));
        assert_eq!(evicted, vec![name(0)]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.first_time(), at(10));
    }

    #[test]
    fn test_remove() {
        let mut index = filled(5, 3);

        assert!(index.remove(name(0)));
        assert!(!index.remove(name(0)));
        assert_eq!(index.first_time(), at(10));

        assert!(index.remove(name(2)));
        assert_eq!(index.last_time(), at(20));
        assert_eq!(index.time_range(), Some((at(10), at(20))));

        assert!(index.remove(name(1)));
        assert!(index.is_empty());
        assert!(index.time_range().is_none());
        assert_eq!(index.first_time(), index.last_time());
    }
}
