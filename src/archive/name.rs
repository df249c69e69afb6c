//! Segment file naming
//!
//! A segment's name is the unix-millisecond time it was opened. Names are
//! strictly increasing within a store, so sorting names sorts segments
//! chronologically. Finalized files are `<millis>.<ext>`; files still being
//! written carry an extra `.part` suffix and are never indexed.

use std::time::SystemTime;

const TEMP_SUFFIX: &str = "part";

/// Identity and sort key of one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentName(u64);

impl SegmentName {
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn millis(&self) -> u64 {
        self.0
    }

    /// Name for a segment opened at `now`, strictly after `last`
    pub fn next_after(last: Option<SegmentName>, now: SystemTime) -> Self {
        let now_ms = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        match last {
            Some(last) if last.0 >= now_ms => Self(last.0 + 1),
            _ => Self(now_ms),
        }
    }

    /// Final file name
    pub fn file_name(&self, extension: &str) -> String {
        format!("{}.{}", self.0, extension)
    }

    /// File name while the segment is being written
    pub fn temp_file_name(&self, extension: &str) -> String {
        format!("{}.{}.{}", self.0, extension, TEMP_SUFFIX)
    }

    /// Parse a final file name; temp files and foreign files give `None`
    pub fn parse(file_name: &str, extension: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(extension)?.strip_suffix('.')?;
        if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stem.parse().ok().map(Self)
    }

    /// Parse a temp file name left by an unfinished segment
    pub fn parse_temp(file_name: &str, extension: &str) -> Option<Self> {
        let name = file_name.strip_suffix(TEMP_SUFFIX)?.strip_suffix('.')?;
        Self::parse(name, extension)
    }
}

impl std::fmt::Display for SegmentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
