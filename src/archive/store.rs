//! On-disk segment store
//!
//! One directory per recorded stream holding finalized segment files, plus
//! the in-memory [`SegmentIndex`] over them. The directory is the source of
//! truth at startup: [`SegmentStore::open`] rebuilds the index from the files
//! found there, so lookups work right after a restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex;

use crate::container::ContainerFormat;
use crate::error::{Error, LookupError};
use crate::media::{video_stream_index, CodecDescriptor, Packet};
use crate::registry::StreamId;

use super::index::{SegmentIndex, SegmentInterval};
use super::name::SegmentName;

/// Closed segments of one stream
pub struct SegmentStore {
    stream: StreamId,
    directory: PathBuf,
    format: Arc<dyn ContainerFormat>,
    index: Mutex<SegmentIndex>,
}

impl SegmentStore {
    /// Open the store in `directory`, creating it if needed
    ///
    /// Existing segments are indexed oldest first; files that cannot be read
    /// are skipped. Segment files left out of the index (unreadable, beyond
    /// `max_count`) and interrupted `.part` files are deleted.
    pub async fn open(
        stream: StreamId,
        directory: impl Into<PathBuf>,
        max_count: usize,
        format: Arc<dyn ContainerFormat>,
    ) -> Result<Self, Error> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;

        let store = Self {
            stream,
            directory,
            format,
            index: Mutex::new(SegmentIndex::new(max_count)),
        };

        let recovered = store.recover().await?;
        let removed = store.evict_stale().await;

        tracing::info!(
            stream = %store.stream,
            directory = %store.directory.display(),
            segments = recovered,
            removed = removed,
            "Segment store opened"
        );
        Ok(store)
    }

    async fn recover(&self) -> Result<usize, Error> {
        let extension = self.format.extension();

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            let file_name = entry.file_name();
            match file_name.to_str().and_then(|f| SegmentName::parse(f, extension)) {
                Some(name) => names.push(name),
                None => {
                    tracing::debug!(
                        stream = %self.stream,
                        file = ?file_name,
                        "Not a segment file"
                    );
                }
            }
        }
        names.sort();

        let mut index = self.index.lock().await;
        let mut recovered = 0;
        for name in names {
            let path = self.segment_path(name);
            let info = match self.format.open(&path) {
                Ok(demuxer) => demuxer.info(),
                Err(e) => {
                    tracing::warn!(
                        stream = %self.stream,
                        segment = %name,
                        error = %e,
                        "Unreadable segment skipped"
                    );
                    continue;
                }
            };

            if info.creation_time == SystemTime::UNIX_EPOCH {
                tracing::warn!(
                    stream = %self.stream,
                    segment = %name,
                    "Segment without creation time skipped"
                );
                continue;
            }

            let interval = SegmentInterval::new(info.creation_time, info.creation_time + info.duration);
            index.append(name, interval);
            recovered += 1;
        }

        Ok(recovered.min(index.len()))
    }

    /// Stream this store belongs to
    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn format(&self) -> &Arc<dyn ContainerFormat> {
        &self.format
    }

    /// Path of a finalized segment
    pub fn segment_path(&self, name: SegmentName) -> PathBuf {
        self.directory.join(name.file_name(self.format.extension()))
    }

    /// Path of a segment while it is being written
    pub fn temp_path(&self, name: SegmentName) -> PathBuf {
        self.directory.join(name.temp_file_name(self.format.extension()))
    }

    /// Index a finalized segment, then delete whatever fell out of the index
    pub async fn commit(&self, name: SegmentName, interval: SegmentInterval) {
        let evicted = self.index.lock().await.append(name, interval);

        tracing::info!(
            stream = %self.stream,
            segment = %name,
            duration_ms = interval
                .end
                .duration_since(interval.start)
                .unwrap_or_default()
                .as_millis() as u64,
            "Segment indexed"
        );

        for old in evicted {
            self.remove_file(&self.segment_path(old));
        }
        self.evict_stale().await;
    }

    /// Delete segment files that are not indexed, and leftover temp files
    ///
    /// Files not named like segments are left alone. Returns the number of
    /// files removed.
    pub async fn evict_stale(&self) -> usize {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(
                    stream = %self.stream,
                    error = %e,
                    "Can't list segment directory"
                );
                return 0;
            }
        };

        let index = self.index.lock().await;
        let extension = self.format.extension();
        let mut removed = 0;

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let stale = match SegmentName::parse(file_name, extension) {
                Some(name) => !index.contains(name),
                None => SegmentName::parse_temp(file_name, extension).is_some(),
            };

            if stale && self.remove_file(&path) {
                removed += 1;
            }
        }
        removed
    }

    fn remove_file(&self, path: &Path) -> bool {
        match std::fs::remove_file(path) {
            Ok(()) => {
                tracing::debug!(stream = %self.stream, path = %path.display(), "Segment file removed");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!(
                    stream = %self.stream,
                    path = %path.display(),
                    error = %e,
                    "Can't remove segment file"
                );
                false
            }
        }
    }

    /// Segment covering `target`, with its start time
    pub async fn find_segment(
        &self,
        target: SystemTime,
    ) -> Result<(SegmentName, SystemTime), LookupError> {
        self.index.lock().await.find_segment(target)
    }

    /// Read the packet run at `offset` into a segment
    ///
    /// Seeks to the last keyframe at or before `offset` and reads until the
    /// video track (audio in audio-only files) reaches it. Returns the codecs
    /// from the file header with the run.
    pub fn find_in_file(
        &self,
        name: SegmentName,
        offset: Duration,
    ) -> Result<(Vec<CodecDescriptor>, Vec<Packet>), Error> {
        let path = self.segment_path(name);
        if !path.exists() {
            return Err(LookupError::SegmentMissing(path).into());
        }

        let mut demuxer = self.format.open(&path)?;
        let codecs = demuxer.codecs().to_vec();
        demuxer.seek_to_time(offset)?;

        // Audio interleaved past the target does not end the run early
        let primary = video_stream_index(&codecs);
        let mut packets = Vec::new();
        while let Some(packet) = demuxer.read_packet()? {
            let reached = packet.stream_index == primary && demuxer.current_time() >= offset;
            packets.push(packet);
            if reached {
                break;
            }
        }

        Ok((codecs, packets))
    }

    /// Packet run at `target` from disk
    ///
    /// An indexed segment whose file has disappeared is dropped from the
    /// index.
    pub async fn find_packets(
        &self,
        target: SystemTime,
    ) -> Result<(Vec<CodecDescriptor>, Vec<Packet>), Error> {
        let (name, start) = self.find_segment(target).await?;
        let offset = target.duration_since(start).unwrap_or_default();

        match self.find_in_file(name, offset) {
            Err(Error::Lookup(LookupError::SegmentMissing(path))) => {
                tracing::warn!(
                    stream = %self.stream,
                    segment = %name,
                    "Indexed segment missing on disk, dropping it from the index"
                );
                self.index.lock().await.remove(name);
                Err(LookupError::SegmentMissing(path).into())
            }
            result => result,
        }
    }

    /// Indexed window, `None` when no segment is indexed
    pub async fn time_range(&self) -> Option<(SystemTime, SystemTime)> {
        self.index.lock().await.time_range()
    }

    /// Indexed segments, oldest first
    pub async fn segments(&self) -> Vec<(SegmentName, SegmentInterval)> {
        let index = self.index.lock().await;
        index
            .names()
            .filter_map(|n| index.interval(n).map(|i| (n, i)))
            .collect()
    }

    /// Newest indexed segment name
    pub async fn last_segment(&self) -> Option<SegmentName> {
        self.index.lock().await.names().last()
    }
}
