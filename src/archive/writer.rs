//! Segment writer
//!
//! Turns a subscriber's live packet feed into closed segment files of roughly
//! `max_file_size` bytes each. Segments always start on a video keyframe:
//!
//! ```text
//!   feed:     P P K P P P K P P K P P P K P P ...
//!             ╰┬╯ ╰───┬───────╯ ╰────┬────╯
//!          dropped  segment 1     segment 2 ...
//!                             ▲
//!               size ≥ max at this keyframe: it opens the next segment
//! ```
//!
//! Each segment is written under a temporary name and renamed only after its
//! trailer is on disk, then indexed with the wall-clock interval from its
//! first packet to its last video packet.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::container::SegmentMuxer;
use crate::error::ContainerError;
use crate::media::{video_stream_index, CodecDescriptor, Packet};
use crate::registry::{StreamStatus, Subscriber};

use super::clock::StreamClock;
use super::index::SegmentInterval;
use super::name::SegmentName;
use super::store::SegmentStore;

/// A video timestamp stepping back further than this means the feed restarted
pub const STALE_REGRESSION: Duration = Duration::from_secs(10);

/// Why a writer session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The stream went offline
    Offline,
    /// The subscription was closed
    Closed,
    /// The upstream reconnected
    NewSession,
    /// New codecs were published
    CodecChange,
    /// Video time jumped back beyond [`STALE_REGRESSION`]
    StaleFeed,
    /// A segment could not be created or written
    WriteFailed,
}

enum SegmentEnd {
    /// Size threshold hit at a keyframe; continue with the next segment
    Boundary,
    Session(SessionEnd),
}

/// State carried across segments within one upstream session
struct SessionState {
    video_index: usize,
    clock: StreamClock,
    /// Recording begins at the first video keyframe
    started: bool,
    last_video_time: Option<Duration>,
    /// Keyframe that closed the previous segment and opens the next
    carried: Option<Packet>,
}

/// A segment being written
struct OpenSegment {
    name: SegmentName,
    temp_path: PathBuf,
    muxer: Box<dyn SegmentMuxer>,
    /// Video payload bytes written
    size: usize,
    base_time: Option<Duration>,
    start: Option<SystemTime>,
    /// Presentation offset of the last video packet from `base_time`
    end_offset: Duration,
}

impl OpenSegment {
    fn write(
        &mut self,
        packet: &Packet,
        primary: bool,
        clock: &StreamClock,
    ) -> Result<(), ContainerError> {
        self.muxer.write_packet(packet)?;

        let base = *self.base_time.get_or_insert(packet.time);
        if self.start.is_none() {
            self.start = clock.at(packet.time);
        }
        if primary {
            self.size += packet.size();
            self.end_offset = packet.time.saturating_sub(base)
                + packet.composition_time.unwrap_or_default();
        }
        Ok(())
    }
}

/// Writes one stream's segments into its [`SegmentStore`]
pub struct SegmentWriter {
    store: Arc<SegmentStore>,
    max_file_size: usize,
    last_name: Option<SegmentName>,
}

impl SegmentWriter {
    /// Create a writer closing segments once they reach `max_file_size` bytes
    pub fn new(store: Arc<SegmentStore>, max_file_size: usize) -> Self {
        Self {
            store,
            max_file_size,
            last_name: None,
        }
    }

    /// Continue naming after an existing segment
    pub fn resume_after(mut self, last: Option<SegmentName>) -> Self {
        self.last_name = last;
        self
    }

    pub fn store(&self) -> &Arc<SegmentStore> {
        &self.store
    }

    /// Record one upstream session
    ///
    /// `status` is the stream status the session was started under; any
    /// change of liveness, session or codecs ends it. Every segment opened is
    /// finalized before this returns.
    pub async fn run_session(
        &mut self,
        codecs: &[CodecDescriptor],
        status: StreamStatus,
        sub: &mut Subscriber,
    ) -> SessionEnd {
        let mut state = SessionState {
            video_index: video_stream_index(codecs),
            clock: StreamClock::new(),
            started: false,
            last_video_time: None,
            carried: None,
        };

        loop {
            let mut segment = match self.open_segment(codecs) {
                Ok(segment) => segment,
                Err(e) => {
                    tracing::error!(
                        stream = %self.store.stream(),
                        error = %e,
                        "Can't create segment"
                    );
                    return SessionEnd::WriteFailed;
                }
            };

            let end = match state.carried.take() {
                Some(key) => match segment.write(&key, true, &state.clock) {
                    Ok(()) => {
                        state.last_video_time = Some(key.time);
                        self.fill_segment(&mut segment, &mut state, status, sub).await
                    }
                    Err(e) => {
                        tracing::error!(
                            stream = %self.store.stream(),
                            segment = %segment.name,
                            error = %e,
                            "Segment write failed"
                        );
                        SegmentEnd::Session(SessionEnd::WriteFailed)
                    }
                },
                None => self.fill_segment(&mut segment, &mut state, status, sub).await,
            };

            self.finalize(segment).await;

            match end {
                SegmentEnd::Boundary => continue,
                SegmentEnd::Session(reason) => {
                    tracing::debug!(
                        stream = %self.store.stream(),
                        reason = ?reason,
                        "Segment writer session ended"
                    );
                    return reason;
                }
            }
        }
    }

    fn open_segment(&mut self, codecs: &[CodecDescriptor]) -> Result<OpenSegment, ContainerError> {
        let name = SegmentName::next_after(self.last_name, SystemTime::now());
        self.last_name = Some(name);

        let temp_path = self.store.temp_path(name);
        let mut muxer = self.store.format().create(&temp_path)?;
        if let Err(e) = muxer.write_header(codecs) {
            drop(muxer);
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }

        Ok(OpenSegment {
            name,
            temp_path,
            muxer,
            size: 0,
            base_time: None,
            start: None,
            end_offset: Duration::ZERO,
        })
    }

    async fn fill_segment(
        &self,
        segment: &mut OpenSegment,
        state: &mut SessionState,
        status: StreamStatus,
        sub: &mut Subscriber,
    ) -> SegmentEnd {
        loop {
            tokio::select! {
                biased;

                changed = sub.status.changed() => {
                    if changed.is_err() {
                        return SegmentEnd::Session(SessionEnd::Closed);
                    }
                    let current = *sub.status.borrow_and_update();
                    if !current.live {
                        return SegmentEnd::Session(SessionEnd::Offline);
                    }
                    if current.is_new_session(&status) {
                        return SegmentEnd::Session(SessionEnd::NewSession);
                    }
                    if current.codec_version != status.codec_version {
                        return SegmentEnd::Session(SessionEnd::CodecChange);
                    }
                }

                packet = sub.packets.recv() => {
                    let Some(packet) = packet else {
                        return SegmentEnd::Session(SessionEnd::Closed);
                    };

                    if !state.clock.is_anchored() {
                        match sub.current_status().origin {
                            Some(origin) => state.clock.anchor_at(origin),
                            None => {
                                state.clock.anchor(&packet, SystemTime::now());
                            }
                        }
                    }
                    let primary = packet.stream_index == state.video_index;

                    if primary && state.started {
                        if let Some(last) = state.last_video_time {
                            if packet.time <= last {
                                let regression = last - packet.time;
                                if regression > STALE_REGRESSION {
                                    tracing::warn!(
                                        stream = %self.store.stream(),
                                        regression_ms = regression.as_millis() as u64,
                                        "Video time jumped back, treating feed as stale"
                                    );
                                    return SegmentEnd::Session(SessionEnd::StaleFeed);
                                }
                                tracing::warn!(
                                    stream = %self.store.stream(),
                                    time_ms = packet.time.as_millis() as u64,
                                    last_ms = last.as_millis() as u64,
                                    "Non-increasing video timestamp, packet dropped"
                                );
                                continue;
                            }
                        }
                    }

                    if primary && packet.is_keyframe {
                        if state.started && segment.size >= self.max_file_size {
                            state.carried = Some(packet);
                            return SegmentEnd::Boundary;
                        }
                        state.started = true;
                    }

                    if !state.started {
                        continue;
                    }

                    if let Err(e) = segment.write(&packet, primary, &state.clock) {
                        tracing::error!(
                            stream = %self.store.stream(),
                            segment = %segment.name,
                            error = %e,
                            "Segment write failed"
                        );
                        return SegmentEnd::Session(SessionEnd::WriteFailed);
                    }
                    if primary {
                        state.last_video_time = Some(packet.time);
                    }
                }
            }
        }
    }

    /// Write the trailer, rename to the final name and index the segment
    ///
    /// Segments that recorded nothing, or failed to finish, are removed.
    async fn finalize(&self, segment: OpenSegment) {
        let OpenSegment {
            name,
            temp_path,
            mut muxer,
            start,
            end_offset,
            ..
        } = segment;

        let Some(start) = start else {
            drop(muxer);
            let _ = std::fs::remove_file(&temp_path);
            return;
        };

        // Trailer, fsync and rename block; keep them off the runtime threads
        let final_path = self.store.segment_path(name);
        let from = temp_path.clone();
        let result = tokio::task::spawn_blocking(move || {
            muxer.write_trailer(start)?;
            drop(muxer);
            std::fs::rename(&from, &final_path).map_err(ContainerError::from)
        })
        .await
        .unwrap_or_else(|e| Err(ContainerError::Io(std::io::Error::other(e))));

        match result {
            Ok(()) => {
                self.store
                    .commit(name, SegmentInterval::new(start, start + end_offset))
                    .await;
            }
            Err(e) => {
                tracing::error!(
                    stream = %self.store.stream(),
                    segment = %name,
                    error = %e,
                    "Can't finalize segment, discarding it"
                );
                let _ = std::fs::remove_file(&temp_path);
            }
        }
    }
}
