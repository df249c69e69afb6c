//! Upstream media source seam
//!
//! The worker only needs three things from an upstream connection: the codec
//! list it negotiated, a queue of packets in read order, and out-of-band
//! signals. Anything that can provide those (RTSP, a file, a test script)
//! can feed the relay.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SourceError;
use crate::media::{CodecDescriptor, Packet};

/// Out-of-band event from an established upstream session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSignal {
    /// The source renegotiated its codecs; the list replaces the previous one
    CodecUpdate(Vec<CodecDescriptor>),
    /// The source stopped delivering media
    Stopped,
}

/// Per-connection options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Do not set up audio tracks
    pub disable_audio: bool,
}

/// An established upstream session
///
/// Dropping the session tears the upstream connection down: the source sees
/// its queues closed and stops reading. A closed signal channel means the
/// session is over.
#[derive(Debug)]
pub struct SourceSession {
    /// Codecs negotiated at connect time, indexed by `Packet::stream_index`
    pub codecs: Vec<CodecDescriptor>,
    /// Packets in upstream read order
    pub packets: mpsc::Receiver<Packet>,
    pub signals: mpsc::Receiver<SourceSignal>,
}

/// Something the ingestion worker can connect to
#[async_trait]
pub trait MediaSource: Send + Sync + 'static {
    /// Connect to `url` and start delivering media
    ///
    /// The worker bounds this call with its dial timeout.
    async fn connect(&self, url: &str, options: &ConnectOptions)
        -> Result<SourceSession, SourceError>;
}
