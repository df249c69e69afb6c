//! Stream registry and subscriber fan-out
//!
//! The registry owns every piece of shared per-stream state: source URL,
//! live flag, codec list and the set of attached subscribers. Other
//! components never hold references into its table; they go through the
//! registry's lock-encapsulated operations.
//!
//! # Architecture
//!
//! ```text
//!                       Arc<StreamRegistry>
//!                  ┌───────────────────────────┐
//!                  │ Mutex<HashMap<StreamId,   │
//!                  │   StreamEntry {           │
//!                  │     codecs, status,       │
//!                  │     subscribers: {id→tx}, │
//!                  │   }>>                     │
//!                  └─────────────┬─────────────┘
//!                                │
//!        ┌───────────────────────┼───────────────────────┐
//!        │                       │                       │
//!        ▼                       ▼                       ▼
//!  [Ingest worker]        [Ring feeder]          [Segment writer]
//!  broadcast(pkt) ──try_send──► packets.recv()   packets.recv()
//!  set_live(bool) ──watch────► status.changed()  status.changed()
//! ```
//!
//! # Backpressure
//!
//! Each subscriber has its own bounded queue. The broadcaster only ever uses
//! `try_send`: a full queue drops the packet for that one subscriber, so a
//! slow consumer can never stall ingestion or other consumers. Packets carry
//! their payload as `bytes::Bytes`, so the per-subscriber copy is a reference
//! count bump.

pub mod config;
pub mod entry;
pub mod error;
pub mod id;
pub mod store;
pub mod subscriber;

pub use config::{RegistryConfig, DEFAULT_QUEUE_CAPACITY};
pub use entry::{StreamDescriptor, StreamStats};
pub use error::RegistryError;
pub use id::{StreamId, SubscriberId};
pub use store::StreamRegistry;
pub use subscriber::{StreamStatus, Subscriber};
